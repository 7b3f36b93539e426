//! Docker 容器执行器（bollard）
//!
//! 构造时 ping 守护进程；每次调用：临时目录只读挂载到 /workspace → 按需拉取镜像 →
//! create → start → 与超时竞速 wait → 按流类型读取有上限的日志 → 无论成败（包括调用被取消）强制删除容器。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::StreamExt;
use uuid::Uuid;

use crate::sandbox::demux;
use crate::sandbox::policy::CONTAINER_MAX_MEMORY_MB;
use crate::sandbox::utils::{OutputCapture, ScratchDir};
use crate::sandbox::{
    CodeExecutionResult, CodeExecutor, ExecutionRequest, FilesystemScope, Language, NetworkAccess,
    SandboxError, SandboxPolicy, DEFAULT_OUTPUT_LIMIT, TIMEOUT_EXIT_CODE,
};

const WORKSPACE_MOUNT: &str = "/workspace";
const PIDS_LIMIT: i64 = 128;
const CONTAINER_LABEL: &str = "drone.sandbox";
/// 容器内只转发与区域设置相关的变量，PATH/HOME 等由镜像决定
const CONTAINER_ENV_ALLOW_LIST: &[&str] = &["LANG", "LC_ALL", "TZ"];

pub struct DockerExecutor {
    docker: Docker,
    policy: SandboxPolicy,
    scratch_root: PathBuf,
    output_limit: usize,
}

impl DockerExecutor {
    /// 校验策略（内存 ≤ 4096MB）并确认守护进程可达
    pub async fn connect(policy: SandboxPolicy) -> Result<Self, SandboxError> {
        policy.ensure_within(CONTAINER_MAX_MEMORY_MB)?;
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::RuntimeUnavailable(e.to_string()))?;
        docker
            .ping()
            .await
            .map_err(|e| SandboxError::RuntimeUnavailable(format!("docker ping failed: {}", e)))?;
        tracing::info!(
            memory_mb = policy.max_memory_mb(),
            cpu_seconds = policy.max_cpu_seconds(),
            "docker sandbox ready"
        );
        let scratch_root = std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(".drone_tmp");
        Ok(Self {
            docker,
            policy,
            scratch_root,
            output_limit: DEFAULT_OUTPUT_LIMIT,
        })
    }

    /// 临时目录根：必须是 Docker 守护进程可挂载的宿主路径
    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = root.into();
        self
    }

    pub fn with_output_limit(mut self, limit: usize) -> Self {
        self.output_limit = limit;
        self
    }

    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => return Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => return Err(SandboxError::Image(e.to_string())),
        }

        tracing::info!(image, "pulling sandbox image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            let info = progress
                .map_err(|e| SandboxError::Image(format!("failed to pull {}: {}", image, e)))?;
            if let Some(error) = info.error {
                return Err(SandboxError::Image(format!("failed to pull {}: {}", image, error)));
            }
        }
        Ok(())
    }

    async fn run(
        &self,
        scratch: &ScratchDir,
        language: Language,
        request: &ExecutionRequest,
        started: Instant,
    ) -> Result<CodeExecutionResult, SandboxError> {
        let image = language.container_image().ok_or_else(|| {
            SandboxError::UnsupportedLanguage(format!("{} (not available in containers)", language))
        })?;
        self.ensure_image(image).await?;

        let timeout = request.timeout.unwrap_or_else(|| self.policy.timeout());
        let config = Config {
            image: Some(image.to_string()),
            cmd: Some(language.container_command(scratch.script_name())),
            env: Some(container_environment(&request.environment)),
            working_dir: Some(WORKSPACE_MOUNT.to_string()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            network_disabled: Some(self.policy.network_access() == NetworkAccess::None),
            labels: Some(HashMap::from([(
                CONTAINER_LABEL.to_string(),
                "true".to_string(),
            )])),
            host_config: Some(host_config(&self.policy, scratch.path())),
            ..Default::default()
        };

        let name = format!("drone-exec-{}", Uuid::new_v4().simple());
        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| SandboxError::Container(e.to_string()))?;
        tracing::debug!(container = %created.id, image, "container created");

        let container = ContainerGuard::new(self.docker.clone(), created.id);
        let outcome = self.drive(container.id(), timeout, started).await;
        container.remove().await;
        outcome
    }

    async fn drive(
        &self,
        id: &str,
        timeout: Duration,
        started: Instant,
    ) -> Result<CodeExecutionResult, SandboxError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::Container(e.to_string()))?;

        let (exit_code, timed_out) = match tokio::time::timeout(timeout, self.wait_exit(id)).await {
            Ok(code) => (code?, false),
            Err(_) => {
                if let Err(e) = self
                    .docker
                    .kill_container(id, None::<KillContainerOptions<String>>)
                    .await
                {
                    tracing::debug!(container = id, error = %e, "kill after timeout failed");
                }
                tracing::warn!(container = id, timeout_ms = timeout.as_millis() as u64, "container execution timed out");
                (TIMEOUT_EXIT_CODE, true)
            }
        };

        let (stdout, stderr) = self.collect_logs(id).await?;
        let (stdout, out_truncated) = stdout.finish();
        let (mut stderr, err_truncated) = stderr.finish();
        if timed_out {
            if !stderr.is_empty() && !stderr.ends_with('\n') {
                stderr.push('\n');
            }
            stderr.push_str(&SandboxError::Timeout(timeout).to_string());
        }

        Ok(CodeExecutionResult {
            stdout,
            stderr,
            exit_code,
            duration_ms: started.elapsed().as_millis() as u64,
            truncated: out_truncated || err_truncated,
            timed_out,
        })
    }

    /// 非零退出时 bollard 以 DockerContainerWaitError 返回退出码
    async fn wait_exit(&self, id: &str) -> Result<i32, SandboxError> {
        let mut stream = self
            .docker
            .wait_container(id, None::<WaitContainerOptions<String>>);
        let mut exit_code = 0i64;
        while let Some(item) = stream.next().await {
            match item {
                Ok(response) => exit_code = response.status_code,
                Err(bollard::errors::Error::DockerContainerWaitError { code, .. }) => {
                    exit_code = code
                }
                Err(e) => return Err(SandboxError::Container(e.to_string())),
            }
        }
        Ok(i32::try_from(exit_code).unwrap_or(-1))
    }

    /// 逐块写入有上限的缓冲，只保留每路前 output_limit 字节
    async fn collect_logs(&self, id: &str) -> Result<(OutputCapture, OutputCapture), SandboxError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            ..Default::default()
        };
        let mut stream = self.docker.logs(id, Some(options));
        let mut stdout = OutputCapture::new(self.output_limit);
        let mut stderr = OutputCapture::new(self.output_limit);
        while let Some(item) = stream.next().await {
            match item.map_err(|e| SandboxError::Container(e.to_string()))? {
                LogOutput::StdOut { message } => stdout.push(&message),
                LogOutput::StdErr { message } => stderr.push(&message),
                LogOutput::Console { message } => {
                    let (mut out, mut err) = (Vec::new(), Vec::new());
                    demux::split_into(&message, &mut out, &mut err);
                    stdout.push(&out);
                    stderr.push(&err);
                }
                LogOutput::StdIn { .. } => {}
            }
        }
        Ok((stdout, stderr))
    }
}

/// 已创建的容器：remove 或 drop 时强制删除，调用被取消时同样不会遗留容器
struct ContainerGuard {
    docker: Docker,
    id: String,
    removed: bool,
}

impl ContainerGuard {
    fn new(docker: Docker, id: String) -> Self {
        Self {
            docker,
            id,
            removed: false,
        }
    }

    fn id(&self) -> &str {
        &self.id
    }

    async fn remove(mut self) {
        self.removed = true;
        force_remove(&self.docker, &self.id).await;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(container = %self.id, "no runtime to remove abandoned container");
            return;
        };
        let docker = self.docker.clone();
        let id = std::mem::take(&mut self.id);
        tracing::debug!(container = %id, "removing abandoned container");
        handle.spawn(async move { force_remove(&docker, &id).await });
    }
}

async fn force_remove(docker: &Docker, id: &str) {
    let options = RemoveContainerOptions {
        force: true,
        v: true,
        ..Default::default()
    };
    if let Err(e) = docker.remove_container(id, Some(options)).await {
        tracing::debug!(container = id, error = %e, "container removal failed");
    }
}

#[async_trait]
impl CodeExecutor for DockerExecutor {
    fn kind(&self) -> &'static str {
        "docker"
    }

    fn policy(&self) -> &SandboxPolicy {
        &self.policy
    }

    async fn execute(&self, request: ExecutionRequest) -> CodeExecutionResult {
        let started = Instant::now();
        let language = match request.language.parse::<Language>() {
            Ok(language) => language,
            Err(e) => return CodeExecutionResult::from_error(&e, 0),
        };
        if language.container_image().is_none() {
            let err = SandboxError::UnsupportedLanguage(format!(
                "{} (not available in containers)",
                language
            ));
            return CodeExecutionResult::from_error(&err, 0);
        }
        let scratch = match ScratchDir::create(&self.scratch_root, &request, language).await {
            Ok(scratch) => scratch,
            Err(e) => {
                return CodeExecutionResult::from_error(&e, started.elapsed().as_millis() as u64)
            }
        };

        let result = self.run(&scratch, language, &request, started).await;
        scratch.cleanup().await;

        match result {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(language = %language, error = %e, "container execution failed");
                CodeExecutionResult::from_error(&e, started.elapsed().as_millis() as u64)
            }
        }
    }
}

pub(crate) fn network_mode(access: NetworkAccess) -> &'static str {
    match access {
        NetworkAccess::None => "none",
        NetworkAccess::Outbound | NetworkAccess::Full => "bridge",
    }
}

pub(crate) fn host_config(policy: &SandboxPolicy, scratch: &Path) -> HostConfig {
    let memory = policy.memory_bytes() as i64;
    let scope = policy.filesystem_scope();
    let tmpfs = (scope != FilesystemScope::Workspace)
        .then(|| HashMap::from([("/tmp".to_string(), "rw,size=64m".to_string())]));
    HostConfig {
        memory: Some(memory),
        memory_swap: Some(memory),
        nano_cpus: Some(1_000_000_000),
        network_mode: Some(network_mode(policy.network_access()).to_string()),
        binds: Some(vec![format!(
            "{}:{}:ro",
            scratch.display(),
            WORKSPACE_MOUNT
        )]),
        cap_drop: Some(vec!["ALL".to_string()]),
        security_opt: Some(vec!["no-new-privileges".to_string()]),
        pids_limit: Some(PIDS_LIMIT),
        readonly_rootfs: Some(scope == FilesystemScope::Sandbox),
        tmpfs,
        privileged: Some(false),
        auto_remove: Some(false),
        ..Default::default()
    }
}

fn container_environment(overrides: &HashMap<String, String>) -> Vec<String> {
    let mut env: Vec<String> = std::env::vars()
        .filter(|(k, _)| CONTAINER_ENV_ALLOW_LIST.contains(&k.as_str()))
        .filter(|(k, _)| !overrides.contains_key(k))
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    env.extend(overrides.iter().map(|(k, v)| format!("{}={}", k, v)));
    env
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_config_limits() {
        let policy =
            SandboxPolicy::new(10, 256, NetworkAccess::None, FilesystemScope::Sandbox).unwrap();
        let config = host_config(&policy, Path::new("/tmp/drone-exec-x"));
        assert_eq!(config.memory, Some(256 * 1024 * 1024));
        assert_eq!(config.memory_swap, config.memory);
        assert_eq!(config.nano_cpus, Some(1_000_000_000));
        assert_eq!(config.network_mode.as_deref(), Some("none"));
        assert_eq!(
            config.binds,
            Some(vec!["/tmp/drone-exec-x:/workspace:ro".to_string()])
        );
        assert_eq!(config.cap_drop, Some(vec!["ALL".to_string()]));
        assert_eq!(config.readonly_rootfs, Some(true));
        assert!(config.tmpfs.is_some());
    }

    #[test]
    fn test_network_mode_mapping() {
        assert_eq!(network_mode(NetworkAccess::None), "none");
        assert_eq!(network_mode(NetworkAccess::Outbound), "bridge");
        assert_eq!(network_mode(NetworkAccess::Full), "bridge");
    }

    #[test]
    fn test_container_environment_overrides_win() {
        let overrides = HashMap::from([("LANG".to_string(), "C".to_string())]);
        let env = container_environment(&overrides);
        assert_eq!(env.iter().filter(|e| e.starts_with("LANG=")).count(), 1);
        assert!(env.contains(&"LANG=C".to_string()));
        assert!(!env.iter().any(|e| e.starts_with("PATH=")));
    }

    #[tokio::test]
    #[ignore = "requires a running Docker daemon"]
    async fn test_docker_python_roundtrip() {
        let policy =
            SandboxPolicy::new(30, 256, NetworkAccess::None, FilesystemScope::Temp).unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let executor = DockerExecutor::connect(policy)
            .await
            .unwrap()
            .with_scratch_root(scratch.path());
        let result = executor
            .execute(ExecutionRequest::new("python", "import sys\nprint('hi')\nprint('e', file=sys.stderr)"))
            .await;
        assert_eq!(result.exit_code, 0, "stderr: {}", result.stderr);
        assert_eq!(result.stdout.trim(), "hi");
        assert_eq!(result.stderr.trim(), "e");
    }

    #[tokio::test]
    #[ignore = "requires a running Docker daemon"]
    async fn test_docker_timeout_kills_container() {
        let policy =
            SandboxPolicy::new(1, 128, NetworkAccess::None, FilesystemScope::Temp).unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let executor = DockerExecutor::connect(policy)
            .await
            .unwrap()
            .with_scratch_root(scratch.path());
        let result = executor
            .execute(ExecutionRequest::new("sh", "while :; do :; done"))
            .await;
        assert!(result.timed_out);
        assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
        assert!(result.stderr.contains("timeout"));
    }

    #[tokio::test]
    #[ignore = "requires a running Docker daemon"]
    async fn test_cancelled_execution_removes_container() {
        use bollard::container::ListContainersOptions;

        let policy =
            SandboxPolicy::new(60, 128, NetworkAccess::None, FilesystemScope::Temp).unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let executor = DockerExecutor::connect(policy)
            .await
            .unwrap()
            .with_scratch_root(scratch.path());
        let cancelled = tokio::time::timeout(
            Duration::from_secs(5),
            executor.execute(ExecutionRequest::new("sh", "sleep 60")),
        )
        .await;
        assert!(cancelled.is_err());
        tokio::time::sleep(Duration::from_secs(3)).await;

        let label = format!("{}=true", CONTAINER_LABEL);
        let options = ListContainersOptions {
            all: true,
            filters: HashMap::from([("label", vec![label.as_str()])]),
            ..Default::default()
        };
        let containers = executor.docker.list_containers(Some(options)).await.unwrap();
        assert!(containers.is_empty());
    }
}
