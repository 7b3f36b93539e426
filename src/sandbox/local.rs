//! 本地子进程执行器
//!
//! 每次调用：临时目录写入脚本 → 独立进程组启动解释器（Unix 下 setrlimit 限制 CPU 与数据段）→
//! 等待退出并读完输出，整体受超时约束 → 无论结果如何对整个进程组 SIGKILL → 截断输出 → 删除临时目录。
//! 网络隔离在本地无法实现，network_access=none 时仅记录警告。

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::future;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::{AbortHandle, JoinError, JoinHandle};

use crate::sandbox::policy::LOCAL_MAX_MEMORY_MB;
use crate::sandbox::utils::{build_environment, OutputCapture, ScratchDir};
use crate::sandbox::{
    CodeExecutionResult, CodeExecutor, ExecutionRequest, FilesystemScope, Language, NetworkAccess,
    SandboxError, SandboxPolicy, DEFAULT_OUTPUT_LIMIT, TIMEOUT_EXIT_CODE,
};

/// 超时 kill 之后等待输出读取任务收尾的时长
const READER_GRACE: Duration = Duration::from_secs(1);

pub struct LocalExecutor {
    policy: SandboxPolicy,
    scratch_root: PathBuf,
    working_dir: PathBuf,
    output_limit: usize,
}

impl LocalExecutor {
    /// 按本地上限（内存 ≤ 2048MB）复核策略
    pub fn new(policy: SandboxPolicy) -> Result<Self, SandboxError> {
        policy.ensure_within(LOCAL_MAX_MEMORY_MB)?;
        if policy.network_access() == NetworkAccess::None {
            tracing::warn!("local executor cannot isolate network access; policy is advisory");
        }
        Ok(Self {
            policy,
            scratch_root: std::env::temp_dir(),
            working_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            output_limit: DEFAULT_OUTPUT_LIMIT,
        })
    }

    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = root.into();
        self
    }

    /// filesystem_scope=workspace 且请求未指定目录时使用
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn with_output_limit(mut self, limit: usize) -> Self {
        self.output_limit = limit;
        self
    }

    async fn run(
        &self,
        scratch: &ScratchDir,
        language: Language,
        request: &ExecutionRequest,
        started: Instant,
    ) -> Result<CodeExecutionResult, SandboxError> {
        let timeout = request.timeout.unwrap_or_else(|| self.policy.timeout());
        let (program, args) = language.local_command(&scratch.script_path());

        let cwd = match self.policy.filesystem_scope() {
            FilesystemScope::Workspace => request
                .working_directory
                .clone()
                .unwrap_or_else(|| self.working_dir.clone()),
            FilesystemScope::Temp | FilesystemScope::Sandbox => scratch.path().to_path_buf(),
        };

        let mut env = build_environment(&request.environment);
        if self.policy.filesystem_scope() == FilesystemScope::Sandbox {
            let home = scratch.path().to_string_lossy().into_owned();
            env.insert("HOME".to_string(), home.clone());
            env.insert("TMPDIR".to_string(), home);
        }

        let mut cmd = Command::new(program);
        cmd.args(&args)
            .current_dir(&cwd)
            .env_clear()
            .envs(&env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        apply_resource_limits(&mut cmd, &self.policy);

        let mut child = cmd.spawn().map_err(|source| SandboxError::Spawn {
            program: program.to_string(),
            source,
        })?;
        tracing::debug!(
            program,
            pid = child.id(),
            timeout_ms = timeout.as_millis() as u64,
            "local execution started"
        );

        let mut group = ProcessGroup::new(child.id());

        let stdout_task = spawn_reader(child.stdout.take(), self.output_limit);
        let stderr_task = spawn_reader(child.stderr.take(), self.output_limit);
        let aborts = [stdout_task.abort_handle(), stderr_task.abort_handle()];
        let readers = future::join(stdout_task, stderr_task);
        tokio::pin!(readers);
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        // 截止时间覆盖整个调用：解释器退出且两路输出都读到 EOF
        let exited = tokio::select! {
            status = child.wait() => Some(status?),
            _ = &mut deadline => None,
        };
        let drained = match exited {
            Some(_) => tokio::select! {
                captures = &mut readers => Some(captures),
                _ = &mut deadline => None,
            },
            None => None,
        };
        // 解释器退出后留下的后台进程同样要清理
        group.kill();

        if let (Some(status), Some((stdout, stderr))) = (exited, drained) {
            let (stdout, out_truncated) = finish_capture(stdout);
            let (mut stderr, err_truncated) = finish_capture(stderr);
            let (exit_code, timed_out) = interpret_status(status);
            if timed_out {
                stderr.push_str("\nCPU time limit exceeded");
            }
            return Ok(CodeExecutionResult {
                stdout,
                stderr,
                exit_code,
                duration_ms: started.elapsed().as_millis() as u64,
                truncated: out_truncated || err_truncated,
                timed_out,
            });
        }

        if exited.is_none() {
            if let Err(e) = child.kill().await {
                tracing::debug!(error = %e, "child kill failed");
            }
        }
        let (stdout, stderr) = match tokio::time::timeout(READER_GRACE, &mut readers).await {
            Ok(captures) => captures,
            Err(_) => {
                aborts.iter().for_each(AbortHandle::abort);
                (Ok(OutputCapture::default()), Ok(OutputCapture::default()))
            }
        };
        let (stdout, out_truncated) = finish_capture(stdout);
        let (mut stderr, err_truncated) = finish_capture(stderr);
        if !stderr.is_empty() && !stderr.ends_with('\n') {
            stderr.push('\n');
        }
        stderr.push_str(&SandboxError::Timeout(timeout).to_string());
        tracing::warn!(program, timeout_ms = timeout.as_millis() as u64, "local execution timed out");
        Ok(CodeExecutionResult {
            stdout,
            stderr,
            exit_code: TIMEOUT_EXIT_CODE,
            duration_ms: started.elapsed().as_millis() as u64,
            truncated: out_truncated || err_truncated,
            timed_out: true,
        })
    }
}

#[async_trait]
impl CodeExecutor for LocalExecutor {
    fn kind(&self) -> &'static str {
        "local"
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
                tracing::warn!(language = %language, error = %e, "local execution failed");
                CodeExecutionResult::from_error(&e, started.elapsed().as_millis() as u64)
            }
        }
    }
}

fn spawn_reader<R>(reader: Option<R>, limit: usize) -> JoinHandle<OutputCapture>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut capture = OutputCapture::new(limit);
        if let Some(mut reader) = reader {
            let mut buf = [0u8; 8192];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => capture.push(&buf[..n]),
                }
            }
        }
        capture
    })
}

fn finish_capture(joined: Result<OutputCapture, JoinError>) -> (String, bool) {
    joined.map(OutputCapture::finish).unwrap_or_default()
}

/// (exit_code, 是否因 CPU rlimit 被终止)
fn interpret_status(status: ExitStatus) -> (i32, bool) {
    if let Some(code) = status.code() {
        return (code, false);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            let cpu_exceeded = signal == nix::sys::signal::Signal::SIGXCPU as i32;
            if cpu_exceeded {
                return (TIMEOUT_EXIT_CODE, true);
            }
            return (128 + signal, false);
        }
    }
    (-1, false)
}

#[cfg(unix)]
fn apply_resource_limits(cmd: &mut Command, policy: &SandboxPolicy) {
    use nix::sys::resource::{setrlimit, Resource};

    // 软限制比墙钟超时多 1 秒，正常情况下由超时竞速先触发
    let cpu_soft = policy.max_cpu_seconds() + 1;
    let cpu_hard = cpu_soft + 1;
    let data = policy.memory_bytes();

    cmd.process_group(0);
    // SAFETY: 闭包在 fork 之后、exec 之前运行，只调用 async-signal-safe 的 setrlimit
    unsafe {
        cmd.pre_exec(move || {
            setrlimit(Resource::RLIMIT_CPU, cpu_soft, cpu_hard).map_err(std::io::Error::from)?;
            setrlimit(Resource::RLIMIT_DATA, data, data).map_err(std::io::Error::from)?;
            Ok(())
        });
    }
}

/// 解释器所在的进程组：kill 或 drop 时对整个组发送 SIGKILL，
/// 调用被取消（外层 future 被丢弃）时同样生效
struct ProcessGroup {
    pgid: Option<u32>,
}

impl ProcessGroup {
    fn new(pgid: Option<u32>) -> Self {
        Self { pgid }
    }

    fn kill(&mut self) {
        let Some(pgid) = self.pgid.take() else {
            return;
        };
        #[cfg(unix)]
        {
            use nix::errno::Errno;
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;
            match killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => tracing::debug!(pgid, error = %e, "killpg failed"),
            }
        }
        #[cfg(not(unix))]
        let _ = pgid;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::ExecutionFile;

    fn executor(cpu: u64) -> LocalExecutor {
        let policy =
            SandboxPolicy::new(cpu, 256, NetworkAccess::Outbound, FilesystemScope::Temp).unwrap();
        LocalExecutor::new(policy).unwrap()
    }

    #[test]
    fn test_rejects_memory_above_local_ceiling() {
        let policy =
            SandboxPolicy::new(10, 3000, NetworkAccess::Outbound, FilesystemScope::Temp).unwrap();
        assert!(matches!(
            LocalExecutor::new(policy),
            Err(SandboxError::InvalidPolicy(_))
        ));
    }

    #[tokio::test]
    async fn test_unsupported_language_fails_fast() {
        let result = executor(5)
            .execute(ExecutionRequest::new("cobol", "DISPLAY 'HI'."))
            .await;
        assert_eq!(result.exit_code, 1);
        assert!(result.stderr.contains("Unsupported language"));
        assert!(!result.timed_out);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sh_stdout_and_exit_code() {
        let result = executor(5)
            .execute(ExecutionRequest::new("sh", "echo out; echo err >&2; exit 3"))
            .await;
        assert_eq!(result.stdout, "out\n");
        assert_eq!(result.stderr, "err\n");
        assert_eq!(result.exit_code, 3);
        assert!(!result.truncated);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_aux_files_and_env_override() {
        let request = ExecutionRequest::new("sh", "cat data.txt; printf \"$GREETING\"")
            .with_file(ExecutionFile {
                path: "data.txt".to_string(),
                content: "from file\n".to_string(),
                executable: false,
            })
            .with_env("GREETING", "hi");
        let result = executor(5).execute(request).await;
        assert_eq!(result.exit_code, 0, "stderr: {}", result.stderr);
        assert_eq!(result.stdout, "from file\nhi");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_environment_is_filtered() {
        std::env::set_var("DRONE_TEST_SECRET", "leak");
        let result = executor(5)
            .execute(ExecutionRequest::new("sh", "printf \"${DRONE_TEST_SECRET:-none}\""))
            .await;
        assert_eq!(result.stdout, "none");
    }
}
