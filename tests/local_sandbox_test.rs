//! 本地沙箱集成测试：超时终止、后台进程清理、输出截断、策略校验

#[cfg(unix)]
mod tests {
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use serde_json::{json, Map};

    use drone::react::ActionProposal;
    use drone::sandbox::{
        CodeExecutor, ExecutionRequest, FilesystemScope, LocalExecutor, NetworkAccess,
        SandboxPolicy,
    };
    use drone::tools::{ActionExecutor, DefaultActionExecutor, ExecuteCodeTool, ToolRegistry};

    fn executor(cpu_seconds: u64, workspace: &std::path::Path) -> LocalExecutor {
        let policy =
            SandboxPolicy::new(cpu_seconds, 256, NetworkAccess::None, FilesystemScope::Temp).unwrap();
        LocalExecutor::new(policy)
            .unwrap()
            .with_scratch_root(workspace)
            .with_output_limit(1000)
    }

    #[tokio::test]
    async fn test_endless_script_is_killed() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(1, dir.path());

        let started = Instant::now();
        let result = executor
            .execute(ExecutionRequest::new("bash", "while :; do :; done"))
            .await;

        assert_eq!(result.exit_code, 124);
        assert!(result.timed_out);
        assert!(result.stderr.contains("Execution timeout after 1000ms"));
        assert!(started.elapsed().as_secs() < 10);
    }

    /// 后台 sleep 把自己的 pid 写入 PID_FILE
    fn background_sleep(pid_file: &Path, script: &str) -> ExecutionRequest {
        ExecutionRequest::new("sh", script).with_env("PID_FILE", pid_file.display().to_string())
    }

    fn read_pid(pid_file: &Path) -> String {
        std::fs::read_to_string(pid_file).unwrap().trim().to_string()
    }

    /// 进程表中不存在，或只剩等待回收的僵尸
    #[cfg(target_os = "linux")]
    fn is_alive(pid: &str) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            Ok(status) => !status
                .lines()
                .any(|line| line.starts_with("State:") && line.contains('Z')),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    async fn assert_gone(pid: &str) {
        for _ in 0..40 {
            if !is_alive(pid) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("process {} still alive", pid);
    }

    #[tokio::test]
    async fn test_background_child_holding_stdout_respects_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        let pid_file = state.path().join("bg.pid");
        let executor = executor(1, dir.path());

        let started = Instant::now();
        let result = executor
            .execute(background_sleep(
                &pid_file,
                "sleep 41 & echo $! > \"$PID_FILE\"; echo hi",
            ))
            .await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(result.timed_out);
        assert_eq!(result.exit_code, 124);
        assert!(result.stdout.contains("hi"));
        #[cfg(target_os = "linux")]
        assert_gone(&read_pid(&pid_file)).await;
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_timeout_leaves_no_process_behind() {
        let dir = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        let pid_file = state.path().join("bg.pid");
        let executor = executor(1, dir.path());

        let result = executor
            .execute(background_sleep(
                &pid_file,
                "sleep 42 & echo $! > \"$PID_FILE\"; wait",
            ))
            .await;

        assert!(result.timed_out);
        assert_gone(&read_pid(&pid_file)).await;
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_detached_child_killed_after_normal_exit() {
        let dir = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        let pid_file = state.path().join("bg.pid");
        let executor = executor(10, dir.path());

        let started = Instant::now();
        let result = executor
            .execute(background_sleep(
                &pid_file,
                "sleep 43 >/dev/null 2>&1 & echo $! > \"$PID_FILE\"; echo done",
            ))
            .await;

        assert_eq!(result.exit_code, 0, "stderr: {}", result.stderr);
        assert!(!result.timed_out);
        assert_eq!(result.stdout.trim(), "done");
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_gone(&read_pid(&pid_file)).await;
    }

    #[tokio::test]
    async fn test_tool_timeout_does_not_cut_sandbox_short() {
        let dir = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        let pid_file = state.path().join("bg.pid");

        let mut registry = ToolRegistry::new();
        registry.register(ExecuteCodeTool::new(Arc::new(executor(2, dir.path()))));
        let settings = HashMap::from([(
            "execute_code".to_string(),
            json!({"environment": {"PID_FILE": pid_file.display().to_string()}}),
        )]);
        let actions = DefaultActionExecutor::new(Arc::new(registry), dir.path())
            .with_timeout(Duration::from_millis(500))
            .with_settings(settings);

        let mut args = Map::new();
        args.insert("language".into(), json!("sh"));
        args.insert(
            "code".into(),
            json!("sleep 44 & echo $! > \"$PID_FILE\"; sleep 44"),
        );
        let result = actions
            .execute(&ActionProposal::new("execute_code", args, 0))
            .await;

        assert!(!result.success);
        let error = result.error.unwrap();
        assert!(error.contains("Execution timeout after 2000ms"), "error: {}", error);
        assert!(!error.contains("Tool timeout"));
        #[cfg(target_os = "linux")]
        assert_gone(&read_pid(&pid_file)).await;
    }

    #[tokio::test]
    async fn test_large_output_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(10, dir.path());

        let result = executor
            .execute(ExecutionRequest::new("sh", "head -c 5000 /dev/zero | tr '\\0' 'a'"))
            .await;

        assert_eq!(result.exit_code, 0);
        assert!(result.truncated);
        assert!(result.stdout.starts_with(&"a".repeat(1000)));
        assert!(result
            .stdout
            .ends_with("\n\n... [truncated 4000 more characters]"));
    }

    #[tokio::test]
    async fn test_scratch_dir_removed() {
        let dir = tempfile::tempdir().unwrap();
        let executor = executor(10, dir.path());

        let result = executor
            .execute(ExecutionRequest::new("sh", "echo done"))
            .await;

        assert_eq!(result.stdout.trim(), "done");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_invalid_policies_rejected() {
        assert!(SandboxPolicy::new(0, 256, NetworkAccess::None, FilesystemScope::Temp).is_err());
        assert!(SandboxPolicy::new(301, 256, NetworkAccess::None, FilesystemScope::Temp).is_err());
        assert!(SandboxPolicy::new(10, 0, NetworkAccess::None, FilesystemScope::Temp).is_err());

        // 3000MB 对容器合法，对本地执行器越界
        let policy =
            SandboxPolicy::new(10, 3000, NetworkAccess::None, FilesystemScope::Temp).unwrap();
        assert!(LocalExecutor::new(policy).is_err());
    }
}
