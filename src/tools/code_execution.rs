//! execute_code：在沙箱执行器（本地 / Docker）中运行代码片段

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::Instrument;

use crate::sandbox::policy::MAX_CPU_SECONDS;
use crate::sandbox::{CodeExecutor, ExecutionRequest};
use crate::tools::{required_str, ParamType, Tool, ToolContext, ToolError, ToolParameter};

/// 非零退出时错误信息中保留的 stderr 长度
const ERROR_STDERR_CHARS: usize = 500;

pub struct ExecuteCodeTool {
    executor: Arc<dyn CodeExecutor>,
}

impl ExecuteCodeTool {
    pub fn new(executor: Arc<dyn CodeExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl Tool for ExecuteCodeTool {
    fn name(&self) -> &str {
        "execute_code"
    }

    fn description(&self) -> &str {
        "Execute code in a resource-limited sandbox and return stdout, stderr and exit code"
    }

    /// 沙箱在自身时限到达时终止整个进程组 / 容器
    fn enforces_own_timeout(&self) -> bool {
        true
    }

    fn parameters(&self) -> Vec<ToolParameter> {
        vec![
            ToolParameter::required("language", ParamType::String, "Programming language")
                .with_enum(&["python", "javascript", "typescript", "bash", "sh"]),
            ToolParameter::required("code", ParamType::String, "Code to execute"),
            ToolParameter::optional(
                "timeout_secs",
                ParamType::Integer,
                "Timeout override in seconds, at most 300 (defaults to the sandbox policy)",
            ),
        ]
    }

    async fn invoke(&self, args: &Map<String, Value>, ctx: &ToolContext) -> Result<Value, ToolError> {
        let language = required_str(args, "language")?;
        let code = required_str(args, "code")?;

        let mut request = ExecutionRequest::new(language, code)
            .with_working_directory(ctx.workspace_root());
        if let Some(secs) = args.get("timeout_secs").and_then(Value::as_u64) {
            request = request.with_timeout(Duration::from_secs(secs.clamp(1, MAX_CPU_SECONDS)));
        }
        if let Some(Value::Object(env)) = ctx.config.get("environment") {
            for (key, value) in env {
                if let Some(v) = value.as_str() {
                    request = request.with_env(key.clone(), v);
                }
            }
        }

        ctx.span.in_scope(|| {
            tracing::info!(
                executor = self.executor.kind(),
                language = %language,
                code_len = code.len(),
                "executing code"
            )
        });
        let result = self
            .executor
            .execute(request)
            .instrument(ctx.span.clone())
            .await;
        ctx.span.in_scope(|| {
            tracing::info!(
                exit_code = result.exit_code,
                duration_ms = result.duration_ms,
                timed_out = result.timed_out,
                "code execution completed"
            )
        });

        if result.success() {
            serde_json::to_value(&result).map_err(|e| ToolError::Execution(e.to_string()))
        } else {
            let stderr: String = result.stderr.trim().chars().take(ERROR_STDERR_CHARS).collect();
            Err(ToolError::Execution(format!(
                "exit code {}: {}",
                result.exit_code, stderr
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::sandbox::{CodeExecutionResult, SandboxPolicy};
    use serde_json::json;

    struct FakeExecutor {
        policy: SandboxPolicy,
        exit_code: i32,
        seen_timeout: Mutex<Option<Duration>>,
    }

    fn fake(exit_code: i32) -> Arc<FakeExecutor> {
        Arc::new(FakeExecutor {
            policy: SandboxPolicy::default(),
            exit_code,
            seen_timeout: Mutex::new(None),
        })
    }

    #[async_trait]
    impl CodeExecutor for FakeExecutor {
        fn kind(&self) -> &'static str {
            "fake"
        }

        fn policy(&self) -> &SandboxPolicy {
            &self.policy
        }

        async fn execute(&self, request: ExecutionRequest) -> CodeExecutionResult {
            *self.seen_timeout.lock().unwrap() = request.timeout;
            CodeExecutionResult {
                stdout: format!("{}:{}", request.language, request.code),
                stderr: if self.exit_code == 0 { String::new() } else { "NameError".into() },
                exit_code: self.exit_code,
                duration_ms: 1,
                truncated: false,
                timed_out: false,
            }
        }
    }

    fn args() -> Map<String, Value> {
        let mut args = Map::new();
        args.insert("language".into(), json!("python"));
        args.insert("code".into(), json!("print(1)"));
        args
    }

    #[tokio::test]
    async fn test_success_returns_result() {
        let tool = ExecuteCodeTool::new(fake(0));
        let out = tool.invoke(&args(), &ToolContext::new(".")).await.unwrap();
        assert_eq!(out["stdout"], "python:print(1)");
        assert_eq!(out["exit_code"], 0);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_error() {
        let tool = ExecuteCodeTool::new(fake(1));
        let err = tool.invoke(&args(), &ToolContext::new(".")).await.unwrap_err();
        assert_eq!(err.to_string(), "exit code 1: NameError");
    }

    #[tokio::test]
    async fn test_timeout_override_capped_by_policy_ceiling() {
        let executor = fake(0);
        let tool = ExecuteCodeTool::new(executor.clone());
        assert!(tool.enforces_own_timeout());

        let mut long = args();
        long.insert("timeout_secs".into(), json!(100_000));
        tool.invoke(&long, &ToolContext::new(".")).await.unwrap();
        assert_eq!(
            *executor.seen_timeout.lock().unwrap(),
            Some(Duration::from_secs(MAX_CPU_SECONDS))
        );

        let mut zero = args();
        zero.insert("timeout_secs".into(), json!(0));
        tool.invoke(&zero, &ToolContext::new(".")).await.unwrap();
        assert_eq!(*executor.seen_timeout.lock().unwrap(), Some(Duration::from_secs(1)));
    }
}
