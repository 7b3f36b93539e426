//! 按 [sandbox] 配置创建执行器

use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;

use crate::config::SandboxSection;
use crate::sandbox::{CodeExecutor, LocalExecutor, SandboxError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxBackend {
    #[default]
    Local,
    Docker,
}

/// 本地执行器在 workspace 下运行；Docker 执行器的临时目录默认放在 workspace/.drone_tmp 以便挂载
pub async fn create_executor(
    section: &SandboxSection,
    workspace_root: &Path,
) -> Result<Arc<dyn CodeExecutor>, SandboxError> {
    match section.backend {
        SandboxBackend::Local => {
            let mut executor = LocalExecutor::new(section.policy.clone())?
                .with_working_dir(workspace_root)
                .with_output_limit(section.output_limit_bytes);
            if let Some(root) = &section.scratch_root {
                executor = executor.with_scratch_root(root);
            }
            Ok(Arc::new(executor))
        }
        #[cfg(feature = "docker")]
        SandboxBackend::Docker => {
            let scratch_root = section
                .scratch_root
                .clone()
                .unwrap_or_else(|| workspace_root.join(".drone_tmp"));
            let executor = crate::sandbox::DockerExecutor::connect(section.policy.clone())
                .await?
                .with_scratch_root(scratch_root)
                .with_output_limit(section.output_limit_bytes);
            Ok(Arc::new(executor))
        }
        #[cfg(not(feature = "docker"))]
        SandboxBackend::Docker => Err(SandboxError::RuntimeUnavailable(
            "drone was built without the `docker` feature".to_string(),
        )),
    }
}
