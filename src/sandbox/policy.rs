//! 沙箱策略：CPU 秒数、内存上限、网络访问级别、文件系统范围
//!
//! SandboxPolicy 的字段私有，只能经 `SandboxPolicy::new` 或反序列化（同样走校验）得到，
//! 因此持有实例即意味着已通过校验；各执行器构造时再按自身上限（本地 2048MB / 容器 4096MB）复核。
//! 越界值一律报错，不做截断。

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::sandbox::SandboxError;

pub const MAX_CPU_SECONDS: u64 = 300;
pub const LOCAL_MAX_MEMORY_MB: u64 = 2048;
pub const CONTAINER_MAX_MEMORY_MB: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkAccess {
    None,
    #[default]
    Outbound,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilesystemScope {
    /// 在请求/配置的工作目录中运行
    #[default]
    Workspace,
    /// 在本次调用的临时目录中运行
    Temp,
    /// 临时目录 + HOME/TMPDIR 重定向（容器内根文件系统只读）
    Sandbox,
}

/// 已校验、不可变的沙箱策略
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PolicySpec", into = "PolicySpec")]
pub struct SandboxPolicy {
    max_cpu_seconds: u64,
    max_memory_mb: u64,
    network_access: NetworkAccess,
    filesystem_scope: FilesystemScope,
}

/// 配置文件中的原始形态（[sandbox.policy]），反序列化后经 TryFrom 校验
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct PolicySpec {
    max_cpu_seconds: u64,
    max_memory_mb: u64,
    network_access: NetworkAccess,
    filesystem_scope: FilesystemScope,
}

impl Default for PolicySpec {
    fn default() -> Self {
        Self {
            max_cpu_seconds: 30,
            max_memory_mb: 512,
            network_access: NetworkAccess::Outbound,
            filesystem_scope: FilesystemScope::Workspace,
        }
    }
}

impl TryFrom<PolicySpec> for SandboxPolicy {
    type Error = SandboxError;

    fn try_from(spec: PolicySpec) -> Result<Self, Self::Error> {
        SandboxPolicy::new(
            spec.max_cpu_seconds,
            spec.max_memory_mb,
            spec.network_access,
            spec.filesystem_scope,
        )
    }
}

impl From<SandboxPolicy> for PolicySpec {
    fn from(policy: SandboxPolicy) -> Self {
        Self {
            max_cpu_seconds: policy.max_cpu_seconds,
            max_memory_mb: policy.max_memory_mb,
            network_access: policy.network_access,
            filesystem_scope: policy.filesystem_scope,
        }
    }
}

impl SandboxPolicy {
    /// 按最宽上限（容器 4096MB）校验；执行器构造时用 `ensure_within` 收紧
    pub fn new(
        max_cpu_seconds: u64,
        max_memory_mb: u64,
        network_access: NetworkAccess,
        filesystem_scope: FilesystemScope,
    ) -> Result<Self, SandboxError> {
        let policy = Self {
            max_cpu_seconds,
            max_memory_mb,
            network_access,
            filesystem_scope,
        };
        policy.ensure_within(CONTAINER_MAX_MEMORY_MB)?;
        Ok(policy)
    }

    /// 校验 CPU 秒数与内存上限；越界返回 InvalidPolicy
    pub fn ensure_within(&self, max_memory_mb: u64) -> Result<(), SandboxError> {
        if self.max_cpu_seconds == 0 || self.max_cpu_seconds > MAX_CPU_SECONDS {
            return Err(SandboxError::InvalidPolicy(format!(
                "max_cpu_seconds must be between 1 and {}, got {}",
                MAX_CPU_SECONDS, self.max_cpu_seconds
            )));
        }
        if self.max_memory_mb == 0 || self.max_memory_mb > max_memory_mb {
            return Err(SandboxError::InvalidPolicy(format!(
                "max_memory_mb must be between 1 and {}, got {}",
                max_memory_mb, self.max_memory_mb
            )));
        }
        Ok(())
    }

    pub fn max_cpu_seconds(&self) -> u64 {
        self.max_cpu_seconds
    }

    pub fn max_memory_mb(&self) -> u64 {
        self.max_memory_mb
    }

    pub fn network_access(&self) -> NetworkAccess {
        self.network_access
    }

    pub fn filesystem_scope(&self) -> FilesystemScope {
        self.filesystem_scope
    }

    /// 默认执行超时：与 CPU 秒数一致
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.max_cpu_seconds)
    }

    pub fn memory_bytes(&self) -> u64 {
        self.max_memory_mb * 1024 * 1024
    }
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self {
            max_cpu_seconds: 30,
            max_memory_mb: 512,
            network_access: NetworkAccess::Outbound,
            filesystem_scope: FilesystemScope::Workspace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_bounds() {
        assert!(SandboxPolicy::new(1, 1, NetworkAccess::None, FilesystemScope::Temp).is_ok());
        assert!(SandboxPolicy::new(300, 4096, NetworkAccess::Full, FilesystemScope::Sandbox).is_ok());
        assert!(SandboxPolicy::new(0, 512, NetworkAccess::None, FilesystemScope::Temp).is_err());
        assert!(SandboxPolicy::new(1000, 512, NetworkAccess::None, FilesystemScope::Temp).is_err());
        assert!(SandboxPolicy::new(30, 0, NetworkAccess::None, FilesystemScope::Temp).is_err());
        assert!(SandboxPolicy::new(30, 5000, NetworkAccess::None, FilesystemScope::Temp).is_err());
    }

    #[test]
    fn test_ensure_within_local_ceiling() {
        let policy =
            SandboxPolicy::new(30, 3000, NetworkAccess::Outbound, FilesystemScope::Workspace)
                .unwrap();
        assert!(policy.ensure_within(CONTAINER_MAX_MEMORY_MB).is_ok());
        let err = policy.ensure_within(LOCAL_MAX_MEMORY_MB).unwrap_err();
        assert!(err.to_string().contains("2048"));
    }

    #[test]
    fn test_deserialize_validates() {
        let ok: SandboxPolicy = serde_json::from_str(
            r#"{"max_cpu_seconds": 5, "max_memory_mb": 128, "network_access": "none"}"#,
        )
        .unwrap();
        assert_eq!(ok.max_cpu_seconds(), 5);
        assert_eq!(ok.network_access(), NetworkAccess::None);
        assert_eq!(ok.filesystem_scope(), FilesystemScope::Workspace);

        let bad = serde_json::from_str::<SandboxPolicy>(r#"{"max_cpu_seconds": 1000}"#);
        assert!(bad.is_err());
    }
}
