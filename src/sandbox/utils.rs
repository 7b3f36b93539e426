//! 执行器共用工具：有上限的输出缓冲、环境变量白名单、每次调用的临时目录

use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};

use tempfile::TempDir;

use crate::sandbox::{ExecutionRequest, Language, SandboxError};

/// stdout / stderr 默认截断阈值（字节）
pub const DEFAULT_OUTPUT_LIMIT: usize = 8000;

/// 从宿主进程继承的环境变量白名单
pub const ENV_ALLOW_LIST: &[&str] = &["PATH", "HOME", "USER", "SHELL", "LANG", "LC_ALL", "TZ"];

pub fn truncation_marker(remaining: usize) -> String {
    format!("\n\n... [truncated {} more characters]", remaining)
}

/// 有上限的输出缓冲：只保留前 limit(+UTF-8 余量) 字节，但记录总长度，
/// 使截断标记中的剩余量与完整输出一致
#[derive(Debug, Default)]
pub struct OutputCapture {
    kept: Vec<u8>,
    total: usize,
    limit: usize,
}

impl OutputCapture {
    pub fn new(limit: usize) -> Self {
        Self {
            kept: Vec::new(),
            total: 0,
            limit,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.total += chunk.len();
        // 多留 3 字节以便在字符边界处切分
        let room = (self.limit + 3).saturating_sub(self.kept.len());
        if room > 0 {
            let take = room.min(chunk.len());
            self.kept.extend_from_slice(&chunk[..take]);
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// 先在原始字节上切分再解码，剩余量始终按原始字节计
    pub fn finish(self) -> (String, bool) {
        if self.total <= self.limit {
            return (String::from_utf8_lossy(&self.kept).into_owned(), false);
        }
        let mut cut = self.limit.min(self.kept.len());
        // 最多回退 3 字节，避免把多字节字符切成两半
        while cut > 0 && self.limit - cut < 3 && is_continuation(self.kept[cut]) {
            cut -= 1;
        }
        let remaining = self.total - cut;
        (
            format!(
                "{}{}",
                String::from_utf8_lossy(&self.kept[..cut]),
                truncation_marker(remaining)
            ),
            true,
        )
    }
}

fn is_continuation(byte: u8) -> bool {
    byte & 0b1100_0000 == 0b1000_0000
}

/// 仅保留白名单内的变量
pub fn sanitize_environment<I>(vars: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    vars.into_iter()
        .filter(|(k, _)| ENV_ALLOW_LIST.contains(&k.as_str()))
        .collect()
}

/// 当前进程环境经白名单过滤后，叠加请求中的覆盖项
pub fn build_environment(overrides: &HashMap<String, String>) -> BTreeMap<String, String> {
    let mut env = sanitize_environment(std::env::vars());
    env.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}

/// 辅助文件路径校验：必须是相对路径且不含 `..`、根或盘符
pub fn validate_relative_path(path: &str) -> Result<PathBuf, SandboxError> {
    let candidate = Path::new(path);
    if path.trim().is_empty() {
        return Err(SandboxError::PathEscape("empty path".to_string()));
    }
    for component in candidate.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(SandboxError::PathEscape(path.to_string()));
            }
        }
    }
    Ok(candidate.to_path_buf())
}

/// 单次调用的临时目录：写入脚本与辅助文件，cleanup 时删除（错误只记日志）
#[derive(Debug)]
pub struct ScratchDir {
    dir: TempDir,
    script_name: String,
}

impl ScratchDir {
    pub async fn create(
        root: &Path,
        request: &ExecutionRequest,
        language: Language,
    ) -> Result<Self, SandboxError> {
        // 先校验全部路径，避免写了一半
        let files = request
            .files
            .iter()
            .map(|f| validate_relative_path(&f.path).map(|p| (p, f)))
            .collect::<Result<Vec<_>, _>>()?;

        tokio::fs::create_dir_all(root).await?;
        let root = root.to_path_buf();
        let dir = tokio::task::spawn_blocking(move || {
            tempfile::Builder::new()
                .prefix("drone-exec-")
                .tempdir_in(root)
        })
        .await
        .map_err(|e| SandboxError::Io(std::io::Error::other(e)))??;

        let script_name = language.script_name();
        tokio::fs::write(dir.path().join(&script_name), &request.code).await?;

        for (relative, file) in files {
            let target = dir.path().join(relative);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, &file.content).await?;
            if file.executable {
                set_executable(&target).await?;
            }
        }

        Ok(Self { dir, script_name })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn script_name(&self) -> &str {
        &self.script_name
    }

    pub fn script_path(&self) -> PathBuf {
        self.dir.path().join(&self.script_name)
    }

    pub async fn cleanup(self) {
        let path = self.dir.path().to_path_buf();
        let closed = tokio::task::spawn_blocking(move || self.dir.close()).await;
        match closed {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(path = %path.display(), error = %e, "scratch dir cleanup failed")
            }
            Err(e) => tracing::debug!(path = %path.display(), error = %e, "scratch dir cleanup panicked"),
        }
    }
}

#[cfg(unix)]
async fn set_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = tokio::fs::metadata(path).await?.permissions();
    perms.set_mode(perms.mode() | 0o755);
    tokio::fs::set_permissions(path, perms).await
}

#[cfg(not(unix))]
async fn set_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
