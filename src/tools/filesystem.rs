//! 工作目录文件工具
//!
//! SafeFs 绑定 workspace_root，所有路径经 resolve 校验必须在根下（禁止 ../ 与符号链接逃逸）；
//! read_file / write_file / list_directory 基于 SafeFs。

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::tools::{optional_str, required_str, ParamType, Tool, ToolContext, ToolError, ToolParameter};

/// 受限文件系统：绑定根目录，resolve 校验路径在根下
#[derive(Debug, Clone)]
pub struct SafeFs {
    root_dir: PathBuf,
}

impl SafeFs {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        let root = root_dir.as_ref().to_path_buf();
        let root_dir = root.canonicalize().unwrap_or(root);
        Self { root_dir }
    }

    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    /// 解析已存在的路径；canonicalize 后必须仍在根下
    pub fn resolve(&self, path: &str) -> Result<PathBuf, ToolError> {
        let rel = path.trim_start_matches("./");
        let full = self.root_dir.join(rel);
        let canonical = full
            .canonicalize()
            .map_err(|_| ToolError::NotFound(path.to_string()))?;
        if canonical.starts_with(self.root_canonical()) {
            Ok(canonical)
        } else {
            Err(ToolError::PathEscape(path.to_string()))
        }
    }

    /// 解析待写入的路径（可以不存在）：不允许绝对路径与 `..`，最近的已存在祖先必须在根下
    pub fn resolve_for_write(&self, path: &str) -> Result<PathBuf, ToolError> {
        let rel = Path::new(path.trim_start_matches("./"));
        let escapes = rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if rel.as_os_str().is_empty() || escapes {
            return Err(ToolError::PathEscape(path.to_string()));
        }
        let full = self.root_dir.join(rel);

        let mut ancestor = full.as_path();
        while !ancestor.exists() {
            match ancestor.parent() {
                Some(parent) => ancestor = parent,
                None => break,
            }
        }
        if let Ok(canonical) = ancestor.canonicalize() {
            if !canonical.starts_with(self.root_canonical()) {
                return Err(ToolError::PathEscape(path.to_string()));
            }
        }
        Ok(full)
    }

    fn root_canonical(&self) -> PathBuf {
        self.root_dir
            .canonicalize()
            .unwrap_or_else(|_| self.root_dir.clone())
    }

    pub async fn read_file(&self, path: &str) -> Result<String, ToolError> {
        let resolved = self.resolve(path)?;
        if resolved.is_dir() {
            return Err(ToolError::InvalidArguments(format!(
                "Path is a directory, not a file: {}",
                path
            )));
        }
        Ok(tokio::fs::read_to_string(&resolved).await?)
    }

    pub async fn write_file(&self, path: &str, content: &str) -> Result<PathBuf, ToolError> {
        let target = self.resolve_for_write(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, content).await?;
        Ok(target)
    }

    /// 条目格式 `dir: name (0 bytes)` / `file: name (N bytes)`，按名称排序
    pub async fn list_dir(&self, path: &str) -> Result<Vec<String>, ToolError> {
        let base = if path.is_empty() || path == "." {
            self.root_dir.clone()
        } else {
            self.resolve(path)?
        };
        let mut reader = tokio::fs::read_dir(&base).await?;
        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let meta = entry.metadata().await?;
            let (kind, size) = if meta.is_dir() {
                ("dir", 0)
            } else {
                ("file", meta.len())
            };
            entries.push((name, kind, size));
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries
            .into_iter()
            .map(|(name, kind, size)| format!("{}: {} ({} bytes)", kind, name, size))
            .collect())
    }
}

/// read_file：读取文本文件
pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read the contents of a file in the workspace"
    }

    fn parameters(&self) -> Vec<ToolParameter> {
        vec![ToolParameter::required(
            "path",
            ParamType::String,
            "Path to the file, relative to the workspace",
        )]
    }

    async fn invoke(&self, args: &Map<String, Value>, ctx: &ToolContext) -> Result<Value, ToolError> {
        let path = required_str(args, "path")?;
        let content = SafeFs::new(ctx.workspace_root()).read_file(path).await?;
        ctx.span.in_scope(|| tracing::info!(path = %path, size = content.len(), "read file"));
        Ok(Value::String(content))
    }
}

/// write_file：写入文本文件（自动创建父目录）
pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file in the workspace, creating parent directories"
    }

    fn parameters(&self) -> Vec<ToolParameter> {
        vec![
            ToolParameter::required("path", ParamType::String, "Path to the file to write"),
            ToolParameter::required("content", ParamType::String, "Content to write"),
        ]
    }

    async fn invoke(&self, args: &Map<String, Value>, ctx: &ToolContext) -> Result<Value, ToolError> {
        let path = required_str(args, "path")?;
        let content = required_str(args, "content")?;
        let fs = SafeFs::new(ctx.workspace_root());
        tokio::fs::create_dir_all(fs.root()).await?;
        fs.write_file(path, content).await?;
        ctx.span.in_scope(|| tracing::info!(path = %path, size = content.len(), "wrote file"));
        Ok(json!(format!(
            "Successfully wrote {} bytes to {}",
            content.len(),
            path
        )))
    }
}

/// list_directory：列出目录（默认工作目录根）
pub struct ListDirectoryTool;

#[async_trait]
impl Tool for ListDirectoryTool {
    fn name(&self) -> &str {
        "list_directory"
    }

    fn description(&self) -> &str {
        "List files and directories in a workspace path"
    }

    fn parameters(&self) -> Vec<ToolParameter> {
        vec![ToolParameter::optional(
            "path",
            ParamType::String,
            "Directory to list (defaults to the workspace root)",
        )]
    }

    async fn invoke(&self, args: &Map<String, Value>, ctx: &ToolContext) -> Result<Value, ToolError> {
        let path = optional_str(args, "path").unwrap_or(".");
        let entries = SafeFs::new(ctx.workspace_root()).list_dir(path).await?;
        ctx.span.in_scope(|| tracing::info!(path = %path, count = entries.len(), "listed directory"));
        Ok(json!(entries))
    }
}
