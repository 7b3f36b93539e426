//! 支持的语言：扩展名、本地解释器命令、容器镜像与容器内命令

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::sandbox::SandboxError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    Python,
    JavaScript,
    /// 仅本地执行器支持（ts-node）
    TypeScript,
    Bash,
    Sh,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::TypeScript => "typescript",
            Language::Bash => "bash",
            Language::Sh => "sh",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Language::Python => "py",
            Language::JavaScript => "js",
            Language::TypeScript => "ts",
            Language::Bash | Language::Sh => "sh",
        }
    }

    pub fn script_name(&self) -> String {
        format!("main.{}", self.extension())
    }

    /// 本地解释器及参数
    pub fn local_command(&self, script: &Path) -> (&'static str, Vec<String>) {
        let script = script.to_string_lossy().into_owned();
        match self {
            Language::Python => ("python3", vec![script]),
            Language::JavaScript => ("node", vec![script]),
            Language::TypeScript => ("ts-node", vec![script]),
            Language::Bash => ("bash", vec![script]),
            Language::Sh => ("sh", vec![script]),
        }
    }

    /// 容器镜像；TypeScript 无对应镜像
    pub fn container_image(&self) -> Option<&'static str> {
        match self {
            Language::Python => Some("python:3.11-alpine"),
            Language::JavaScript => Some("node:20-alpine"),
            Language::TypeScript => None,
            // alpine 镜像只有 busybox sh，bash 脚本同样交给 sh
            Language::Bash | Language::Sh => Some("alpine:latest"),
        }
    }

    /// 容器内命令，脚本位于 /workspace
    pub fn container_command(&self, script_name: &str) -> Vec<String> {
        let script = format!("/workspace/{}", script_name);
        let program = match self {
            Language::Python => "python3",
            Language::JavaScript => "node",
            Language::TypeScript => "ts-node",
            Language::Bash | Language::Sh => "sh",
        };
        vec![program.to_string(), script]
    }
}

impl FromStr for Language {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "python" | "python3" | "py" => Ok(Language::Python),
            "javascript" | "js" | "node" => Ok(Language::JavaScript),
            "typescript" | "ts" => Ok(Language::TypeScript),
            "bash" | "shell" => Ok(Language::Bash),
            "sh" => Ok(Language::Sh),
            other => Err(SandboxError::UnsupportedLanguage(other.to_string())),
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_aliases() {
        assert_eq!("py".parse::<Language>().unwrap(), Language::Python);
        assert_eq!("JS".parse::<Language>().unwrap(), Language::JavaScript);
        assert_eq!("shell".parse::<Language>().unwrap(), Language::Bash);
        assert_eq!("sh".parse::<Language>().unwrap(), Language::Sh);
        let err = "cobol".parse::<Language>().unwrap_err();
        assert_eq!(err.to_string(), "Unsupported language: cobol");
    }

    #[test]
    fn test_container_support() {
        assert_eq!(Language::Python.container_image(), Some("python:3.11-alpine"));
        assert!(Language::TypeScript.container_image().is_none());
        assert_eq!(
            Language::Sh.container_command("main.sh"),
            vec!["sh".to_string(), "/workspace/main.sh".to_string()]
        );
    }
}
