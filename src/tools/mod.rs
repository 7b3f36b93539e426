//! 工具层：Tool trait、注册表、动作执行器与内置工具

pub mod code_execution;
pub mod echo;
pub mod executor;
pub mod filesystem;
pub mod registry;
pub mod schema;
pub mod search;

use std::sync::Arc;

pub use code_execution::ExecuteCodeTool;
pub use echo::EchoTool;
pub use executor::{ActionExecutor, DefaultActionExecutor, ExecutionStats, StatsSnapshot};
pub use filesystem::{ListDirectoryTool, ReadFileTool, SafeFs, WriteFileTool};
pub use registry::{
    optional_str, parameters_schema, required_str, ParamType, Tool, ToolContext, ToolError,
    ToolParameter, ToolRegistry,
};
pub use schema::response_schema_json;
pub use search::{WebFetchTool, WebSearchTool};

use crate::config::ToolsSection;
use crate::sandbox::CodeExecutor;

/// 按 [tools].enabled 注册内置工具；未提供执行器时跳过 execute_code
pub fn register_builtin_tools(
    registry: &mut ToolRegistry,
    tools: &ToolsSection,
    code_executor: Option<Arc<dyn CodeExecutor>>,
) {
    let mut builtins: Vec<Arc<dyn Tool>> = vec![
        Arc::new(EchoTool),
        Arc::new(ReadFileTool),
        Arc::new(WriteFileTool),
        Arc::new(ListDirectoryTool),
        Arc::new(WebFetchTool::new(&tools.web)),
        Arc::new(WebSearchTool::new(&tools.web)),
    ];
    if let Some(executor) = code_executor {
        builtins.push(Arc::new(ExecuteCodeTool::new(executor)));
    }

    for tool in builtins {
        if tools.is_enabled(tool.name()) {
            registry.register_arc(tool);
        }
    }
    tracing::debug!(tools = ?registry.names(), "builtin tools registered");
}
