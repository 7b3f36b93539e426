//! Echo 工具（测试用）

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::tools::{optional_str, ParamType, Tool, ToolContext, ToolError, ToolParameter};

/// Echo 工具：回显文本
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo text back (for testing)"
    }

    fn parameters(&self) -> Vec<ToolParameter> {
        vec![ToolParameter::required(
            "text",
            ParamType::String,
            "Text to echo",
        )]
    }

    async fn invoke(&self, args: &Map<String, Value>, _ctx: &ToolContext) -> Result<Value, ToolError> {
        let text = optional_str(args, "text").unwrap_or("(empty)");
        Ok(json!({ "text": text }))
    }
}
