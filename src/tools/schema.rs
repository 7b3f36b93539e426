//! 响应格式 JSON Schema（schemars 生成）
//!
//! 注入不支持 function calling 的模型的 system prompt，约束其输出 `{"command", "arguments", ...}`。

use std::collections::HashMap;

use schemars::{schema_for, JsonSchema};

/// 模型应返回的 JSON 结构（仅用于 Schema 生成）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct ResponseFormat {
    /// 要调用的工具名；任务完成时为 task_complete
    pub command: String,
    /// 工具参数，键为参数名
    pub arguments: HashMap<String, serde_json::Value>,
    /// 选择该动作的理由
    pub reasoning: Vec<String>,
    /// 后续步骤（可选）
    pub plan: Option<Vec<String>>,
}

/// 返回响应格式的 JSON Schema 字符串，可拼入 system prompt
pub fn response_schema_json() -> String {
    let schema = schema_for!(ResponseFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}
