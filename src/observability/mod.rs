//! 可观测性：tracing 订阅器初始化
//!
//! 过滤规则优先取 RUST_LOG，否则用 [telemetry].filter；log_format = "json" 时输出结构化 JSON。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::TelemetrySection;

fn env_filter(telemetry: &TelemetrySection) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&telemetry.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// 重复初始化时保留已有订阅器
pub fn init(telemetry: &TelemetrySection) {
    let registry = tracing_subscriber::registry().with(env_filter(telemetry));
    let result = if telemetry.log_format.eq_ignore_ascii_case("json") {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer()).try_init()
    };
    if result.is_err() {
        tracing::debug!("tracing subscriber already initialized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_harmless() {
        let telemetry = TelemetrySection {
            log_format: "json".to_string(),
            filter: "drone=debug".to_string(),
        };
        init(&telemetry);
        init(&TelemetrySection::default());
    }
}
