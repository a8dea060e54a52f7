//! 桥接进程运行配置加载。

use std::env;

/// 配置加载错误。
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required env: {0}")]
    Missing(String),
    #[error("invalid value for {0}: {1}")]
    Invalid(String, String),
}

/// 桥接进程运行配置。
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port_name: String,
    pub debug: bool,
    /// 设备列表 JSON 文件路径
    pub devices_path: String,
    pub cycle_time_ms: u64,
    pub low_prio_tasks_per_cycle: u64,
    pub scale_answer_budget: bool,
    pub drain_grace_ms: u64,
}

impl AppConfig {
    /// 从环境变量读取配置。
    pub fn from_env() -> Result<Self, ConfigError> {
        let port_name = env::var("EMS_GENIBUS_PORT")
            .map_err(|_| ConfigError::Missing("EMS_GENIBUS_PORT".to_string()))?;
        let debug = read_bool_with_default("EMS_GENIBUS_DEBUG", false);
        let devices_path =
            read_optional("EMS_GENIBUS_DEVICES").unwrap_or_else(|| "devices.json".to_string());
        let cycle_time_ms = read_u64_with_default("EMS_GENIBUS_CYCLE_TIME_MS", 1000)?;
        if cycle_time_ms == 0 {
            return Err(ConfigError::Invalid(
                "EMS_GENIBUS_CYCLE_TIME_MS".to_string(),
                "0".to_string(),
            ));
        }
        let low_prio_tasks_per_cycle = read_u64_with_default("EMS_GENIBUS_LOW_PRIO_PER_CYCLE", 2)?;
        let scale_answer_budget = read_bool_with_default("EMS_GENIBUS_SCALE_ANSWER_BUDGET", true);
        let drain_grace_ms = read_u64_with_default("EMS_GENIBUS_DRAIN_GRACE_MS", 20)?;

        Ok(Self {
            port_name,
            debug,
            devices_path,
            cycle_time_ms,
            low_prio_tasks_per_cycle,
            scale_answer_budget,
            drain_grace_ms,
        })
    }
}

fn read_u64_with_default(key: &str, default: u64) -> Result<u64, ConfigError> {
    let value = match env::var(key) {
        Ok(value) => value,
        Err(_) => return Ok(default),
    };
    value
        .parse::<u64>()
        .map_err(|_| ConfigError::Invalid(key.to_string(), value))
}

fn read_optional(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) if !value.is_empty() => Some(value),
        _ => None,
    }
}

fn read_bool_with_default(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(value) => matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "on"),
        Err(_) => default,
    }
}
