//! 桥接与设备配置
//!
//! ## 配置格式
//!
//! ```json
//! // bridge
//! { "port_name": "/dev/ttyUSB0", "debug": false, "low_prio_tasks_per_cycle": 2 }
//!
//! // device
//! {
//!   "address": 231,
//!   "read_buffer_bytes": 70,
//!   "send_buffer_bytes": 102,
//!   "tasks": [
//!     { "name": "h", "head_class": 2, "address": 37, "byte_size": 2, "priority": "high" },
//!     { "name": "start", "head_class": 3, "address": 6, "priority": "high" }
//!   ]
//! }
//! ```

use crate::error::GenibusError;
use crate::task::{Priority, Task};
use serde::{Deserialize, Serialize};

/// GENIbus 桥接配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenibusConfig {
    /// 串口名称
    pub port_name: String,
    /// 以 info 级别输出收发帧
    #[serde(default)]
    pub debug: bool,
    /// 每周期从 LOW 池轮转取出的任务数
    #[serde(default = "default_low_prio_tasks_per_cycle")]
    pub low_prio_tasks_per_cycle: usize,
    /// 首个周期使用的周期时长估计（毫秒）
    #[serde(default = "default_cycle_time")]
    pub default_cycle_time_ms: u64,
    /// 时间预算受限时按比例缩小应答预算（可调启发式，非协议约束）
    #[serde(default = "default_scale_answer_budget")]
    pub scale_answer_budget: bool,
    /// 发送前清空残留输入的宽限时间（毫秒）
    #[serde(default = "default_drain_grace")]
    pub drain_grace_ms: u64,
}

fn default_low_prio_tasks_per_cycle() -> usize {
    2
}

fn default_cycle_time() -> u64 {
    1000
}

fn default_scale_answer_budget() -> bool {
    true
}

fn default_drain_grace() -> u64 {
    20
}

impl GenibusConfig {
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            debug: false,
            low_prio_tasks_per_cycle: default_low_prio_tasks_per_cycle(),
            default_cycle_time_ms: default_cycle_time(),
            scale_answer_budget: default_scale_answer_budget(),
            drain_grace_ms: default_drain_grace(),
        }
    }

    /// 从 JSON 配置字符串解析
    pub fn from_json(json: &str) -> Result<Self, GenibusError> {
        serde_json::from_str(json).map_err(|e| GenibusError::ConfigParse(e.to_string()))
    }
}

/// 设备静态任务条目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// 任务名称（供上层通道映射）
    pub name: String,
    /// 头类：0/2/3/4/5/7
    pub head_class: u8,
    /// 数据项 ID
    pub address: u8,
    /// 数据宽度（字节）
    #[serde(default = "default_byte_size")]
    pub byte_size: usize,
    pub priority: Priority,
}

fn default_byte_size() -> usize {
    1
}

impl TaskSpec {
    pub fn to_task(&self) -> Result<Task, GenibusError> {
        Task::new(
            self.name.clone(),
            self.head_class,
            self.address,
            self.byte_size,
            self.priority,
        )
    }
}

/// 设备注册配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// 总线地址
    pub address: u8,
    /// 设备接收缓冲区（限制请求帧长度）
    #[serde(default = "default_buffer_bytes")]
    pub read_buffer_bytes: usize,
    /// 设备发送缓冲区（限制应答帧长度）
    #[serde(default = "default_buffer_bytes")]
    pub send_buffer_bytes: usize,
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
}

fn default_buffer_bytes() -> usize {
    70
}

impl DeviceConfig {
    pub fn from_json(json: &str) -> Result<Self, GenibusError> {
        serde_json::from_str(json).map_err(|e| GenibusError::ConfigParse(e.to_string()))
    }

    /// 解析设备列表
    pub fn list_from_json(json: &str) -> Result<Vec<Self>, GenibusError> {
        serde_json::from_str(json).map_err(|e| GenibusError::ConfigParse(e.to_string()))
    }
}
