//! # GENIbus 主站桥接能力模块
//!
//! 通过 RS-485 串口轮询 GENIbus 设备（水泵等），支持：
//! - **帧编解码**：起始符 / 长度 / 地址 / APDU / CRC16
//! - **任务调度**：HIGH 每周期、LOW 轮转、ONCE 连接后一次
//! - **报文打包**：按设备缓冲区与剩余周期时间的字节预算装入 APDU
//! - **应答解析**：按位置回填任务值，结构不符时复位设备
//! - **健康状态**：连续无应答计数，疑似离线设备低频探测
//!
//! ## 架构设计
//!
//! ```text
//! GenibusBridge::trigger_next_run (每个控制周期)
//!       │
//!       ▼
//! TelegramBuilder ── DeviceRegistry (HIGH / LOW / ONCE 任务池)
//!       │  plan → commit
//!       ▼
//! SerialTransport ── PortConnector (tokio-serial / 测试管道)
//!       │
//!       ▼
//! interpret → Task 值 / DataInfo / DeviceHealth
//! ```
//!
//! ## 配置格式
//!
//! ```json
//! // 桥接
//! { "port_name": "/dev/ttyUSB0", "low_prio_tasks_per_cycle": 2 }
//!
//! // 设备
//! { "address": 32, "tasks": [{ "name": "head", "head_class": 2, "address": 37, "priority": "high" }] }
//! ```

mod bridge;
mod config;
mod device;
mod error;
mod frame;
mod interpreter;
mod packing;
mod scheduler;
mod task;
mod transport;

pub use bridge::{CycleReport, GenibusBridge};
pub use config::{DeviceConfig, GenibusConfig, TaskSpec};
pub use device::{
    BUS_TURNAROUND_MS, DeviceHealth, DeviceRegistry, DeviceState, OFFLINE_PROBE_INTERVAL,
    TIMEOUT_LIMIT,
};
pub use error::{AckCode, GenibusError};
pub use frame::{
    APDU_MAX_DATA, Apdu, BROADCAST_ADDRESS, INFO_APDU_MAX_DATA, MASTER_ADDRESS, Operation,
    SD_DATA_MESSAGE, SD_DATA_REPLY, SD_DATA_REQUEST, Telegram, crc16, hex_dump, package_ok,
};
pub use interpreter::{InterpretReport, interpret};
pub use packing::{ApduTasks, ByteBudget, PackedPlan, PlannedApdu, TelegramRequest, commit, plan};
pub use scheduler::{CycleBudget, TelegramBuilder, cycle_budget};
pub use task::{DataInfo, Priority, SendGetPhase, Task, TaskId, TaskKind};
pub use transport::{
    Exchange, FrameAssembler, PortConnector, ReceiveState, SerialIo, SerialTransport,
    TokioSerialConnector,
};
