//! 设备注册表
//!
//! 每个设备持有：总线地址、缓冲区上限、在线标定的时间模型、
//! 连接健康计数，以及 HIGH / LOW / ONCE 三级任务池。
//!
//! 设备健康状态机：
//!
//! ```text
//! 在线 ──无应答──▶ timeout_counter += 1（上限 3）
//!   ▲                    │
//!   │                    ▼ timeout_counter == 3
//!   └──任意有效应答── 疑似离线（仅每 5s 发送一次空帧探测）
//! ```

use crate::config::DeviceConfig;
use crate::error::GenibusError;
use crate::frame::{FRAME_OVERHEAD, MAX_FRAME_LEN};
use crate::task::{Priority, Task, TaskId};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// 连续超时上限，达到后视为疑似离线
pub const TIMEOUT_LIMIT: u8 = 3;
/// 疑似离线设备的探测间隔
pub const OFFLINE_PROBE_INTERVAL: Duration = Duration::from_secs(5);
/// 总线最大应答间隔
pub const BUS_TURNAROUND_MS: f64 = 60.0;
/// 低于该 APDU 字节数的帧不参与每字节耗时标定
pub const CALIBRATION_MIN_BODY: usize = 10;

/// 9600 波特下一往一返约 2 字节时间
const DEFAULT_MS_PER_BYTE: f64 = 2.2;
const DEFAULT_EMPTY_TELEGRAM_MS: f64 = 40.0;

/// 上层故障上报使用的健康快照
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceHealth {
    pub connection_ok: bool,
    pub timeout_counter: u8,
    pub suspected_offline: bool,
}

/// 单个设备的调度、标定与健康状态
#[derive(Debug)]
pub struct DeviceState {
    pub address: u8,
    pub read_buffer_bytes: usize,
    pub send_buffer_bytes: usize,
    pub ms_per_byte: f64,
    pub empty_telegram_time_ms: f64,
    pub timeout_counter: u8,
    pub connection_ok: bool,
    /// 复位 / 连接后的第一帧：需要加入全部 ONCE 任务
    pub first_telegram: bool,
    /// 标定用空帧是否已发送
    pub empty_telegram_sent: bool,
    /// 本周期补充时 LOW 池已全部加入
    pub all_low_prio_tasks_added: bool,
    pub(crate) tasks: Vec<Task>,
    pub(crate) task_queue: VecDeque<TaskId>,
    pub(crate) high_tasks: Vec<TaskId>,
    pub(crate) low_tasks: Vec<TaskId>,
    pub(crate) low_cursor: usize,
    /// 本周期已从 LOW 池加入的任务数
    pub(crate) low_added_in_cycle: usize,
    pub(crate) once_tasks: Vec<TaskId>,
    /// 等待 INFO 完成的 ONCE 任务
    pub(crate) once_awaiting_info: Vec<TaskId>,
    /// INFO 已完成、下个周期执行 GET/SET 的 ONCE 任务
    pub(crate) once_followup: Vec<TaskId>,
    pub(crate) filled_generation: Option<u64>,
    pub(crate) topped_up_generation: Option<u64>,
    pub(crate) served_generation: Option<u64>,
    pub(crate) last_probe: Option<Instant>,
}

impl DeviceState {
    pub fn from_config(config: &DeviceConfig) -> Result<Self, GenibusError> {
        for (name, bytes) in [
            ("read_buffer_bytes", config.read_buffer_bytes),
            ("send_buffer_bytes", config.send_buffer_bytes),
        ] {
            if !(FRAME_OVERHEAD..=MAX_FRAME_LEN).contains(&bytes) {
                return Err(GenibusError::ConfigParse(format!(
                    "device {}: {} {} not in {}..={}",
                    config.address, name, bytes, FRAME_OVERHEAD, MAX_FRAME_LEN
                )));
            }
        }

        let tasks = config
            .tasks
            .iter()
            .map(|spec| spec.to_task())
            .collect::<Result<Vec<_>, _>>()?;

        let ids_with = |priority: Priority| -> Vec<TaskId> {
            tasks
                .iter()
                .enumerate()
                .filter(|(_, task)| task.priority == priority)
                .map(|(id, _)| id)
                .collect()
        };
        let high_tasks = ids_with(Priority::High);
        let low_tasks = ids_with(Priority::Low);
        let once_tasks = ids_with(Priority::Once);

        Ok(Self {
            address: config.address,
            read_buffer_bytes: config.read_buffer_bytes,
            send_buffer_bytes: config.send_buffer_bytes,
            ms_per_byte: DEFAULT_MS_PER_BYTE,
            empty_telegram_time_ms: DEFAULT_EMPTY_TELEGRAM_MS,
            timeout_counter: 0,
            connection_ok: false,
            first_telegram: true,
            empty_telegram_sent: false,
            all_low_prio_tasks_added: false,
            tasks,
            task_queue: VecDeque::new(),
            high_tasks,
            low_tasks,
            low_cursor: 0,
            low_added_in_cycle: 0,
            once_tasks,
            once_awaiting_info: Vec::new(),
            once_followup: Vec::new(),
            filled_generation: None,
            topped_up_generation: None,
            served_generation: None,
            last_probe: None,
        })
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn task_id(&self, name: &str) -> Option<TaskId> {
        self.tasks.iter().position(|task| task.name == name)
    }

    pub fn task_by_name(&self, name: &str) -> Option<&Task> {
        self.tasks.iter().find(|task| task.name == name)
    }

    pub fn task_by_name_mut(&mut self, name: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|task| task.name == name)
    }

    /// 当前任务队列（队首先出）
    pub fn queue(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.task_queue.iter().copied()
    }

    pub fn queue_len(&self) -> usize {
        self.task_queue.len()
    }

    /// 入队；任务已在队列中时返回 false
    pub(crate) fn enqueue(&mut self, id: TaskId) -> bool {
        if self.task_queue.contains(&id) {
            return false;
        }
        self.task_queue.push_back(id);
        true
    }

    pub fn health(&self) -> DeviceHealth {
        DeviceHealth {
            connection_ok: self.connection_ok,
            timeout_counter: self.timeout_counter,
            suspected_offline: self.is_suspected_offline(),
        }
    }

    pub fn is_suspected_offline(&self) -> bool {
        self.timeout_counter >= TIMEOUT_LIMIT
    }

    /// 疑似离线设备是否到了探测时间
    pub fn probe_due(&self, now: Instant) -> bool {
        match self.last_probe {
            Some(last) => now.duration_since(last) >= OFFLINE_PROBE_INTERVAL,
            None => true,
        }
    }

    /// 设备复位：清空队列，下个周期重新加入 ONCE 与全部 HIGH 任务
    ///
    /// 本周期内不再为该设备填充队列。
    pub fn reset(&mut self) {
        self.connection_ok = false;
        self.task_queue.clear();
        self.first_telegram = true;
        self.all_low_prio_tasks_added = false;
        self.once_awaiting_info.clear();
        self.once_followup.clear();
        debug!(target: "ems.genibus", device = self.address, "device reset");
    }

    /// 本次交换无应答
    pub fn record_timeout(&mut self) {
        let was_offline = self.is_suspected_offline();
        self.timeout_counter = (self.timeout_counter + 1).min(TIMEOUT_LIMIT);
        if self.is_suspected_offline() && !was_offline {
            warn!(
                target: "ems.genibus",
                device = self.address,
                "no answer {} times in a row, device suspected offline",
                TIMEOUT_LIMIT
            );
        }
        self.reset();
    }

    /// 收到有效应答
    pub fn record_answer(&mut self) {
        if self.is_suspected_offline() {
            debug!(target: "ems.genibus", device = self.address, "device answered again");
        }
        self.timeout_counter = 0;
        self.connection_ok = true;
    }

    /// 用一次成功交换的耗时修正时间模型
    ///
    /// `body_len` 为请求与应答的 APDU 字节数之和。
    pub fn calibrate(&mut self, body_len: usize, duration_ms: f64) {
        if body_len == 0 {
            self.empty_telegram_time_ms = duration_ms;
            return;
        }
        if body_len <= CALIBRATION_MIN_BODY {
            return;
        }
        let per_byte = (duration_ms - self.empty_telegram_time_ms) / body_len as f64;
        if per_byte > 0.0 {
            self.ms_per_byte = per_byte;
        }
    }

    /// 应答等待窗口
    pub fn read_timeout(&self, body_len: usize) -> Duration {
        let millis =
            self.empty_telegram_time_ms + body_len as f64 * self.ms_per_byte + BUS_TURNAROUND_MS;
        Duration::from_micros((millis.max(0.0) * 1000.0).round() as u64)
    }

    /// 请求帧 APDU 字节上限
    pub fn send_budget(&self) -> usize {
        self.read_buffer_bytes.saturating_sub(FRAME_OVERHEAD)
    }

    /// 应答帧 APDU 字节上限
    pub fn answer_budget(&self) -> usize {
        self.send_buffer_bytes.saturating_sub(FRAME_OVERHEAD)
    }
}

/// 设备注册表，按轮转顺序服务设备
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Vec<DeviceState>,
    cursor: usize,
    generation: u64,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_device(&mut self, config: &DeviceConfig) -> Result<(), GenibusError> {
        if self.device(config.address).is_some() {
            return Err(GenibusError::ConfigParse(format!(
                "device address {} already registered",
                config.address
            )));
        }
        let device = DeviceState::from_config(config)?;
        debug!(
            target: "ems.genibus",
            device = device.address,
            tasks = device.tasks.len(),
            "device registered"
        );
        self.devices.push(device);
        Ok(())
    }

    pub fn remove_device(&mut self, address: u8) -> Option<DeviceState> {
        let index = self.devices.iter().position(|d| d.address == address)?;
        let device = self.devices.remove(index);
        if index < self.cursor {
            self.cursor -= 1;
        }
        if self.cursor >= self.devices.len() {
            self.cursor = 0;
        }
        Some(device)
    }

    pub fn device(&self, address: u8) -> Option<&DeviceState> {
        self.devices.iter().find(|d| d.address == address)
    }

    pub fn device_mut(&mut self, address: u8) -> Option<&mut DeviceState> {
        self.devices.iter_mut().find(|d| d.address == address)
    }

    pub fn devices(&self) -> &[DeviceState] {
        &self.devices
    }

    pub fn devices_mut(&mut self) -> &mut [DeviceState] {
        &mut self.devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// 新的控制周期，返回周期代号
    pub fn begin_cycle(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn cursor(&self) -> usize {
        self.cursor
    }

    pub(crate) fn set_cursor(&mut self, cursor: usize) {
        self.cursor = if self.devices.is_empty() {
            0
        } else {
            cursor % self.devices.len()
        };
    }

    /// 串口断开：全部设备标记为未连接并复位，重连后重新标定空帧
    pub fn reset_all(&mut self) {
        for device in &mut self.devices {
            device.reset();
            device.empty_telegram_sent = false;
        }
    }
}
