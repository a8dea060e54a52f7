//! 任务模型：设备上一个可寻址的 GENIbus 数据项
//!
//! 头类决定编码方式与所需操作：
//!
//! | 头类 | 变体 | 操作 |
//! |---|---|---|
//! | 0 | `Command` | 始终 GET |
//! | 2 | `DiscreteRead` | 未知格式时 INFO，否则 GET |
//! | 3 | `BooleanCommand` | 有待发命令时 SET（发出即清除） |
//! | 4/5 | `ReadWriteValue` | INFO → 确认读 GET → 待写值 SET |
//! | 7 | `Ascii` | 始终 GET，独占 APDU |

use crate::error::GenibusError;
use crate::frame::Operation;
use serde::{Deserialize, Serialize};

/// 任务在设备任务表中的下标
pub type TaskId = usize;

/// 任务调度优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// 每个周期都发送
    High,
    /// 每周期轮转取若干个
    Low,
    /// 连接建立（或复位）后发送一次
    Once,
}

/// 写后读确认阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendGetPhase {
    /// 无需确认读
    Idle,
    /// 下一次打包时执行 GET
    ConfirmDue,
    /// 本周期已 SET，下个周期转为 `ConfirmDue`
    AwaitingNextCycle,
}

const INFO_VI_BIT: u8 = 0x20;
const INFO_BO_BIT: u8 = 0x10;
const INFO_SIF_MASK: u8 = 0x03;

/// INFO 应答给出的数据格式
///
/// 头字节布局（GENIbus Protocol Specification，INFO 数据头）：
///
/// ```text
/// bit  7   6   5   4   3   2   1   0
///      1   0   VI  BO  0   0   SIF
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataInfo {
    /// vi=1：0..255 全部有效；vi=0：全 0xFF 表示不可用
    pub vi: bool,
    /// 字节序标志
    pub bo: bool,
    /// 比例信息格式
    pub sif: u8,
    pub unit: u8,
    pub zero: u8,
    pub range: u8,
}

impl DataInfo {
    /// 只有头字节的格式（sif = 0/1）
    pub fn from_header(header: u8) -> Self {
        Self {
            vi: header & INFO_VI_BIT != 0,
            bo: header & INFO_BO_BIT != 0,
            sif: header & INFO_SIF_MASK,
            unit: 0,
            zero: 0,
            range: 0,
        }
    }

    /// 头字节 + 单位、零点、量程
    pub fn with_scale(header: u8, unit: u8, zero: u8, range: u8) -> Self {
        Self {
            unit,
            zero,
            range,
            ..Self::from_header(header)
        }
    }

    /// 头字节之后应答还会携带的字节数
    pub fn trailing_len(header: u8) -> usize {
        if header & INFO_SIF_MASK >= 2 { 3 } else { 0 }
    }

    pub fn is_scaled(&self) -> bool {
        self.sif >= 2
    }
}

/// 按头类区分的任务状态
#[derive(Debug, Clone, PartialEq)]
pub enum TaskKind {
    /// 头类 0
    Command,
    /// 头类 2
    DiscreteRead { info: Option<DataInfo> },
    /// 头类 3
    BooleanCommand { pending: bool },
    /// 头类 4/5
    ReadWriteValue {
        head_class: u8,
        info: Option<DataInfo>,
        pending_write: Option<u32>,
        send_get_phase: SendGetPhase,
    },
    /// 头类 7
    Ascii,
}

/// 一个 GENIbus 数据项
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub name: String,
    pub address: u8,
    pub data_byte_size: usize,
    pub priority: Priority,
    pub kind: TaskKind,
    raw: Option<Vec<u8>>,
}

impl Task {
    pub fn new(
        name: impl Into<String>,
        head_class: u8,
        address: u8,
        data_byte_size: usize,
        priority: Priority,
    ) -> Result<Self, GenibusError> {
        let name = name.into();
        if !(1..=4).contains(&data_byte_size) {
            return Err(GenibusError::ConfigParse(format!(
                "task {}: byte size {} not in 1..=4",
                name, data_byte_size
            )));
        }
        let kind = match head_class {
            0 => TaskKind::Command,
            2 => TaskKind::DiscreteRead { info: None },
            3 => TaskKind::BooleanCommand { pending: false },
            4 | 5 => TaskKind::ReadWriteValue {
                head_class,
                info: None,
                pending_write: None,
                send_get_phase: SendGetPhase::ConfirmDue,
            },
            7 => TaskKind::Ascii,
            other => {
                return Err(GenibusError::ConfigParse(format!(
                    "task {}: unsupported head class {}",
                    name, other
                )));
            }
        };
        let data_byte_size = if matches!(kind, TaskKind::Ascii | TaskKind::BooleanCommand { .. }) {
            1
        } else {
            data_byte_size
        };
        Ok(Self {
            name,
            address,
            data_byte_size,
            priority,
            kind,
            raw: None,
        })
    }

    pub fn head_class(&self) -> u8 {
        match &self.kind {
            TaskKind::Command => 0,
            TaskKind::DiscreteRead { .. } => 2,
            TaskKind::BooleanCommand { .. } => 3,
            TaskKind::ReadWriteValue { head_class, .. } => *head_class,
            TaskKind::Ascii => 7,
        }
    }

    pub fn is_ascii(&self) -> bool {
        matches!(self.kind, TaskKind::Ascii)
    }

    /// 是否已通过 INFO 得知数据格式（无需 INFO 的头类恒为 true）
    pub fn information_known(&self) -> bool {
        match &self.kind {
            TaskKind::DiscreteRead { info } | TaskKind::ReadWriteValue { info, .. } => {
                info.is_some()
            }
            TaskKind::Command | TaskKind::BooleanCommand { .. } | TaskKind::Ascii => true,
        }
    }

    pub fn info(&self) -> Option<&DataInfo> {
        match &self.kind {
            TaskKind::DiscreteRead { info } | TaskKind::ReadWriteValue { info, .. } => {
                info.as_ref()
            }
            _ => None,
        }
    }

    /// 本次打包需要的操作；`None` 表示无事可做
    pub fn required_operation(&self) -> Option<Operation> {
        match &self.kind {
            TaskKind::Command | TaskKind::Ascii => Some(Operation::Get),
            TaskKind::DiscreteRead { info } => Some(if info.is_none() {
                Operation::Info
            } else {
                Operation::Get
            }),
            TaskKind::BooleanCommand { pending } => pending.then_some(Operation::Set),
            TaskKind::ReadWriteValue {
                info,
                pending_write,
                send_get_phase,
                ..
            } => {
                if info.is_none() {
                    Some(Operation::Info)
                } else if *send_get_phase == SendGetPhase::ConfirmDue {
                    Some(Operation::Get)
                } else if pending_write.is_some() {
                    Some(Operation::Set)
                } else {
                    None
                }
            }
        }
    }

    /// 请求中该任务占用的数据字节数
    pub fn request_len(&self, operation: Operation) -> usize {
        match (operation, &self.kind) {
            (Operation::Info, _) => 1,
            (Operation::Get, TaskKind::Ascii) => 1,
            (Operation::Get, _) => self.data_byte_size,
            (Operation::Set, TaskKind::BooleanCommand { .. }) => 1,
            (Operation::Set, _) => 2 * self.data_byte_size,
        }
    }

    /// 请求数据：GET/INFO 为 ID 列表，SET 为 (ID, 值) 对
    pub fn request_bytes(&self, operation: Operation) -> Vec<u8> {
        match (operation, &self.kind) {
            (Operation::Info, _)
            | (Operation::Get, TaskKind::Ascii)
            | (Operation::Set, TaskKind::BooleanCommand { .. }) => vec![self.address],
            (Operation::Get, _) => self.ids().collect(),
            (Operation::Set, TaskKind::ReadWriteValue { pending_write, .. }) => {
                let value = pending_write.unwrap_or_default().to_be_bytes();
                let value = &value[4 - self.data_byte_size..];
                self.ids()
                    .zip(value.iter().copied())
                    .flat_map(|(id, byte)| [id, byte])
                    .collect()
            }
            (Operation::Set, _) => Vec::new(),
        }
    }

    fn ids(&self) -> impl Iterator<Item = u8> + '_ {
        (0..self.data_byte_size).map(|offset| self.address.wrapping_add(offset as u8))
    }

    /// 任务被打包进请求后的副作用
    pub fn mark_packed(&mut self, operation: Operation) {
        match (&mut self.kind, operation) {
            (TaskKind::BooleanCommand { pending }, Operation::Set) => *pending = false,
            (
                TaskKind::ReadWriteValue {
                    pending_write,
                    send_get_phase,
                    ..
                },
                Operation::Set,
            ) => {
                *pending_write = None;
                *send_get_phase = SendGetPhase::AwaitingNextCycle;
            }
            (TaskKind::ReadWriteValue { send_get_phase, .. }, Operation::Get) => {
                *send_get_phase = SendGetPhase::Idle;
            }
            _ => {}
        }
    }

    /// 新周期开始；返回 true 表示本周期需要确认读
    pub fn advance_cycle(&mut self) -> bool {
        if let TaskKind::ReadWriteValue { send_get_phase, .. } = &mut self.kind {
            if *send_get_phase == SendGetPhase::AwaitingNextCycle {
                *send_get_phase = SendGetPhase::ConfirmDue;
                return true;
            }
        }
        false
    }

    pub fn set_write_value(&mut self, value: u32) -> Result<(), GenibusError> {
        match &mut self.kind {
            TaskKind::ReadWriteValue { pending_write, .. } => {
                *pending_write = Some(value);
                Ok(())
            }
            _ => Err(GenibusError::ConfigParse(format!(
                "task {} is not writable",
                self.name
            ))),
        }
    }

    pub fn request_command(&mut self) -> Result<(), GenibusError> {
        match &mut self.kind {
            TaskKind::BooleanCommand { pending } => {
                *pending = true;
                Ok(())
            }
            _ => Err(GenibusError::ConfigParse(format!(
                "task {} is not a command",
                self.name
            ))),
        }
    }

    pub fn pending_write(&self) -> Option<u32> {
        match &self.kind {
            TaskKind::ReadWriteValue { pending_write, .. } => *pending_write,
            _ => None,
        }
    }

    pub fn send_get_phase(&self) -> Option<SendGetPhase> {
        match &self.kind {
            TaskKind::ReadWriteValue { send_get_phase, .. } => Some(*send_get_phase),
            _ => None,
        }
    }

    pub fn apply_info(&mut self, data_info: DataInfo) {
        match &mut self.kind {
            TaskKind::DiscreteRead { info } | TaskKind::ReadWriteValue { info, .. } => {
                *info = Some(data_info);
            }
            _ => {}
        }
    }

    pub fn apply_raw(&mut self, bytes: &[u8]) {
        self.raw = Some(bytes.to_vec());
    }

    pub fn raw_bytes(&self) -> Option<&[u8]> {
        self.raw.as_deref()
    }

    /// 原始值（高字节在前）
    pub fn raw_value(&self) -> Option<u32> {
        if self.is_ascii() {
            return None;
        }
        let raw = self.raw.as_ref()?;
        Some(raw.iter().fold(0u32, |acc, byte| (acc << 8) | *byte as u32))
    }

    /// 按 INFO 比例换算后的值；不可用时返回 `None`
    pub fn scaled_value(&self) -> Option<f64> {
        let raw = self.raw.as_ref()?;
        let value = self.raw_value()?;
        let Some(info) = self.info() else {
            return Some(value as f64);
        };
        if !info.vi && !raw.is_empty() && raw.iter().all(|b| *b == 0xFF) {
            return None;
        }
        if !info.is_scaled() {
            return Some(value as f64);
        }
        let steps = 255.0 * 256f64.powi(raw.len() as i32 - 1) - 1.0;
        Some(info.zero as f64 + value as f64 * info.range as f64 / steps)
    }

    /// ASCII 文本（截断到第一个 0 字节）
    pub fn ascii(&self) -> Option<String> {
        if !self.is_ascii() {
            return None;
        }
        let raw = self.raw.as_ref()?;
        let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
        Some(String::from_utf8_lossy(&raw[..end]).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rw_task(size: usize) -> Task {
        let mut task = Task::new("ref_rem", 5, 1, size, Priority::Low).unwrap();
        task.apply_info(DataInfo::from_header(0x81));
        task
    }

    #[test]
    fn test_unknown_head_class_rejected() {
        assert!(Task::new("x", 6, 1, 1, Priority::High).is_err());
        assert!(Task::new("x", 2, 1, 5, Priority::High).is_err());
    }

    #[test]
    fn test_discrete_read_needs_info_first() {
        let mut task = Task::new("h", 2, 37, 2, Priority::High).unwrap();
        assert_eq!(task.required_operation(), Some(Operation::Info));
        assert_eq!(task.request_len(Operation::Info), 1);
        task.apply_info(DataInfo::from_header(0x82));
        assert_eq!(task.required_operation(), Some(Operation::Get));
        assert_eq!(task.request_bytes(Operation::Get), vec![37, 38]);
    }

    #[test]
    fn test_boolean_command_fires_once() {
        let mut task = Task::new("start", 3, 6, 1, Priority::High).unwrap();
        assert_eq!(task.required_operation(), None);
        task.request_command().unwrap();
        assert_eq!(task.required_operation(), Some(Operation::Set));
        task.mark_packed(Operation::Set);
        assert_eq!(task.required_operation(), None);
    }

    #[test]
    fn test_write_then_confirm_read() {
        let mut task = rw_task(2);
        // 首次得到格式后先读一次当前值
        assert_eq!(task.required_operation(), Some(Operation::Get));
        task.mark_packed(Operation::Get);
        assert_eq!(task.required_operation(), None);

        task.set_write_value(0x1234).unwrap();
        assert_eq!(task.required_operation(), Some(Operation::Set));
        assert_eq!(task.request_bytes(Operation::Set), vec![1, 0x12, 2, 0x34]);
        task.mark_packed(Operation::Set);
        assert_eq!(task.pending_write(), None);
        assert_eq!(task.required_operation(), None);

        assert!(task.advance_cycle());
        assert_eq!(task.required_operation(), Some(Operation::Get));
        task.mark_packed(Operation::Get);
        assert!(!task.advance_cycle());
        assert_eq!(task.required_operation(), None);
    }

    #[test]
    fn test_info_header_bits() {
        let info = DataInfo::from_header(0x82);
        assert!(!info.vi);
        assert!(!info.bo);
        assert!(info.is_scaled());

        let info = DataInfo::from_header(0xB1);
        assert!(info.vi);
        assert!(info.bo);
        assert_eq!(info.sif, 1);
        assert_eq!(DataInfo::trailing_len(0xB1), 0);
        assert_eq!(DataInfo::trailing_len(0x82), 3);
    }

    #[test]
    fn test_value_interpretation_keeps_0xff() {
        let mut task = Task::new("flow", 2, 39, 1, Priority::High).unwrap();
        task.apply_info(DataInfo::from_header(0xA1));
        task.apply_raw(&[0xFF]);
        assert_eq!(task.scaled_value(), Some(255.0));
    }

    #[test]
    fn test_scaled_value() {
        let mut task = Task::new("flow", 2, 39, 1, Priority::High).unwrap();
        task.apply_info(DataInfo::with_scale(0x02, 22, 0, 254));
        task.apply_raw(&[127]);
        assert_eq!(task.scaled_value(), Some(127.0));

        task.apply_raw(&[0xFF]);
        assert_eq!(task.scaled_value(), None);
        assert_eq!(task.raw_value(), Some(0xFF));
    }

    #[test]
    fn test_ascii_text() {
        let mut task = Task::new("serial", 7, 9, 1, Priority::Once).unwrap();
        task.apply_raw(b"MAGNA3\0\0");
        assert_eq!(task.ascii().as_deref(), Some("MAGNA3"));
        assert_eq!(task.raw_value(), None);
    }
}
