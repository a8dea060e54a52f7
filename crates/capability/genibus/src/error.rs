//! GENIbus 错误类型定义
//!
//! 错误在能做出决策的最低层处理（重试 / 复位设备 / 跳过 APDU），
//! 向上只暴露设备的 `connection_ok` 聚合状态。

use std::fmt;

/// APDU 应答码（应答 APDU 第二字节高 2 位）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckCode {
    /// 0：正常
    Ok,
    /// 1：未知数据类
    UnknownDataClass,
    /// 2：未知数据项 ID
    UnknownDataItem,
    /// 3：非法操作或写缓冲区已满
    IllegalOperation,
}

impl AckCode {
    /// 从 2 位应答码解析
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => Self::Ok,
            1 => Self::UnknownDataClass,
            2 => Self::UnknownDataItem,
            _ => Self::IllegalOperation,
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::UnknownDataClass => 1,
            Self::UnknownDataItem => 2,
            Self::IllegalOperation => 3,
        }
    }
}

impl fmt::Display for AckCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Ok => "ok",
            Self::UnknownDataClass => "unknown data class",
            Self::UnknownDataItem => "unknown data item id",
            Self::IllegalOperation => "illegal operation or write buffer full",
        };
        write!(f, "{} ({})", text, self.bits())
    }
}

/// GENIbus 桥接错误
#[derive(Debug, thiserror::Error)]
pub enum GenibusError {
    /// 串口缺失或无法打开，连接健康检查周期内重试
    #[error("transport error: {0}")]
    Transport(String),

    /// IO 错误
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// 帧错误（起始符 / 长度 / CRC），按本次交换超时处理
    #[error("framing error: {0}")]
    Framing(String),

    /// 本地编码失败（请求超出帧长度），请求未发出
    #[error("encode error: {0}")]
    Encode(String),

    /// 应答与请求结构不匹配（地址 / APDU 数量 / 头类），触发设备复位
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),

    /// APDU 否定应答，仅跳过该 APDU 的任务
    #[error("apdu nack: {code}")]
    ApduNack { code: AckCode },

    /// 计算窗口内未收到完整帧
    #[error("timeout after {0}ms")]
    Timeout(u64),

    /// 配置解析错误
    #[error("config parse error: {0}")]
    ConfigParse(String),
}

impl GenibusError {
    /// 是否应按"无应答"处理（计入设备超时计数）
    pub fn is_no_answer(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Framing(_))
    }
}
