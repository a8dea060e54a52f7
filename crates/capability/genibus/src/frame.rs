//! GENIbus 帧格式
//!
//! ```text
//! [SD:1][LE:1][DA:1][SA:1][APDU...][CRC_H:1][CRC_L:1]
//!
//! APDU: [class:1][op/ack:2bit | length:6bit][data...]
//! ```
//!
//! - `LE = 总长度 - 4`
//! - CRC16/GENIBUS 覆盖 `LE..APDU`（不含起始符与 CRC 本身），高字节在前

use crate::error::{AckCode, GenibusError};
use crc::{CRC_16_GENIBUS, Crc};

/// 数据请求起始符
pub const SD_DATA_REQUEST: u8 = 0x27;
/// 数据应答起始符
pub const SD_DATA_REPLY: u8 = 0x24;
/// 数据消息起始符
pub const SD_DATA_MESSAGE: u8 = 0x26;

/// 主站地址
pub const MASTER_ADDRESS: u8 = 0x01;
/// 广播地址（设备用自己的真实地址应答）
pub const BROADCAST_ADDRESS: u8 = 254;

/// 每帧固定开销：SD、LE、DA、SA、CRC×2
pub const FRAME_OVERHEAD: usize = 6;
/// 最长帧：LE 为 1 字节，计 DA 到 CRC 之前的字节
pub const MAX_FRAME_LEN: usize = u8::MAX as usize + 4;
/// APDU 头长度
pub const APDU_HEADER_BYTES: usize = 2;
/// APDU 数据区上限
pub const APDU_MAX_DATA: usize = 63;
/// INFO APDU 数据区上限（每项应答最多扩展到 4 字节）
pub const INFO_APDU_MAX_DATA: usize = 15;

const GENIBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_GENIBUS);

/// GENIbus 操作码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Operation {
    Get,
    Set,
    Info,
}

impl Operation {
    pub fn code(self) -> u8 {
        match self {
            Self::Get => 0,
            Self::Set => 2,
            Self::Info => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Get),
            2 => Some(Self::Set),
            3 => Some(Self::Info),
            _ => None,
        }
    }

    /// 该操作 APDU 的数据区上限
    pub fn max_apdu_data(self) -> usize {
        match self {
            Self::Info => INFO_APDU_MAX_DATA,
            Self::Get | Self::Set => APDU_MAX_DATA,
        }
    }
}

/// 计算 CRC16/GENIBUS
pub fn crc16(bytes: &[u8]) -> u16 {
    GENIBUS_CRC.checksum(bytes)
}

pub fn is_start_delimiter(byte: u8) -> bool {
    matches!(byte, SD_DATA_REQUEST | SD_DATA_REPLY | SD_DATA_MESSAGE)
}

/// 校验完整帧：起始符、长度字节、CRC
pub fn package_ok(bytes: &[u8]) -> bool {
    if bytes.len() < FRAME_OVERHEAD {
        return false;
    }
    if !is_start_delimiter(bytes[0]) {
        return false;
    }
    if bytes[1] as usize != bytes.len() - 4 {
        return false;
    }
    let crc_index = bytes.len() - 2;
    let expected = u16::from_be_bytes([bytes[crc_index], bytes[crc_index + 1]]);
    crc16(&bytes[1..crc_index]) == expected
}

/// 应用协议数据单元
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Apdu {
    /// 头类（数据类）
    pub head_class: u8,
    /// 请求中为操作码，应答中为应答码（2 位）
    pub op_ack: u8,
    pub data: Vec<u8>,
}

impl Apdu {
    pub fn request(head_class: u8, operation: Operation, data: Vec<u8>) -> Self {
        Self {
            head_class,
            op_ack: operation.code(),
            data,
        }
    }

    pub fn reply(head_class: u8, ack: AckCode, data: Vec<u8>) -> Self {
        Self {
            head_class,
            op_ack: ack.bits(),
            data,
        }
    }

    pub fn operation(&self) -> Option<Operation> {
        Operation::from_code(self.op_ack)
    }

    pub fn ack(&self) -> AckCode {
        AckCode::from_bits(self.op_ack)
    }

    /// 编码后长度（头 + 数据）
    pub fn encoded_len(&self) -> usize {
        APDU_HEADER_BYTES + self.data.len()
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.head_class);
        out.push((self.op_ack << 6) | (self.data.len() as u8 & 0x3F));
        out.extend_from_slice(&self.data);
    }
}

/// 一帧请求或应答
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Telegram {
    pub start_delimiter: u8,
    pub destination: u8,
    pub source: u8,
    pub apdus: Vec<Apdu>,
}

impl Telegram {
    /// 主站发往设备的请求帧
    pub fn request(destination: u8, apdus: Vec<Apdu>) -> Self {
        Self {
            start_delimiter: SD_DATA_REQUEST,
            destination,
            source: MASTER_ADDRESS,
            apdus,
        }
    }

    /// 不含 APDU 的空请求（探测 / 标定用）
    pub fn empty(destination: u8) -> Self {
        Self::request(destination, Vec::new())
    }

    /// APDU 总字节数（LE - 2）
    pub fn body_len(&self) -> usize {
        self.apdus.iter().map(Apdu::encoded_len).sum()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, GenibusError> {
        if let Some(apdu) = self.apdus.iter().find(|a| a.data.len() > APDU_MAX_DATA) {
            return Err(GenibusError::Encode(format!(
                "apdu of class {} carries {} bytes",
                apdu.head_class,
                apdu.data.len()
            )));
        }
        let length = 2 + self.body_len();
        if length > u8::MAX as usize {
            return Err(GenibusError::Encode(format!("telegram too long: {}", length)));
        }

        let mut out = Vec::with_capacity(length + 4);
        out.push(self.start_delimiter);
        out.push(length as u8);
        out.push(self.destination);
        out.push(self.source);
        for apdu in &self.apdus {
            apdu.encode_into(&mut out);
        }
        let crc = crc16(&out[1..]);
        out.extend_from_slice(&crc.to_be_bytes());
        Ok(out)
    }

    /// 解析完整帧，先做 `package_ok` 校验
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, GenibusError> {
        if !package_ok(bytes) {
            return Err(GenibusError::Framing(format!(
                "invalid frame of {} bytes",
                bytes.len()
            )));
        }

        let end = bytes.len() - 2;
        let mut apdus = Vec::new();
        let mut index = 4;
        while index < end {
            if index + APDU_HEADER_BYTES > end {
                return Err(GenibusError::Framing("truncated apdu header".to_string()));
            }
            let head_class = bytes[index];
            let op_ack = bytes[index + 1] >> 6;
            let len = (bytes[index + 1] & 0x3F) as usize;
            let data_start = index + APDU_HEADER_BYTES;
            if data_start + len > end {
                return Err(GenibusError::Framing(format!(
                    "apdu length {} exceeds frame",
                    len
                )));
            }
            apdus.push(Apdu {
                head_class,
                op_ack,
                data: bytes[data_start..data_start + len].to_vec(),
            });
            index = data_start + len;
        }

        Ok(Self {
            start_delimiter: bytes[0],
            destination: bytes[2],
            source: bytes[3],
            apdus,
        })
    }
}

/// 以十六进制输出帧内容（调试日志）
pub fn hex_dump(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
