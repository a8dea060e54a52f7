//! 应答解析
//!
//! 应答不携带数据项地址，按请求中的 APDU 顺序与任务顺序逐个对应。
//! 结构校验失败（地址、APDU 数量、头类）时复位设备；
//! 单个 APDU 否定应答只跳过该 APDU 的任务。

use crate::device::DeviceState;
use crate::error::{AckCode, GenibusError};
use crate::frame::{Apdu, BROADCAST_ADDRESS, MASTER_ADDRESS, Operation, SD_DATA_REPLY};
use crate::packing::{ApduTasks, TelegramRequest};
use crate::task::DataInfo;
use crate::transport::Exchange;
use tracing::{debug, warn};

/// 一次应答的处理结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterpretReport {
    /// 写入了新值或新格式的任务数
    pub decoded: usize,
    /// 否定应答的 APDU 数
    pub nacks: usize,
}

/// 处理一次成功收帧的交换
pub fn interpret(
    device: &mut DeviceState,
    request: &TelegramRequest,
    exchange: &Exchange,
) -> Result<InterpretReport, GenibusError> {
    if let Err(e) = validate(request, exchange) {
        warn!(target: "ems.genibus", device = device.address, error = %e, "answer rejected");
        ems_telemetry::record_protocol_mismatch();
        ems_telemetry::record_device_reset();
        device.reset();
        return Err(e);
    }

    device.record_answer();
    ems_telemetry::record_answer_received();
    let body_len = request.telegram.body_len() + exchange.reply.body_len();
    device.calibrate(body_len, exchange.duration.as_micros() as f64 / 1000.0);

    let mut report = InterpretReport::default();
    for (apdu, tasks) in exchange.reply.apdus.iter().zip(&request.task_list) {
        if let Err(e) = check_ack(apdu) {
            warn!(
                target: "ems.genibus",
                device = device.address,
                apdu = tasks.identifier,
                error = %e,
                "apdu rejected by device"
            );
            ems_telemetry::record_apdu_nack();
            report.nacks += 1;
            continue;
        }
        report.decoded += decode_apdu(device, tasks, &apdu.data);
    }

    debug!(
        target: "ems.genibus",
        device = device.address,
        decoded = report.decoded,
        nacks = report.nacks,
        "answer interpreted"
    );
    Ok(report)
}

fn validate(request: &TelegramRequest, exchange: &Exchange) -> Result<(), GenibusError> {
    let reply = &exchange.reply;
    if reply.start_delimiter != SD_DATA_REPLY {
        return Err(GenibusError::ProtocolMismatch(format!(
            "start delimiter 0x{:02X} is not a reply",
            reply.start_delimiter
        )));
    }
    if reply.destination != MASTER_ADDRESS {
        return Err(GenibusError::ProtocolMismatch(format!(
            "answer addressed to {} instead of master",
            reply.destination
        )));
    }
    if request.device_address != BROADCAST_ADDRESS && reply.source != request.device_address {
        return Err(GenibusError::ProtocolMismatch(format!(
            "answer from {} to a request for {}",
            reply.source, request.device_address
        )));
    }
    if reply.apdus.len() != request.task_list.len() {
        return Err(GenibusError::ProtocolMismatch(format!(
            "{} apdus answered, {} requested",
            reply.apdus.len(),
            request.task_list.len()
        )));
    }
    for (apdu, tasks) in reply.apdus.iter().zip(&request.task_list) {
        if apdu.head_class != tasks.head_class {
            return Err(GenibusError::ProtocolMismatch(format!(
                "apdu {} answered with head class {}",
                tasks.identifier, apdu.head_class
            )));
        }
    }
    Ok(())
}

fn check_ack(apdu: &Apdu) -> Result<(), GenibusError> {
    match apdu.ack() {
        AckCode::Ok => Ok(()),
        code => Err(GenibusError::ApduNack { code }),
    }
}

/// 按位置把 APDU 数据分配给任务，返回处理的任务数
fn decode_apdu(device: &mut DeviceState, apdu: &ApduTasks, data: &[u8]) -> usize {
    let mut offset = 0;
    let mut decoded = 0;

    for &id in &apdu.tasks {
        let remaining = &data[offset.min(data.len())..];
        let consumed = match apdu.operation {
            Operation::Set => {
                decoded += 1;
                continue;
            }
            Operation::Info => decode_info(device, id, remaining),
            Operation::Get => decode_value(device, id, remaining),
        };
        let Some(consumed) = consumed else {
            warn!(
                target: "ems.genibus",
                device = device.address,
                apdu = apdu.identifier,
                task = id,
                "answer shorter than requested, remaining tasks keep old values"
            );
            break;
        };
        offset += consumed;
        decoded += 1;
    }
    decoded
}

fn decode_info(device: &mut DeviceState, id: usize, data: &[u8]) -> Option<usize> {
    let header = *data.first()?;
    let trailing = DataInfo::trailing_len(header);
    let info = if trailing > 0 {
        let scale = data.get(1..1 + trailing)?;
        DataInfo::with_scale(header, scale[0], scale[1], scale[2])
    } else {
        DataInfo::from_header(header)
    };

    device.tasks.get_mut(id)?.apply_info(info);
    if let Some(index) = device.once_awaiting_info.iter().position(|t| *t == id) {
        device.once_awaiting_info.remove(index);
        device.once_followup.push(id);
    }
    Some(1 + trailing)
}

fn decode_value(device: &mut DeviceState, id: usize, data: &[u8]) -> Option<usize> {
    let task = device.tasks.get_mut(id)?;
    let len = if task.is_ascii() {
        data.len()
    } else {
        task.data_byte_size
    };
    let bytes = data.get(..len)?;
    task.apply_raw(bytes);
    Some(len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceConfig, TaskSpec};
    use crate::frame::Telegram;
    use crate::packing::{ByteBudget, commit, plan};
    use crate::task::Priority;
    use std::time::Duration;

    fn spec(name: &str, head_class: u8, address: u8, byte_size: usize, priority: Priority) -> TaskSpec {
        TaskSpec {
            name: name.to_string(),
            head_class,
            address,
            byte_size,
            priority,
        }
    }

    fn device() -> DeviceState {
        DeviceState::from_config(&DeviceConfig {
            address: 0x20,
            read_buffer_bytes: 70,
            send_buffer_bytes: 70,
            tasks: vec![
                spec("head", 2, 37, 2, Priority::High),
                spec("flow", 2, 39, 1, Priority::High),
                spec("serial", 7, 9, 1, Priority::Once),
            ],
        })
        .unwrap()
    }

    fn request(device: &mut DeviceState) -> TelegramRequest {
        for id in 0..device.tasks().len() {
            device.enqueue(id);
        }
        let plan = plan(device, ByteBudget { send: 64, answer: 200 });
        commit(plan, device)
    }

    fn reply(source: u8, apdus: Vec<Apdu>) -> Exchange {
        Exchange {
            reply: Telegram {
                start_delimiter: SD_DATA_REPLY,
                destination: MASTER_ADDRESS,
                source,
                apdus,
            },
            duration: Duration::from_millis(30),
        }
    }

    #[test]
    fn test_info_then_values() {
        let mut device = device();
        let request = request(&mut device);
        assert_eq!(request.task_list.len(), 2);

        // 扬程带比例信息，流量只有头字节
        let exchange = reply(
            0x20,
            vec![
                Apdu::reply(2, AckCode::Ok, vec![0x82, 22, 0, 100, 0x81]),
                Apdu::reply(7, AckCode::Ok, b"PUMP-01\0".to_vec()),
            ],
        );
        let report = interpret(&mut device, &request, &exchange).unwrap();
        assert_eq!(report, InterpretReport { decoded: 3, nacks: 0 });
        assert!(device.connection_ok);

        let head = device.task_by_name("head").unwrap();
        assert_eq!(head.info().map(|i| i.range), Some(100));
        assert!(device.task_by_name("flow").unwrap().information_known());
        assert_eq!(device.task_by_name("serial").unwrap().ascii().as_deref(), Some("PUMP-01"));

        let request = request_again(&mut device);
        let exchange = reply(0x20, vec![Apdu::reply(2, AckCode::Ok, vec![0x01, 0x00, 0x7F])]);
        interpret(&mut device, &request, &exchange).unwrap();
        assert_eq!(device.task_by_name("head").unwrap().raw_value(), Some(0x0100));
        assert_eq!(device.task_by_name("flow").unwrap().raw_value(), Some(0x7F));
    }

    fn request_again(device: &mut DeviceState) -> TelegramRequest {
        device.enqueue(0);
        device.enqueue(1);
        let plan = plan(device, ByteBudget { send: 64, answer: 200 });
        commit(plan, device)
    }

    #[test]
    fn test_address_mismatch_resets_device() {
        let mut device = device();
        let request = request(&mut device);
        device.enqueue(0);
        let exchange = reply(0x21, vec![Apdu::reply(2, AckCode::Ok, vec![0x81, 0x81])]);
        let err = interpret(&mut device, &request, &exchange).unwrap_err();
        assert!(matches!(err, GenibusError::ProtocolMismatch(_)));
        assert_eq!(device.queue_len(), 0);
        assert!(device.first_telegram);
        assert!(!device.connection_ok);
    }

    #[test]
    fn test_broadcast_answered_from_real_address() {
        let mut device = DeviceState::from_config(&DeviceConfig {
            address: BROADCAST_ADDRESS,
            read_buffer_bytes: 70,
            send_buffer_bytes: 70,
            tasks: vec![spec("flow", 2, 39, 1, Priority::High)],
        })
        .unwrap();
        let request = request(&mut device);
        assert_eq!(request.device_address, BROADCAST_ADDRESS);

        let exchange = reply(0x20, vec![Apdu::reply(2, AckCode::Ok, vec![0x81])]);
        let report = interpret(&mut device, &request, &exchange).unwrap();
        assert_eq!(report.decoded, 1);
        assert!(device.connection_ok);
        assert_eq!(device.timeout_counter, 0);
        assert!(device.task_by_name("flow").unwrap().information_known());
    }

    #[test]
    fn test_nack_code_reported() {
        let nack = Apdu::reply(3, AckCode::IllegalOperation, vec![]);
        let err = check_ack(&nack).unwrap_err();
        assert!(matches!(
            err,
            GenibusError::ApduNack {
                code: AckCode::IllegalOperation
            }
        ));
        assert!(!err.is_no_answer());
        assert!(check_ack(&Apdu::reply(2, AckCode::Ok, vec![0x10])).is_ok());
    }

    #[test]
    fn test_apdu_count_mismatch_resets_device() {
        let mut device = device();
        let request = request(&mut device);
        let exchange = reply(0x20, vec![Apdu::reply(2, AckCode::Ok, vec![0x81, 0x81])]);
        assert!(interpret(&mut device, &request, &exchange).is_err());
        assert!(device.first_telegram);
    }

    #[test]
    fn test_head_class_mismatch_resets_device() {
        let mut device = device();
        let request = request(&mut device);
        let exchange = reply(
            0x20,
            vec![
                Apdu::reply(4, AckCode::Ok, vec![0x81, 0x81]),
                Apdu::reply(7, AckCode::Ok, vec![]),
            ],
        );
        assert!(interpret(&mut device, &request, &exchange).is_err());
    }

    #[test]
    fn test_nack_skips_only_that_apdu() {
        let mut device = device();
        let request = request(&mut device);
        let exchange = reply(
            0x20,
            vec![
                Apdu::reply(2, AckCode::UnknownDataItem, vec![]),
                Apdu::reply(7, AckCode::Ok, b"X\0".to_vec()),
            ],
        );
        let report = interpret(&mut device, &request, &exchange).unwrap();
        assert_eq!(report, InterpretReport { decoded: 1, nacks: 1 });
        assert!(!device.task_by_name("head").unwrap().information_known());
        assert_eq!(device.task_by_name("serial").unwrap().ascii().as_deref(), Some("X"));
        assert!(device.connection_ok);
    }

    #[test]
    fn test_short_answer_decodes_prefix() {
        let mut device = device();
        let request = request(&mut device);
        let exchange = reply(
            0x20,
            vec![
                Apdu::reply(2, AckCode::Ok, vec![0x82, 22]),
                Apdu::reply(7, AckCode::Ok, vec![]),
            ],
        );
        let report = interpret(&mut device, &request, &exchange).unwrap();
        assert_eq!(report.decoded, 1);
        assert!(!device.task_by_name("head").unwrap().information_known());
    }

    #[test]
    fn test_once_info_moves_to_followup() {
        let mut device = DeviceState::from_config(&DeviceConfig {
            address: 0x20,
            read_buffer_bytes: 70,
            send_buffer_bytes: 70,
            tasks: vec![spec("max", 4, 30, 1, Priority::Once)],
        })
        .unwrap();
        device.once_awaiting_info = vec![0];
        let request = request(&mut device);
        let exchange = reply(0x20, vec![Apdu::reply(4, AckCode::Ok, vec![0x81])]);
        interpret(&mut device, &request, &exchange).unwrap();
        assert!(device.once_awaiting_info.is_empty());
        assert_eq!(device.once_followup, vec![0]);
    }

    #[test]
    fn test_empty_answer_calibrates_empty_time() {
        let mut device = device();
        let request = TelegramRequest::empty(0x20);
        let exchange = reply(0x20, Vec::new());
        interpret(&mut device, &request, &exchange).unwrap();
        assert_eq!(device.empty_telegram_time_ms, 30.0);
        assert!(device.connection_ok);
    }
}
