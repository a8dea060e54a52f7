//! GENIbus 主站桥接进程：按控制周期轮询串口上的设备。

use ems_config::AppConfig;
use ems_genibus::{DeviceConfig, GenibusBridge, GenibusConfig, TokioSerialConnector};
use ems_telemetry::{init_tracing, metrics};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// 每隔多少个周期输出一次总线统计
const STATUS_EVERY_CYCLES: u64 = 60;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 加载本地 .env（如存在），便于直接 cargo run 启动
    dotenvy::dotenv().ok();
    // 从环境变量加载运行配置
    let config = AppConfig::from_env()?;
    // 初始化结构化日志
    init_tracing();

    let devices_json = std::fs::read_to_string(&config.devices_path)?;
    let devices = DeviceConfig::list_from_json(&devices_json)?;

    let mut genibus_config = GenibusConfig::new(config.port_name.clone());
    genibus_config.debug = config.debug;
    genibus_config.default_cycle_time_ms = config.cycle_time_ms;
    genibus_config.low_prio_tasks_per_cycle = config.low_prio_tasks_per_cycle as usize;
    genibus_config.scale_answer_budget = config.scale_answer_budget;
    genibus_config.drain_grace_ms = config.drain_grace_ms;

    let mut bridge = GenibusBridge::new(genibus_config, Arc::new(TokioSerialConnector::default()));
    for device in &devices {
        bridge.add_device(device)?;
    }
    info!(
        port = %config.port_name,
        devices = devices.len(),
        cycle_time_ms = config.cycle_time_ms,
        "genibus bridge started"
    );

    let mut ticker = tokio::time::interval(Duration::from_millis(config.cycle_time_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut cycles: u64 = 0;
    let mut offline: Vec<u8> = Vec::new();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = bridge.trigger_next_run().await;
                cycles += 1;
                report_health(&bridge, &mut offline);
                if cycles % STATUS_EVERY_CYCLES == 0 {
                    log_status(&bridge);
                }
                debug!(
                    telegrams = report.telegrams,
                    answered = report.answered,
                    timeouts = report.timeouts,
                    "cycle done"
                );
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
        }
    }
    Ok(())
}

/// 设备进入 / 离开疑似离线时各记录一次
fn report_health(bridge: &GenibusBridge, offline: &mut Vec<u8>) {
    for device in bridge.devices() {
        let health = device.health();
        let known = offline.contains(&device.address);
        if health.suspected_offline && !known {
            warn!(device = device.address, "device not answering");
            offline.push(device.address);
        } else if !health.suspected_offline && known {
            info!(device = device.address, "device answering again");
            offline.retain(|address| *address != device.address);
        }
    }
}

fn log_status(bridge: &GenibusBridge) {
    let snapshot = metrics().snapshot();
    info!(
        connected = bridge.is_connected(),
        cycle_time_ms = bridge.cycle_time().as_millis() as u64,
        telegrams = snapshot.telegrams_sent,
        answers = snapshot.answers_received,
        timeouts = snapshot.timeouts,
        framing_errors = snapshot.framing_errors,
        mismatches = snapshot.protocol_mismatches,
        nacks = snapshot.apdu_nacks,
        reconnects = snapshot.reconnects,
        "bus status"
    );
    for device in bridge.devices() {
        for task in device.tasks() {
            match (task.ascii(), task.scaled_value()) {
                (Some(text), _) => debug!(device = device.address, task = %task.name, value = %text),
                (None, Some(value)) => debug!(device = device.address, task = %task.name, value),
                (None, None) => {}
            }
        }
    }
}
