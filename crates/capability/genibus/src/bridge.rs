//! GENIbus 主站桥接
//!
//! 上层按控制周期调用 `trigger_next_run`：每次调用开启一个新周期，
//! 在周期时间用完之前反复执行"生成请求 → 交换 → 解析应答"。
//!
//! ```rust,ignore
//! let mut bridge = GenibusBridge::new(config, Arc::new(TokioSerialConnector::default()));
//! bridge.add_device(&device_config)?;
//! let mut ticker = tokio::time::interval(Duration::from_millis(1000));
//! loop {
//!     ticker.tick().await;
//!     bridge.trigger_next_run().await;
//! }
//! ```

use crate::config::{DeviceConfig, GenibusConfig};
use crate::device::{DeviceHealth, DeviceRegistry, DeviceState};
use crate::error::GenibusError;
use crate::interpreter::interpret;
use crate::packing::TelegramRequest;
use crate::scheduler::TelegramBuilder;
use crate::transport::{PortConnector, SerialTransport};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// 一个控制周期的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub connected: bool,
    pub telegrams: usize,
    pub answered: usize,
    pub timeouts: usize,
    pub mismatches: usize,
}

/// 主站桥接
pub struct GenibusBridge {
    config: GenibusConfig,
    registry: DeviceRegistry,
    builder: TelegramBuilder,
    transport: SerialTransport,
    cycle_time: Duration,
    last_tick: Option<Instant>,
    connected_once: bool,
}

impl GenibusBridge {
    pub fn new(config: GenibusConfig, connector: Arc<dyn PortConnector>) -> Self {
        let transport = SerialTransport::new(
            connector,
            config.port_name.clone(),
            Duration::from_millis(config.drain_grace_ms),
            config.debug,
        );
        Self {
            builder: TelegramBuilder::new(&config),
            registry: DeviceRegistry::new(),
            transport,
            cycle_time: Duration::from_millis(config.default_cycle_time_ms),
            last_tick: None,
            connected_once: false,
            config,
        }
    }

    pub fn config(&self) -> &GenibusConfig {
        &self.config
    }

    pub fn add_device(&mut self, config: &DeviceConfig) -> Result<(), GenibusError> {
        self.registry.add_device(config)?;
        info!(
            target: "ems.genibus",
            device = config.address,
            tasks = config.tasks.len(),
            "device added"
        );
        Ok(())
    }

    pub fn remove_device(&mut self, address: u8) -> bool {
        let removed = self.registry.remove_device(address).is_some();
        if removed {
            info!(target: "ems.genibus", device = address, "device removed");
        }
        removed
    }

    pub fn device(&self, address: u8) -> Option<&DeviceState> {
        self.registry.device(address)
    }

    pub fn devices(&self) -> &[DeviceState] {
        self.registry.devices()
    }

    pub fn health(&self, address: u8) -> Option<DeviceHealth> {
        self.registry.device(address).map(DeviceState::health)
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_alive()
    }

    /// 当前周期时长估计
    pub fn cycle_time(&self) -> Duration {
        self.cycle_time
    }

    /// 设置待写值，下一次服务该设备时发送 SET，随后一个周期确认读
    pub fn set_write_value(
        &mut self,
        address: u8,
        task_name: &str,
        value: u32,
    ) -> Result<(), GenibusError> {
        let device = self.device_for_write(address)?;
        let id = device
            .task_id(task_name)
            .ok_or_else(|| unknown_task(address, task_name))?;
        device.tasks[id].set_write_value(value)?;
        device.enqueue(id);
        Ok(())
    }

    /// 请求发送一次布尔命令（头类 3）
    pub fn send_command(&mut self, address: u8, task_name: &str) -> Result<(), GenibusError> {
        let device = self.device_for_write(address)?;
        let id = device
            .task_id(task_name)
            .ok_or_else(|| unknown_task(address, task_name))?;
        device.tasks[id].request_command()?;
        device.enqueue(id);
        Ok(())
    }

    fn device_for_write(&mut self, address: u8) -> Result<&mut DeviceState, GenibusError> {
        self.registry
            .device_mut(address)
            .ok_or_else(|| GenibusError::ConfigParse(format!("device {} not registered", address)))
    }

    /// 执行一个控制周期
    pub async fn trigger_next_run(&mut self) -> CycleReport {
        let tick = Instant::now();
        if let Some(last) = self.last_tick {
            let observed = tick.duration_since(last);
            if !observed.is_zero() {
                self.cycle_time = observed;
            }
        }
        self.last_tick = Some(tick);
        let generation = self.registry.begin_cycle();
        ems_telemetry::record_cycle();

        let mut report = CycleReport::default();
        if !self.ensure_connected().await {
            return report;
        }
        report.connected = true;

        let cycle_ms = self.cycle_time.as_micros() as f64 / 1000.0;
        loop {
            let elapsed_ms = tick.elapsed().as_micros() as f64 / 1000.0;
            let Some(request) =
                self.builder
                    .next_telegram(&mut self.registry, cycle_ms, elapsed_ms, Instant::now())
            else {
                break;
            };
            report.telegrams += 1;
            self.run_exchange(request, &mut report).await;

            if !self.transport.is_alive() {
                self.registry.reset_all();
                report.connected = false;
                break;
            }
        }

        debug!(
            target: "ems.genibus",
            generation,
            telegrams = report.telegrams,
            answered = report.answered,
            timeouts = report.timeouts,
            "cycle finished"
        );
        report
    }

    /// 串口未打开时尝试打开；失败则全部设备标记为未连接
    async fn ensure_connected(&mut self) -> bool {
        if self.transport.is_alive() {
            return true;
        }
        match self.transport.connect().await {
            Ok(()) => {
                if self.connected_once {
                    ems_telemetry::record_reconnect();
                    info!(target: "ems.genibus", port = %self.transport.port_name(), "serial port reconnected");
                }
                self.connected_once = true;
                self.registry.reset_all();
                true
            }
            Err(e) => {
                error!(
                    target: "ems.genibus",
                    port = %self.transport.port_name(),
                    error = %e,
                    "serial port unavailable"
                );
                self.registry.reset_all();
                false
            }
        }
    }

    async fn run_exchange(&mut self, request: TelegramRequest, report: &mut CycleReport) {
        let address = request.device_address;
        let Some(device) = self.registry.device(address) else {
            return;
        };
        let window = device.read_timeout(request.estimated_body_len());

        let result = self.transport.exchange(&request.telegram, window).await;
        let Some(device) = self.registry.device_mut(address) else {
            return;
        };
        match result {
            Ok(exchange) => match interpret(device, &request, &exchange) {
                Ok(_) => report.answered += 1,
                Err(_) => report.mismatches += 1,
            },
            Err(GenibusError::Encode(e)) => {
                warn!(target: "ems.genibus", device = address, error = %e, "request could not be encoded, dropped");
            }
            Err(e) if e.is_no_answer() => {
                if matches!(e, GenibusError::Framing(_)) {
                    ems_telemetry::record_framing_error();
                }
                ems_telemetry::record_timeout();
                ems_telemetry::record_device_reset();
                debug!(target: "ems.genibus", device = address, error = %e, "no answer");
                device.record_timeout();
                report.timeouts += 1;
            }
            Err(e) => {
                warn!(target: "ems.genibus", device = address, error = %e, "exchange failed");
                self.transport.disconnect();
            }
        }
    }
}

fn unknown_task(address: u8, task_name: &str) -> GenibusError {
    GenibusError::ConfigParse(format!("device {} has no task {}", address, task_name))
}
