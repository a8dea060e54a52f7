//! 串口传输
//!
//! 半双工：一次只有一帧在途。发送前清空残留输入，
//! 接收时从字节流中找起始符、按长度字节收齐整帧并校验 CRC。
//!
//! 串口通过 `PortConnector` 打开，测试中可以注入内存管道。

use crate::error::GenibusError;
use crate::frame::{FRAME_OVERHEAD, Telegram, hex_dump, is_start_delimiter, package_ok};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{Instant, sleep_until, timeout, timeout_at};
use tracing::{debug, info, warn};

/// 收到完整帧后到下一次发送的最小间隔
pub const POST_RECEIVE_GAP: Duration = Duration::from_millis(3);
/// GENIbus 固定 9600 8N1
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// 可异步读写的串口流
pub trait SerialIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> SerialIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// 串口打开方式
#[async_trait]
pub trait PortConnector: Send + Sync {
    async fn open(&self, port_name: &str) -> Result<Box<dyn SerialIo>, GenibusError>;
}

/// 基于 tokio-serial 的串口连接器
#[derive(Debug, Clone)]
pub struct TokioSerialConnector {
    baud_rate: u32,
}

impl TokioSerialConnector {
    pub fn new(baud_rate: u32) -> Self {
        Self { baud_rate }
    }
}

impl Default for TokioSerialConnector {
    fn default() -> Self {
        Self::new(DEFAULT_BAUD_RATE)
    }
}

#[async_trait]
impl PortConnector for TokioSerialConnector {
    async fn open(&self, port_name: &str) -> Result<Box<dyn SerialIo>, GenibusError> {
        let builder = tokio_serial::new(port_name, self.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One);
        let port = tokio_serial::SerialStream::open(&builder).map_err(|e| {
            GenibusError::Transport(format!("failed to open serial port {}: {}", port_name, e))
        })?;
        Ok(Box::new(port))
    }
}

/// 接收状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveState {
    Idle,
    AwaitingFirstByte,
    AwaitingFrameComplete,
    Done,
    TimedOut,
}

/// 从字节流中切出完整且校验通过的帧
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buffer: Vec<u8>,
    rejected: u64,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// 取出下一帧；起始符之前的字节丢弃，校验失败时从下一个字节重新同步
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            match self.buffer.iter().position(|b| is_start_delimiter(*b)) {
                Some(start) => {
                    self.buffer.drain(..start);
                }
                None => {
                    self.buffer.clear();
                    return None;
                }
            }
            if self.buffer.len() < 2 {
                return None;
            }
            let total = self.buffer[1] as usize + 4;
            if total < FRAME_OVERHEAD {
                self.reject();
                continue;
            }
            if self.buffer.len() < total {
                return None;
            }
            if package_ok(&self.buffer[..total]) {
                return Some(self.buffer.drain(..total).collect());
            }
            self.reject();
        }
    }

    fn reject(&mut self) {
        self.rejected += 1;
        self.buffer.remove(0);
    }

    /// 取出并清零被丢弃的坏帧计数
    pub fn take_rejected(&mut self) -> u64 {
        std::mem::take(&mut self.rejected)
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

/// 一次成功交换的结果
#[derive(Debug, Clone)]
pub struct Exchange {
    pub reply: Telegram,
    /// 发送开始到收齐应答的耗时
    pub duration: Duration,
}

/// 串口传输
pub struct SerialTransport {
    connector: Arc<dyn PortConnector>,
    port_name: String,
    port: Option<Box<dyn SerialIo>>,
    assembler: FrameAssembler,
    state: ReceiveState,
    last_receive: Option<Instant>,
    drain_grace: Duration,
    debug: bool,
}

impl SerialTransport {
    pub fn new(
        connector: Arc<dyn PortConnector>,
        port_name: impl Into<String>,
        drain_grace: Duration,
        debug: bool,
    ) -> Self {
        Self {
            connector,
            port_name: port_name.into(),
            port: None,
            assembler: FrameAssembler::new(),
            state: ReceiveState::Idle,
            last_receive: None,
            drain_grace,
            debug,
        }
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// 串口是否处于打开状态
    pub fn is_alive(&self) -> bool {
        self.port.is_some()
    }

    pub fn state(&self) -> ReceiveState {
        self.state
    }

    /// 打开串口；已连接时直接返回
    pub async fn connect(&mut self) -> Result<(), GenibusError> {
        if self.port.is_some() {
            return Ok(());
        }
        let port = self.connector.open(&self.port_name).await?;
        info!(target: "ems.genibus", port = %self.port_name, "serial port opened");
        self.port = Some(port);
        self.assembler.clear();
        self.state = ReceiveState::Idle;
        self.last_receive = None;
        Ok(())
    }

    pub fn disconnect(&mut self) {
        if self.port.take().is_some() {
            warn!(target: "ems.genibus", port = %self.port_name, "serial port closed");
        }
        self.assembler.clear();
        self.state = ReceiveState::Idle;
    }

    /// 丢弃上一交换遗留的输入
    async fn drain_input(&mut self) -> Result<(), GenibusError> {
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| GenibusError::Transport("serial port not connected".to_string()))?;
        let deadline = Instant::now() + self.drain_grace;
        let mut buf = [0u8; 256];
        let mut discarded = 0;
        loop {
            match timeout(Duration::ZERO, port.read(&mut buf)).await {
                Err(_) => break,
                Ok(Ok(0)) => {
                    return Err(GenibusError::Transport("serial port reached eof".to_string()));
                }
                Ok(Ok(n)) => {
                    discarded += n;
                    if Instant::now() >= deadline {
                        return Err(GenibusError::Transport(format!(
                            "input still busy after draining {} bytes",
                            discarded
                        )));
                    }
                }
                Ok(Err(e)) => return Err(e.into()),
            }
        }
        if discarded > 0 {
            debug!(target: "ems.genibus", discarded, "stale input drained");
        }
        self.assembler.clear();
        Ok(())
    }

    /// 发送一帧原始字节
    pub async fn send(&mut self, bytes: &[u8]) -> Result<(), GenibusError> {
        self.write_frame(bytes).await.map(|_| ())
    }

    /// 等待收发间隔、清空残留输入后写出整帧，返回开始写出的时刻
    async fn write_frame(&mut self, bytes: &[u8]) -> Result<Instant, GenibusError> {
        if let Some(last) = self.last_receive {
            sleep_until(last + POST_RECEIVE_GAP).await;
        }
        if let Err(e) = self.drain_input().await {
            self.disconnect();
            return Err(e);
        }
        self.log_frame("tx", bytes);

        let port = self
            .port
            .as_mut()
            .ok_or_else(|| GenibusError::Transport("serial port not connected".to_string()))?;
        let started = Instant::now();
        let written = async {
            port.write_all(bytes).await?;
            port.flush().await
        }
        .await;
        if let Err(e) = written {
            self.disconnect();
            return Err(e.into());
        }
        self.state = ReceiveState::AwaitingFirstByte;
        ems_telemetry::record_telegram_sent();
        Ok(started)
    }

    /// 在窗口内等待一帧完整应答
    pub async fn receive_with_timeout(&mut self, window: Duration) -> Result<Vec<u8>, GenibusError> {
        let deadline = Instant::now() + window;
        self.state = ReceiveState::AwaitingFirstByte;
        let mut buf = [0u8; 256];
        let mut rejected = 0;

        loop {
            let frame = self.assembler.next_frame();
            rejected += self.assembler.take_rejected();
            if let Some(frame) = frame {
                self.state = ReceiveState::Done;
                self.last_receive = Some(Instant::now());
                self.log_frame("rx", &frame);
                return Ok(frame);
            }

            let port = self
                .port
                .as_mut()
                .ok_or_else(|| GenibusError::Transport("serial port not connected".to_string()))?;
            match timeout_at(deadline, port.read(&mut buf)).await {
                Err(_) => {
                    self.state = ReceiveState::TimedOut;
                    let leftover = self.assembler.buffered();
                    self.assembler.clear();
                    if rejected > 0 || leftover > 0 {
                        return Err(GenibusError::Framing(format!(
                            "{} frames rejected, {} bytes left unframed",
                            rejected, leftover
                        )));
                    }
                    return Err(GenibusError::Timeout(window.as_millis() as u64));
                }
                Ok(Ok(0)) => {
                    self.disconnect();
                    return Err(GenibusError::Transport("serial port reached eof".to_string()));
                }
                Ok(Ok(n)) => {
                    self.state = ReceiveState::AwaitingFrameComplete;
                    self.assembler.push(&buf[..n]);
                }
                Ok(Err(e)) => {
                    self.disconnect();
                    return Err(e.into());
                }
            }
        }
    }

    /// 发送请求并等待应答
    pub async fn exchange(
        &mut self,
        request: &Telegram,
        window: Duration,
    ) -> Result<Exchange, GenibusError> {
        let bytes = request.to_bytes()?;
        let started = self.write_frame(&bytes).await?;
        let frame = self.receive_with_timeout(window).await?;
        let duration = started.elapsed();
        let reply = Telegram::from_bytes(&frame)?;
        ems_telemetry::record_exchange_latency_ms(duration.as_millis() as u64);
        Ok(Exchange { reply, duration })
    }

    fn log_frame(&self, direction: &str, bytes: &[u8]) {
        if self.debug {
            info!(target: "ems.genibus", direction, frame = %hex_dump(bytes));
        } else {
            debug!(target: "ems.genibus", direction, frame = %hex_dump(bytes));
        }
    }
}
