//! 追踪初始化与总线指标。

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::{EnvFilter, fmt};

/// 总线指标快照。
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSnapshot {
    pub telegrams_sent: u64,
    pub answers_received: u64,
    pub timeouts: u64,
    pub framing_errors: u64,
    pub protocol_mismatches: u64,
    pub apdu_nacks: u64,
    pub device_resets: u64,
    pub reconnects: u64,
    pub cycles: u64,
    pub exchange_latency_ms_total: u64,
    pub exchange_latency_ms_count: u64,
}

/// 总线指标。
pub struct TelemetryMetrics {
    telegrams_sent: AtomicU64,
    answers_received: AtomicU64,
    timeouts: AtomicU64,
    framing_errors: AtomicU64,
    protocol_mismatches: AtomicU64,
    apdu_nacks: AtomicU64,
    device_resets: AtomicU64,
    reconnects: AtomicU64,
    cycles: AtomicU64,
    exchange_latency_ms_total: AtomicU64,
    exchange_latency_ms_count: AtomicU64,
}

impl TelemetryMetrics {
    pub fn new() -> Self {
        Self {
            telegrams_sent: AtomicU64::new(0),
            answers_received: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            framing_errors: AtomicU64::new(0),
            protocol_mismatches: AtomicU64::new(0),
            apdu_nacks: AtomicU64::new(0),
            device_resets: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            cycles: AtomicU64::new(0),
            exchange_latency_ms_total: AtomicU64::new(0),
            exchange_latency_ms_count: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            telegrams_sent: self.telegrams_sent.load(Ordering::Relaxed),
            answers_received: self.answers_received.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            framing_errors: self.framing_errors.load(Ordering::Relaxed),
            protocol_mismatches: self.protocol_mismatches.load(Ordering::Relaxed),
            apdu_nacks: self.apdu_nacks.load(Ordering::Relaxed),
            device_resets: self.device_resets.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            cycles: self.cycles.load(Ordering::Relaxed),
            exchange_latency_ms_total: self.exchange_latency_ms_total.load(Ordering::Relaxed),
            exchange_latency_ms_count: self.exchange_latency_ms_count.load(Ordering::Relaxed),
        }
    }
}

impl Default for TelemetryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

static METRICS: OnceLock<TelemetryMetrics> = OnceLock::new();

/// 获取全局指标实例。
pub fn metrics() -> &'static TelemetryMetrics {
    METRICS.get_or_init(TelemetryMetrics::new)
}

/// 初始化 tracing（默认 info）。
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}

/// 记录请求帧发送次数。
pub fn record_telegram_sent() {
    metrics().telegrams_sent.fetch_add(1, Ordering::Relaxed);
}

/// 记录有效应答次数。
pub fn record_answer_received() {
    metrics().answers_received.fetch_add(1, Ordering::Relaxed);
}

/// 记录无应答次数。
pub fn record_timeout() {
    metrics().timeouts.fetch_add(1, Ordering::Relaxed);
}

/// 记录被丢弃的坏帧（起始符 / 长度 / CRC）。
pub fn record_framing_error() {
    metrics().framing_errors.fetch_add(1, Ordering::Relaxed);
}

/// 记录应答结构不匹配次数。
pub fn record_protocol_mismatch() {
    metrics().protocol_mismatches.fetch_add(1, Ordering::Relaxed);
}

/// 记录 APDU 否定应答次数。
pub fn record_apdu_nack() {
    metrics().apdu_nacks.fetch_add(1, Ordering::Relaxed);
}

/// 记录设备复位次数。
pub fn record_device_reset() {
    metrics().device_resets.fetch_add(1, Ordering::Relaxed);
}

/// 记录串口重连次数。
pub fn record_reconnect() {
    metrics().reconnects.fetch_add(1, Ordering::Relaxed);
}

/// 记录控制周期次数。
pub fn record_cycle() {
    metrics().cycles.fetch_add(1, Ordering::Relaxed);
}

/// 记录一次交换耗时（毫秒，发送开始到收齐应答）。
pub fn record_exchange_latency_ms(latency_ms: u64) {
    let metrics = metrics();
    metrics
        .exchange_latency_ms_total
        .fetch_add(latency_ms, Ordering::Relaxed);
    metrics
        .exchange_latency_ms_count
        .fetch_add(1, Ordering::Relaxed);
}
