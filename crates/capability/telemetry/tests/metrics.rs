use ems_telemetry::{metrics, record_exchange_latency_ms, record_telegram_sent, record_timeout};

#[test]
fn counters_accumulate() {
    let before = metrics().snapshot();
    record_telegram_sent();
    record_telegram_sent();
    record_timeout();
    record_exchange_latency_ms(42);

    let after = metrics().snapshot();
    assert!(after.telegrams_sent >= before.telegrams_sent + 2);
    assert!(after.timeouts > before.timeouts);
    assert!(after.exchange_latency_ms_total >= before.exchange_latency_ms_total + 42);
    assert!(after.exchange_latency_ms_count > before.exchange_latency_ms_count);
}
