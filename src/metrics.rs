use std::sync::{Mutex, OnceLock};

static METRICS: OnceLock<Mutex<MetricsState>> = OnceLock::new();

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MetricsState {
    pub packets_sent: u64,
    pub packets_received: u64,
    // 出站调用
    pub calls_issued: u64,
    pub calls_completed: u64,
    pub calls_failed: u64,
    pub calls_timed_out: u64,
    pub calls_cancelled: u64,
    // 协议异常
    pub replay_rejected: u64,
    pub method_not_found: u64,
    pub method_mismatch: u64,
    pub unknown_response: u64,
    // 防重放记录清理
    pub replay_records_evicted: u64,
}

fn state() -> &'static Mutex<MetricsState> {
    METRICS.get_or_init(|| Mutex::new(MetricsState::default()))
}

fn with_state(f: impl FnOnce(&mut MetricsState)) {
    let mut s = match state().lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(), // 避免因锁污染导致 panic
    };
    f(&mut s);
}

pub fn packet_sent() {
    with_state(|s| s.packets_sent += 1);
}

pub fn packet_received() {
    with_state(|s| s.packets_received += 1);
}

pub fn call_issued() {
    with_state(|s| s.calls_issued += 1);
}

pub fn call_completed() {
    with_state(|s| s.calls_completed += 1);
}

pub fn call_failed() {
    with_state(|s| s.calls_failed += 1);
}

pub fn call_timed_out() {
    with_state(|s| s.calls_timed_out += 1);
}

pub fn call_cancelled() {
    with_state(|s| s.calls_cancelled += 1);
}

pub fn replay_rejected() {
    with_state(|s| s.replay_rejected += 1);
}

pub fn method_not_found() {
    with_state(|s| s.method_not_found += 1);
}

pub fn method_mismatch() {
    with_state(|s| s.method_mismatch += 1);
}

pub fn unknown_response() {
    with_state(|s| s.unknown_response += 1);
}

pub fn replay_records_evicted(count: u64) {
    with_state(|s| s.replay_records_evicted += count);
}

/// 当前计数快照
pub fn snapshot() -> MetricsState {
    match state().lock() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

pub fn render_prometheus() -> String {
    let s = snapshot();
    let counters: [(&str, &str, u64); 12] = [
        ("owtp_packets_sent_total", "Packets written to the transport", s.packets_sent),
        ("owtp_packets_received_total", "Packets read from the transport", s.packets_received),
        ("owtp_calls_issued_total", "Outbound calls sent", s.calls_issued),
        ("owtp_calls_completed_total", "Outbound calls answered with success", s.calls_completed),
        ("owtp_calls_failed_total", "Outbound calls answered with an error status", s.calls_failed),
        ("owtp_calls_timed_out_total", "Outbound calls released by timeout", s.calls_timed_out),
        ("owtp_calls_cancelled_total", "Outbound calls discarded by reconnect or close", s.calls_cancelled),
        ("owtp_replay_rejected_total", "Inbound requests rejected as replays", s.replay_rejected),
        ("owtp_method_not_found_total", "Inbound requests for unregistered methods", s.method_not_found),
        ("owtp_method_mismatch_total", "Responses whose method differs from the request", s.method_mismatch),
        ("owtp_unknown_response_total", "Responses with no pending call", s.unknown_response),
        ("owtp_replay_records_evicted_total", "Replay guard records evicted", s.replay_records_evicted),
    ];

    let mut out = String::new();
    for (name, help, value) in counters {
        out.push_str(&format!("# HELP {} {}\n", name, help));
        out.push_str(&format!("# TYPE {} counter\n", name));
        out.push_str(&format!("{} {}\n", name, value));
    }
    out
}
