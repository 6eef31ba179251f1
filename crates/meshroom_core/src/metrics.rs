/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Default)]
pub struct MeshMetrics {
    pub signal_connected: AtomicBool,
    pub signal_last_change_ms: AtomicU64,
    pub signal_rx_bytes: AtomicU64,
    pub signal_tx_bytes: AtomicU64,
    pub signal_rtt_ema_ms: AtomicU64,
    signal_last_error: Mutex<Option<String>>,

    pub active_sessions: AtomicU64,
    pub connected_sessions: AtomicU64,

    pub offers_sent: AtomicU64,
    pub offers_received: AtomicU64,
    pub answers_sent: AtomicU64,
    pub answers_received: AtomicU64,
    pub candidates_sent: AtomicU64,
    pub candidates_received: AtomicU64,
    pub candidates_buffered: AtomicU64,
    pub offer_collisions: AtomicU64,

    pub protocol_violations: AtomicU64,
    pub negotiation_failures: AtomicU64,
    pub dropped_envelopes: AtomicU64,
}

impl MeshMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_signal_connected(&self, v: bool) {
        self.signal_connected.store(v, Ordering::Relaxed);
        self.signal_last_change_ms.store(now_ms(), Ordering::Relaxed);
        if v {
            let mut g = self.signal_last_error.lock().unwrap_or_else(|e| e.into_inner());
            *g = None;
        }
    }

    pub fn set_signal_error(&self, err: String) {
        self.set_signal_connected(false);
        let mut g = self.signal_last_error.lock().unwrap_or_else(|e| e.into_inner());
        *g = Some(err);
    }

    pub fn signal_rx_add(&self, n: u64) {
        self.signal_rx_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn signal_tx_add(&self, n: u64) {
        self.signal_tx_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn signal_rtt_update(&self, ms: u64) {
        if ms == 0 {
            return;
        }
        let prev = self.signal_rtt_ema_ms.load(Ordering::Relaxed);
        let next = if prev == 0 {
            ms
        } else {
            (prev.saturating_mul(7).saturating_add(ms)) / 8
        };
        self.signal_rtt_ema_ms.store(next, Ordering::Relaxed);
    }

    pub fn sessions_set(&self, active: u64, connected: u64) {
        self.active_sessions.store(active, Ordering::Relaxed);
        self.connected_sessions.store(connected, Ordering::Relaxed);
    }

    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot_json(&self) -> serde_json::Value {
        let last_error = self
            .signal_last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        serde_json::json!({
            "ts_ms": now_ms(),
            "signal": {
                "connected": self.signal_connected.load(Ordering::Relaxed),
                "last_change_ms": load(&self.signal_last_change_ms),
                "rx_bytes": load(&self.signal_rx_bytes),
                "tx_bytes": load(&self.signal_tx_bytes),
                "rtt_ms": load(&self.signal_rtt_ema_ms),
                "last_error": last_error,
            },
            "sessions": {
                "active": load(&self.active_sessions),
                "connected": load(&self.connected_sessions),
            },
            "negotiation": {
                "offers_sent": load(&self.offers_sent),
                "offers_received": load(&self.offers_received),
                "answers_sent": load(&self.answers_sent),
                "answers_received": load(&self.answers_received),
                "candidates_sent": load(&self.candidates_sent),
                "candidates_received": load(&self.candidates_received),
                "candidates_buffered": load(&self.candidates_buffered),
                "offer_collisions": load(&self.offer_collisions),
            },
            "errors": {
                "protocol_violations": load(&self.protocol_violations),
                "negotiation_failures": load(&self.negotiation_failures),
                "dropped_envelopes": load(&self.dropped_envelopes),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let m = MeshMetrics::new();
        MeshMetrics::bump(&m.offers_sent);
        MeshMetrics::bump(&m.offers_sent);
        m.signal_rtt_update(80);
        m.signal_rtt_update(0);
        m.signal_rtt_update(160);
        m.set_signal_error("reset by peer".into());
        m.sessions_set(3, 1);

        let v = m.snapshot_json();
        assert_eq!(v["negotiation"]["offers_sent"], 2);
        assert_eq!(v["signal"]["rtt_ms"], 90);
        assert_eq!(v["signal"]["connected"], false);
        assert_eq!(v["signal"]["last_error"], "reset by peer");
        assert_eq!(v["sessions"]["active"], 3);

        m.set_signal_connected(true);
        assert!(m.snapshot_json()["signal"]["last_error"].is_null());
    }
}
