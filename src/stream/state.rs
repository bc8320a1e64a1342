use crate::delivery::queue::DeliveryCounts;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Disconnected,
    Connecting,
    Connected,
    Reading,
    Failed,
    Stopped,
}

impl Phase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Phase::Connecting,
            2 => Phase::Connected,
            3 => Phase::Reading,
            4 => Phase::Failed,
            5 => Phase::Stopped,
            _ => Phase::Disconnected,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Phase::Disconnected => 0,
            Phase::Connecting => 1,
            Phase::Connected => 2,
            Phase::Reading => 3,
            Phase::Failed => 4,
            Phase::Stopped => 5,
        }
    }
}

/// Connection bookkeeping. Written by the connection manager only; any
/// other task reads it through [`ConnectionState::snapshot`].
#[derive(Debug)]
pub struct ConnectionState {
    phase: AtomicU8,
    consecutive_failures: AtomicU32,
    /// Unix millis of the last successful connect, 0 if never.
    last_connected_ms: AtomicI64,
    /// Unix millis of the last heartbeat sent, 0 if never.
    last_heartbeat_ms: AtomicI64,
    messages: AtomicU64,
    errors: AtomicU64,
    connects: AtomicU64,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            phase: AtomicU8::new(Phase::Disconnected.as_u8()),
            consecutive_failures: AtomicU32::new(0),
            last_connected_ms: AtomicI64::new(0),
            last_heartbeat_ms: AtomicI64::new(0),
            messages: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            connects: AtomicU64::new(0),
        }
    }
}

/// Point-in-time copy of [`ConnectionState`] plus delivery counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateSnapshot {
    pub phase: Phase,
    pub consecutive_failures: u32,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub uptime_secs: Option<i64>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub messages: u64,
    pub errors: u64,
    pub connects: u64,
    pub delivery: DeliveryCounts,
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    if ms == 0 {
        None
    } else {
        DateTime::from_timestamp_millis(ms)
    }
}

impl ConnectionState {
    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    pub(crate) fn set_phase(&self, phase: Phase) {
        self.phase.store(phase.as_u8(), Ordering::SeqCst);
    }

    pub(crate) fn record_connected(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.last_connected_ms
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
        self.connects.fetch_add(1, Ordering::Relaxed);
        self.set_phase(Phase::Connected);
    }

    pub(crate) fn record_failure(&self, consecutive: u32) {
        self.consecutive_failures.store(consecutive, Ordering::SeqCst);
        self.errors.fetch_add(1, Ordering::Relaxed);
        self.set_phase(Phase::Failed);
    }

    pub(crate) fn record_message(&self) {
        self.messages.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_heartbeat(&self) {
        self.last_heartbeat_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    pub fn messages(&self) -> u64 {
        self.messages.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, delivery: DeliveryCounts) -> StateSnapshot {
        let last_connected_at = from_millis(self.last_connected_ms.load(Ordering::SeqCst));
        StateSnapshot {
            phase: self.phase(),
            consecutive_failures: self.consecutive_failures(),
            last_connected_at,
            uptime_secs: last_connected_at.map(|t| (Utc::now() - t).num_seconds()),
            last_heartbeat_at: from_millis(self.last_heartbeat_ms.load(Ordering::Relaxed)),
            messages: self.messages(),
            errors: self.errors.load(Ordering::Relaxed),
            connects: self.connects.load(Ordering::Relaxed),
            delivery,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_state() {
        let state = ConnectionState::default();
        let snapshot = state.snapshot(DeliveryCounts::default());
        assert_eq!(snapshot.phase, Phase::Disconnected);
        assert!(snapshot.last_connected_at.is_none());
        assert!(snapshot.uptime_secs.is_none());
        assert_eq!(snapshot.messages, 0);
    }

    #[test]
    fn test_connect_resets_failures() {
        let state = ConnectionState::default();
        state.record_failure(1);
        state.record_failure(2);
        assert_eq!(state.phase(), Phase::Failed);
        assert_eq!(state.consecutive_failures(), 2);

        state.record_connected();
        let snapshot = state.snapshot(DeliveryCounts::default());
        assert_eq!(snapshot.phase, Phase::Connected);
        assert_eq!(snapshot.consecutive_failures, 0);
        assert_eq!(snapshot.errors, 2);
        assert_eq!(snapshot.connects, 1);
        assert!(snapshot.last_connected_at.is_some());
    }

    #[test]
    fn test_phase_round_trips_through_atomic() {
        let state = ConnectionState::default();
        for phase in [
            Phase::Connecting,
            Phase::Connected,
            Phase::Reading,
            Phase::Failed,
            Phase::Stopped,
            Phase::Disconnected,
        ] {
            state.set_phase(phase);
            assert_eq!(state.phase(), phase);
        }
    }

    #[test]
    fn test_snapshot_serializes_phase_in_snake_case() {
        let state = ConnectionState::default();
        state.set_phase(Phase::Reading);
        let json = serde_json::to_value(state.snapshot(DeliveryCounts::default())).unwrap();
        assert_eq!(json["phase"], "reading");
    }
}
