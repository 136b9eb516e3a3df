//! Connection state tracking for a store

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionStatus {
    Disconnected = 0,
    Connected = 1,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connected => "connected",
        }
    }
}

/// Lock-free connection tracker.
///
/// `set_connected`/`set_disconnected` report whether the call changed the
/// state, so each transition is announced exactly once.
pub struct ConnectionHealth {
    status: AtomicU8,
    last_connected: AtomicI64,
    reconnection_attempts: AtomicU32,
    total_reconnections: AtomicU32,
}

impl ConnectionHealth {
    pub fn new() -> Self {
        Self {
            status: AtomicU8::new(ConnectionStatus::Disconnected as u8),
            last_connected: AtomicI64::new(0),
            reconnection_attempts: AtomicU32::new(0),
            total_reconnections: AtomicU32::new(0),
        }
    }

    /// Mark connected. Returns `true` if the store was disconnected before.
    pub fn set_connected(&self) -> bool {
        let previous = self
            .status
            .swap(ConnectionStatus::Connected as u8, Ordering::AcqRel);
        self.last_connected
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Release);
        self.reconnection_attempts.store(0, Ordering::Release);

        let changed = previous != ConnectionStatus::Connected as u8;
        if changed {
            self.total_reconnections.fetch_add(1, Ordering::AcqRel);
        }
        changed
    }

    /// Mark disconnected. Returns `true` if the store was connected before.
    pub fn set_disconnected(&self) -> bool {
        let previous = self
            .status
            .swap(ConnectionStatus::Disconnected as u8, Ordering::AcqRel);
        previous == ConnectionStatus::Connected as u8
    }

    pub fn record_attempt(&self) {
        self.reconnection_attempts.fetch_add(1, Ordering::AcqRel);
    }

    pub fn status(&self) -> ConnectionStatus {
        match self.status.load(Ordering::Acquire) {
            1 => ConnectionStatus::Connected,
            _ => ConnectionStatus::Disconnected,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub fn stats(&self) -> ConnectionHealthStats {
        ConnectionHealthStats {
            status: self.status(),
            last_connected_ms: self.last_connected.load(Ordering::Acquire),
            reconnection_attempts: self.reconnection_attempts.load(Ordering::Acquire),
            total_reconnections: self.total_reconnections.load(Ordering::Acquire),
        }
    }
}

impl Default for ConnectionHealth {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionHealthStats {
    pub status: ConnectionStatus,
    pub last_connected_ms: i64,
    pub reconnection_attempts: u32,
    pub total_reconnections: u32,
}
