//! Crash-safe persistence of the fallback buffer.
//!
//! - `PersistenceLog`: snapshot file, read once on start (drain) and rewritten on every persist tick
//! - `PersistTicker`: cancellable interval that drives persist ticks while the store is unreachable

mod log;
mod ticker;

pub use log::PersistenceLog;
pub use ticker::PersistTicker;
