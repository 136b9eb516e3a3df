//! Queue engine.
//!
//! A `Queue` serves enqueue/dequeue for one set of options. Traffic goes to
//! the durable store while it is connected and to the in-process fallback
//! buffer otherwise. The buffer is snapshotted to the persistence log so
//! items survive a restart; the snapshot is replayed on start and on
//! reconnect.

mod engine;

pub use engine::Queue;
