//! Storage Core Module
//!
//! This module provides the concurrency core of emberkv: sharded maps,
//! striped key locks, a pause barrier for whole-keyspace work, and a hashed
//! time wheel that expires keys in the background.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Databases<V>                           │
//! │  ┌────────────┐ ┌────────────┐ ┌────────────┐               │
//! │  │ Database 0 │ │ Database 1 │ │ Database N │               │
//! │  │ dicts      │ │ dicts      │ │ dicts      │               │
//! │  │ stripes    │ │ stripes    │ │ stripes    │               │
//! │  │ barrier    │ │ barrier    │ │ barrier    │               │
//! │  └─────┬──────┘ └─────┬──────┘ └─────┬──────┘               │
//! └────────┼──────────────┼──────────────┼──────────────────────┘
//!          └──────────────┼──────────────┘
//!                         ▼
//!              ┌───────────────────────────┐
//!              │        TimeWheel          │
//!              │  (Background Tokio Task)  │
//!              └───────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Sharded Maps**: `RwLock`-guarded shards keep single-key calls cheap
//! - **Striped Locks**: Multi-key commands lock their stripes in ascending order
//! - **Pause Barrier**: `FLUSHDB` waits for in-flight commands and holds new ones
//! - **Lazy + Active Expiry**: Guards drop due keys on access, the wheel drops the rest
//! - **Versions**: Every effective mutation bumps a per-key counter for `WATCH`
//!
//! ## Example
//!
//! ```
//! use emberkv::storage::{Database, DelayScheduler, Task};
//! use emberkv::ServerConfig;
//! use bytes::Bytes;
//! use std::sync::Arc;
//! use std::time::SystemTime;
//!
//! // A scheduler that never fires; lazy expiration still applies.
//! struct Never;
//! impl DelayScheduler for Never {
//!     fn schedule_at(&self, _at: SystemTime, _name: Bytes, _task: Task) {}
//!     fn cancel(&self, _name: &[u8]) {}
//! }
//!
//! let db: Database<i64> = Database::new(0, &ServerConfig::default(), Arc::new(Never));
//! db.put(Bytes::from("a"), 10);
//! db.put(Bytes::from("b"), 0);
//!
//! // Move 4 from a to b atomically.
//! db.execute(&[b"a", b"b"], &[] as &[&[u8]], |guard| {
//!     guard.update(b"a", |v| *v -= 4);
//!     guard.update(b"b", |v| *v += 4);
//! });
//!
//! assert_eq!(db.get(b"a"), Some(6));
//! assert_eq!(db.get(b"b"), Some(4));
//! ```

pub mod barrier;
pub mod databases;
pub mod db;
pub mod dict;
pub mod lock;
pub mod timewheel;

// Re-export commonly used types
pub use barrier::{Pass, PauseBarrier, Paused};
pub use databases::Databases;
pub use db::{cmd_line, CmdLine, Database, DbStats, KeyGuard, MutationHook, PauseGuard, Watched};
pub use dict::ConcurrentDict;
pub use lock::{LockGuard, StripedLocks};
pub use timewheel::{DelayScheduler, Task, TimeWheel, TimeWheelConfig};
