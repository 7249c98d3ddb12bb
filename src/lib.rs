//! # emberkv - The Storage Core of a Redis-Compatible Server
//!
//! emberkv is the in-memory keyspace that sits underneath a Redis-style
//! command layer. It does not speak RESP or open sockets; it gives a command
//! executor the primitives it needs to run commands correctly when many
//! connections hit the same keys at once.
//!
//! ## Features
//!
//! - **Atomic Multi-Key Commands**: Striped `RwLock`s acquired in a fixed order
//! - **Whole-Keyspace Pauses**: `FLUSHDB` / `FLUSHALL` drain in-flight commands first
//! - **TTL Support**: Lazy checks on access plus a hashed time wheel
//! - **Versions**: Per-key counters for `WATCH`-style optimistic transactions
//! - **Mutation Hook**: Every durable change can be forwarded to a persistence log
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              emberkv                                    │
//! │                                                                         │
//! │  command executor (not part of this crate)                              │
//! │        │  rw_locks(write_keys, read_keys)                               │
//! │        ▼                                                                │
//! │  ┌──────────────────────────────────────────────────────────────────┐   │
//! │  │                          Database<V>                             │   │
//! │  │  PauseBarrier ──> StripedLocks ──> KeyGuard                      │   │
//! │  │                                      │                           │   │
//! │  │            ┌─────────────────────────┼──────────────────┐        │   │
//! │  │            ▼                         ▼                  ▼        │   │
//! │  │   ConcurrentDict<V>        ConcurrentDict<TTL>   ConcurrentDict  │   │
//! │  │        (data)                   (expiry)           (versions)    │   │
//! │  └──────────────────────────────────────┬───────────────────────────┘   │
//! │                                         │ schedule / cancel             │
//! │                                         ▼                               │
//! │                     ┌─────────────────────────────────────────────────┐ │
//! │                     │                TimeWheel                        │ │
//! │                     │          (Background Tokio Task)                │ │
//! │                     └─────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use emberkv::{Databases, ServerConfig};
//! use bytes::Bytes;
//! use std::time::{Duration, SystemTime};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ServerConfig::default();
//!     let dbs: Databases<Bytes> = Databases::start(&config);
//!     let Some(db) = dbs.get(0) else { return };
//!
//!     // SET session token EX 60
//!     db.execute(&[b"session"], &[] as &[&[u8]], |guard| {
//!         guard.put(Bytes::from("session"), Bytes::from("token"));
//!         guard.expire(b"session", SystemTime::now() + Duration::from_secs(60));
//!     });
//!
//!     assert_eq!(db.get(b"session"), Some(Bytes::from("token")));
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`config`]: Server settings and redis.conf-style parsing
//! - [`storage`]: Dictionaries, locks, barrier, time wheel and the database store
//!
//! ## Design Highlights
//!
//! ### Deadlock Freedom
//!
//! A command declares all of its keys up front. They are mapped to stripes,
//! deduplicated, and locked in ascending stripe order, so two commands can
//! never wait on each other in a cycle. A key that is both read and written
//! is locked for writing.
//!
//! ### Check-Lock-Check Expiration
//!
//! A time wheel callback may fire after the TTL it was scheduled for has been
//! rewritten or cleared. The callback therefore locks the key and re-reads the
//! TTL before removing anything.

pub mod config;
pub mod storage;

// Re-export commonly used types for convenience
pub use config::{ConfigError, ServerConfig};
pub use storage::{Database, Databases, DelayScheduler, KeyGuard, TimeWheel};

/// Version of emberkv
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
