//! Adaptive concurrent feed fetching with read-state sync against a
//! Google Reader style service.
//!
//! [`engine::Engine`] is the entry point: it runs bounded fetch cycles sized
//! by a measured network profile, and mirrors read/favorite changes through a
//! durable queue.

pub mod config;
pub mod engine;
pub mod feed;
pub mod network;
pub mod storage;
pub mod sync;
pub mod util;

pub use config::Config;
pub use engine::{Engine, EngineError, EngineOptions, SyncStatus};
