#![forbid(unsafe_code)]

//! Core domain model and business logic for FastPath.
//!
//! This crate provides:
//! - Domain types (fasting records, goals)
//! - Goal catalog and seeding
//! - Persistence (record store, live status file)
//! - The fasting state machine and its async runtime
//! - CSV export of fasting history

pub mod types;
pub mod error;
pub mod goals;
pub mod config;
pub mod logging;
pub mod clock;
pub mod store;
pub mod live;
pub mod fasting;
pub mod runtime;
pub mod export;

// Re-export commonly used types
pub use error::{Error, Result};
pub use types::*;
pub use goals::{get_predefined_goals, predefined_goals};
pub use config::Config;
pub use clock::{Clock, ManualClock, SystemClock};
pub use store::{JsonStore, MemoryStore, RecordStore, StoreSnapshot};
pub use live::{LiveSession, LiveStatus, LiveStatusPublisher, NoopPublisher, StatusFilePublisher};
pub use fasting::{reduce, Action, Effect, FastingState, FastingStatus};
pub use runtime::{Dispatcher, FastingHandle, FastingRuntime, Navigation, RuntimeConfig};
pub use export::export_history_csv;
