//! Integration test modules for Remora
//!
//! - engine: Engine building, device discovery, inference, shutdown
//! - lifecycle: Controller state transitions, listeners, persistence
//! - dispatch: Bounded concurrency and failure isolation
//! - profiles: Saved server profiles

pub mod dispatch;
pub mod engine;
pub mod lifecycle;
pub mod profiles;
