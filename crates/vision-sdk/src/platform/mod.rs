//! Platform abstraction layer.
//!
//! All `#[cfg]` blocks for OS-specific process handling live here rather than
//! being scattered through the supervisor.
//!
//! - `process` - Signals, liveness checks and process group termination

pub mod process;

pub use process::{force_kill_group, is_process_alive, request_termination};
