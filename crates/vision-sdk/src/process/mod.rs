//! Server process supervision.
//!
//! Covers locating a server installation, spawning the server for a project,
//! waiting until it is ready, and stopping it again.
//!
//! # Readiness
//!
//! A freshly spawned server counts as ready once all of these hold:
//! 1. **Alive** - the child has not exited
//! 2. **Output marker** - the child printed `__SERVER_RUNNING__`
//! 3. **HTTP** - `GET /ping` on its port gets any response
//!
//! An HTTP answer without the marker is never enough, since another server
//! may own the port. When model initialization is awaited, the
//! `STOP_INIT_MODEL` marker is required as well.

mod install;
mod launcher;

pub use install::{
    check_project, find_installation, find_installation_in, server_executable, ServerArgs,
};
pub use launcher::{LaunchConfig, ProcessLauncher, ServerProcess};
