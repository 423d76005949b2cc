//! Command-line front end
//!
//! ```bash
//! # Pool health (exit status 1 when nothing is healthy)
//! hostpool --config hostpool.yaml check
//!
//! # Addresses currently returned by DNS
//! hostpool --config hostpool.yaml resolve
//!
//! # GET through the pool with retry on connect timeout
//! hostpool --config hostpool.yaml get /status -i
//!
//! # Print the health report every health check period until Ctrl-C
//! hostpool --config hostpool.yaml watch
//! ```

pub mod commands;

pub use commands::{cmd_check, cmd_get, cmd_resolve, cmd_watch};
