//! CLI command implementations.
//!
//! Each subcommand has its own module with argument definitions and
//! handlers.
//!
//! # Command Modules
//!
//! - [`render`] - Adaptive progressive render of a procedural scene
//! - [`stress`] - Multithreaded tile cache workload

pub mod render;
pub mod stress;
