//! CLI error handling with user-friendly messages.
//!
//! Centralizes error handling for the CLI, providing consistent
//! formatting and appropriate exit codes.

use std::process;

use thiserror::Error;

/// CLI-specific errors with user-friendly messages.
#[derive(Error, Debug)]
pub enum CliError {
    #[error("failed to initialize logging: {0}")]
    LoggingInit(String),

    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("cache error: {0}")]
    Cache(#[from] rasterkiln::CacheError),

    #[error("adaptive sampler error: {0}")]
    Adaptive(#[from] rasterkiln::AdaptiveError),

    #[error("failed to encode image: {0}")]
    ImageEncode(#[from] image::ImageError),

    #[error("failed to serialize statistics: {0}")]
    Stats(#[from] serde_json::Error),

    #[error("worker thread failed: {0}")]
    Worker(String),
}

impl CliError {
    /// Exit the process with an appropriate error message and code.
    pub fn exit(&self) -> ! {
        eprintln!("Error: {}", self);

        if let CliError::InvalidArgs(_) = self {
            eprintln!();
            eprintln!("Run with --help for the accepted ranges.");
        }

        process::exit(1)
    }
}
