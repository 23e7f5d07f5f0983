#![deny(missing_docs)]
//! Credible fetches encrypted secrets, decrypts them in memory and exposes them
//! to a command, a file or a memory-backed mount for exactly as long as needed.

/// Envelope encryption engine.
pub mod cipher;
/// Command-line interface.
pub mod cli;
/// Captured subprocess helpers.
pub mod command;
/// Config fragments and merging.
pub mod config;
/// Error types and exit codes.
pub mod error;
/// Exposure materialization and teardown.
pub mod exposure;
/// Secure filesystem helpers.
pub mod fs_secure;
/// Tracing subscriber setup.
pub mod logging;
/// Mount layout and path normalization.
pub mod paths;
/// Exposure planning.
pub mod plan;
/// Concurrent secret resolution.
pub mod resolver;
/// Environment contract and runtime settings.
pub mod settings;
/// Ciphertext storage backends.
pub mod storage;
/// Command supervision and signal forwarding.
pub mod supervisor;
/// Shared types.
pub mod types;
