// ABOUTME: Root library module for the roombridge binary
// ABOUTME: Matrix transport and logging setup; everything transport-agnostic lives in roombridge-core

#![recursion_limit = "256"]

pub mod logging;
pub mod matrix_transport;

// Re-export platform-agnostic modules from roombridge-core
pub use roombridge_core::config;
pub use roombridge_core::paths;

pub use matrix_transport::MatrixTransport;
