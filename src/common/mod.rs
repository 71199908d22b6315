//! Common library

/// Log related module
pub mod logger;
