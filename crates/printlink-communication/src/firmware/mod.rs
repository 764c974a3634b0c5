//! Firmware implementations
//!
//! Supported firmware:
//! - Marlin (and Marlin-compatible forks)

pub mod marlin;
