//! Configuration module
//!
//! Loads relay settings and resolves per-session working directories.

mod relay;

pub use relay::*;
