//! PTY management module
//!
//! Provides PTY terminal emulation for running processes with full terminal support.
//! Uses portable-pty to open the pair and spawn the child; I/O on the master
//! side goes through the tokio reactor.

pub mod filter;
mod process;

pub use process::*;
