//! Terminal session module
//!
//! One child process on a PTY, its output relay and its lifecycle.

mod terminal;

pub use terminal::*;
