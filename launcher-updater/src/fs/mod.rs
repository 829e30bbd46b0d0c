//! File system helpers.

pub mod atomic;
pub mod walker;
