//! File system helpers: tree walking and metadata capture.

pub mod metadata;
pub mod walker;
