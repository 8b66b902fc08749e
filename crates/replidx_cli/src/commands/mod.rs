//! CLI command implementations.

pub mod replay;
pub mod watermarks;
