//! # replidx Testkit
//!
//! Test utilities for replidx.
//!
//! This crate provides:
//! - A memo record fixture with a JSON payload mapper
//! - An index store wrapper that counts calls and injects failures
//! - Change-feed builders and a feed that fails part-way
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use replidx_testkit::prelude::*;
//!
//! #[test]
//! fn replays_are_ignored() {
//!     let target = memo_target();
//!     let mut feed = FeedBuilder::new("r1").matches("a", 1, "Memo", "hi").build();
//!     target.run_pass(instance("r1"), PassContext::default(), &mut feed).unwrap();
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod feeds;
pub mod fixtures;
pub mod generators;
pub mod store;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::feeds::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::store::*;
}

pub use feeds::*;
pub use fixtures::*;
pub use generators::*;
pub use store::*;
