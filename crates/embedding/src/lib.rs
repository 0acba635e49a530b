//! Embedding crate
//!
//! Token lookup and the rotary positional transform applied to queries and
//! keys inside every attention layer.

pub mod positional;
pub mod token;

pub use positional::*;
pub use token::*;
