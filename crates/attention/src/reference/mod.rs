//! Full-precision reference kernel.

pub mod exact;

pub use exact::ExactAttention;
