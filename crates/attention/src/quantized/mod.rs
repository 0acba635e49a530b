//! Int8 attention path.

pub mod int8;
pub mod kernel;

pub use int8::{dot_i8, quantize_value, Int8Rows};
pub use kernel::QuantizedAttention;
