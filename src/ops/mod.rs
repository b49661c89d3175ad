//! Composite graph operations built from the primitive `Tensor` ops.

pub mod padding;
pub mod stats;

pub use padding::{append_edge, maybe_pad, prepend_edge, replicate_padding, PadAmount, PaddingError};
pub use stats::{fill_na, finite_count, nanmean, nanvar};
