//! Loss functions in the graph paradigm.
//!
//! Loss functions are plain Rust functions that take symbolic `Tensor`
//! handles and append the nodes computing the error value.

use crate::tensor::Tensor;

/// Mean squared error over the entries where the error is finite.
///
/// Entries whose target (or prediction) is NaN or infinite are masked out
/// of both the sum and the count, so a target map with missing pixels
/// trains only on the known ones. The mask is applied with `select` before
/// squaring, which keeps the gradient of masked entries at exactly zero.
/// With every entry masked the loss is NaN.
///
/// Formula: `sum(mask * (y_pred - y_true)^2) / sum(mask)`.
pub fn masked_mse_loss(y_pred: &Tensor, y_true: &Tensor) -> Tensor {
    let error = y_pred - y_true;
    let mask = error.square().is_finite();
    let zero = Tensor::scalar(&error.context, 0.0);
    let kept = mask.select(&error, &zero);
    &kept.square().sum() / &mask.sum()
}
