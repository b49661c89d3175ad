//! Statistics that skip missing (non-finite) entries.
//!
//! NaN and ±inf count as missing. Missing entries are replaced by zero for
//! summation and left out of the element count. An all-missing reduction
//! divides by zero and yields NaN; it is not an error.

use crate::tensor::Tensor;

/// Replaces every non-finite element of `x` by `fill`.
pub fn fill_na(x: &Tensor, fill: f32) -> Tensor {
    let fill = Tensor::scalar(&x.context, fill);
    x.is_finite().select(x, &fill)
}

fn reduce(x: &Tensor, axis: Option<usize>) -> Tensor {
    match axis {
        Some(axis) => x.sum_axis(axis),
        None => x.sum(),
    }
}

/// Number of finite elements, over everything or along `axis`.
pub fn finite_count(x: &Tensor, axis: Option<usize>) -> Tensor {
    reduce(&x.is_finite(), axis)
}

/// Mean of the finite elements. `axis` is removed from the result.
pub fn nanmean(x: &Tensor, axis: Option<usize>) -> Tensor {
    &reduce(&fill_na(x, 0.0), axis) / &finite_count(x, axis)
}

/// Population variance of the finite elements. `axis` is removed from the
/// result.
pub fn nanvar(x: &Tensor, axis: Option<usize>) -> Tensor {
    let mean = nanmean(x, axis);
    let mean = match axis {
        Some(axis) => mean.expand_dims(axis),
        None => mean,
    };
    // Missing entries must stay finite here; they are masked out below.
    let zero = Tensor::scalar(&x.context, 0.0);
    let squared = (&fill_na(x, 0.0) - &mean).square();
    let masked = x.is_finite().select(&squared, &zero);
    &reduce(&masked, axis) / &finite_count(x, axis)
}
