//! Edge-replication ("replicate") padding of NHWC tensors.
//!
//! The padding is expressed in graph operations: the boundary slice of an
//! axis is concatenated `pad_amt` times before or after the tensor. Only the
//! spatial axes (1 = height, 2 = width) can be padded.

use crate::tensor::Tensor;
use thiserror::Error;

const HEIGHT: usize = 1;
const WIDTH: usize = 2;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PaddingError {
    #[error("Padding amount must be non-negative, got {0}")]
    Negative(i64),

    #[error("Only the spatial axes 1 (height) and 2 (width) can be padded, got axis {0}")]
    InvalidAxis(usize),
}

/// Padding amount for the two spatial axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PadAmount {
    /// Same amount on height and width.
    Uniform(i64),
    /// `[height, width]`.
    PerAxis([i64; 2]),
}

impl PadAmount {
    fn per_axis(self) -> [i64; 2] {
        match self {
            PadAmount::Uniform(p) => [p, p],
            PadAmount::PerAxis(p) => p,
        }
    }
}

impl From<i64> for PadAmount {
    fn from(amount: i64) -> Self {
        PadAmount::Uniform(amount)
    }
}

impl From<[i64; 2]> for PadAmount {
    fn from(amounts: [i64; 2]) -> Self {
        PadAmount::PerAxis(amounts)
    }
}

fn checked(pad_amt: i64, axis: usize) -> Result<usize, PaddingError> {
    if axis != HEIGHT && axis != WIDTH {
        return Err(PaddingError::InvalidAxis(axis));
    }
    usize::try_from(pad_amt).map_err(|_| PaddingError::Negative(pad_amt))
}

/// `pad_amt` copies of `edge` followed or preceded by `tensor`.
fn replicate(edge: &Tensor, tensor: &Tensor, pad_amt: usize, axis: usize, before: bool) -> Tensor {
    let mut parts: Vec<Tensor> = Vec::with_capacity(pad_amt + 1);
    if before {
        parts.extend(std::iter::repeat(edge.clone()).take(pad_amt));
        parts.push(tensor.clone());
    } else {
        parts.push(tensor.clone());
        parts.extend(std::iter::repeat(edge.clone()).take(pad_amt));
    }
    parts[0].concat(&parts[1..], axis)
}

/// Repeats the first entry of `axis` `pad_amt` times in front of `tensor`.
pub fn prepend_edge(tensor: &Tensor, pad_amt: i64, axis: usize) -> Result<Tensor, PaddingError> {
    let pad_amt = checked(pad_amt, axis)?;
    if pad_amt == 0 {
        return Ok(tensor.clone());
    }
    let first = tensor.slice(axis, 0, 1);
    Ok(replicate(&first, tensor, pad_amt, axis, true))
}

/// Repeats the last entry of `axis` `pad_amt` times after `tensor`.
pub fn append_edge(tensor: &Tensor, pad_amt: i64, axis: usize) -> Result<Tensor, PaddingError> {
    let pad_amt = checked(pad_amt, axis)?;
    if pad_amt == 0 {
        return Ok(tensor.clone());
    }
    let last = tensor.slice(axis, -1, 1);
    Ok(replicate(&last, tensor, pad_amt, axis, false))
}

/// Pads height, then width, on both sides by replicating the boundary.
///
/// Each padded spatial dimension grows by exactly `2 * pad`.
pub fn replicate_padding(tensor: &Tensor, pad: impl Into<PadAmount>) -> Result<Tensor, PaddingError> {
    let [pad_h, pad_w] = pad.into().per_axis();
    let mut out = tensor.clone();
    for (axis, amount) in [(HEIGHT, pad_h), (WIDTH, pad_w)] {
        out = prepend_edge(&out, amount, axis)?;
        out = append_edge(&out, amount, axis)?;
    }
    Ok(out)
}

/// Replicate-pads `x` by `padding` outside training.
///
/// During training the convolutions pad implicitly and `x` is returned as
/// is, as it is for a zero amount.
pub fn maybe_pad(x: &Tensor, padding: i64, is_training: bool) -> Result<Tensor, PaddingError> {
    if padding < 0 {
        return Err(PaddingError::Negative(padding));
    }
    if padding == 0 || is_training {
        return Ok(x.clone());
    }
    replicate_padding(x, padding)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asg::Value;
    use crate::runtime::{Device, Session};
    use crate::tensor::GraphContext;
    use ndarray::{s, Array, ArrayD};
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;

    fn run_padded(input: ArrayD<f32>, build: impl Fn(&Tensor) -> Tensor) -> ArrayD<f32> {
        let context = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&context, "x");
        let out = build(&x);
        let graph = context.borrow().main_graph().clone();
        let feeds = HashMap::from([("x".to_string(), Value::Tensor(input))]);
        let session = Session::new(Device::Cpu(0));
        let mut values = session.run(&graph, &[out.node_id], &feeds).unwrap();
        values.remove(0).into_array()
    }

    fn sample() -> ArrayD<f32> {
        Array::range(0.0, 24.0, 1.0)
            .into_shape_with_order((2, 3, 4, 1))
            .unwrap()
            .into_dyn()
    }

    #[test]
    fn test_replicate_padding_grows_by_twice_the_amount() {
        let input = sample();
        let padded = run_padded(input.clone(), |x| replicate_padding(x, 2).unwrap());
        assert_eq!(padded.shape(), &[2, 7, 8, 1]);

        // Interior is the unpadded input.
        assert_eq!(padded.slice(s![.., 2..5, 2..6, ..]).into_dyn(), input.view());
        // New rows and columns copy the boundary.
        for row in 0..2 {
            assert_eq!(padded.slice(s![.., row, 2..6, ..]), input.slice(s![.., 0, .., ..]));
            assert_eq!(padded.slice(s![.., 5 + row, 2..6, ..]), input.slice(s![.., 2, .., ..]));
        }
        for col in 0..2 {
            assert_eq!(padded.slice(s![.., 2..5, col, ..]), input.slice(s![.., .., 0, ..]));
            assert_eq!(padded.slice(s![.., 2..5, 6 + col, ..]), input.slice(s![.., .., 3, ..]));
        }
        // Corners take the corner value.
        assert_eq!(padded[[0, 0, 0, 0]], input[[0, 0, 0, 0]]);
        assert_eq!(padded[[1, 6, 7, 0]], input[[1, 2, 3, 0]]);
    }

    #[test]
    fn test_per_axis_amounts() {
        let padded = run_padded(sample(), |x| replicate_padding(x, [1, 0]).unwrap());
        assert_eq!(padded.shape(), &[2, 5, 4, 1]);
    }

    #[test]
    fn test_prepend_and_append_single_axis() {
        let input = sample();
        let front = run_padded(input.clone(), |x| prepend_edge(x, 3, 2).unwrap());
        assert_eq!(front.shape(), &[2, 3, 7, 1]);
        assert_eq!(front.slice(s![.., .., 2, ..]), input.slice(s![.., .., 0, ..]));

        let back = run_padded(input.clone(), |x| append_edge(x, 1, 1).unwrap());
        assert_eq!(back.shape(), &[2, 4, 4, 1]);
        assert_eq!(back.slice(s![.., 3, .., ..]), input.slice(s![.., 2, .., ..]));
    }

    #[test]
    fn test_negative_amount_is_rejected() {
        let context = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&context, "x");
        assert_eq!(maybe_pad(&x, -1, false).unwrap_err(), PaddingError::Negative(-1));
        assert_eq!(maybe_pad(&x, -1, true).unwrap_err(), PaddingError::Negative(-1));
        assert_eq!(prepend_edge(&x, -2, 1).unwrap_err(), PaddingError::Negative(-2));
        assert_eq!(
            replicate_padding(&x, [1, -3]).unwrap_err(),
            PaddingError::Negative(-3)
        );
    }

    #[test]
    fn test_invalid_axis_is_rejected() {
        let context = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&context, "x");
        assert_eq!(append_edge(&x, 1, 0).unwrap_err(), PaddingError::InvalidAxis(0));
        assert_eq!(prepend_edge(&x, 1, 3).unwrap_err(), PaddingError::InvalidAxis(3));
    }

    #[test]
    fn test_maybe_pad_is_identity_while_training_or_for_zero() {
        let context = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&context, "x");
        assert_eq!(maybe_pad(&x, 4, true).unwrap().node_id, x.node_id);
        assert_eq!(maybe_pad(&x, 0, false).unwrap().node_id, x.node_id);
        assert_ne!(maybe_pad(&x, 1, false).unwrap().node_id, x.node_id);
    }
}
