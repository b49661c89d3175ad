//! Evaluation metrics.
//!
//! - [`rmse`]: root-mean-squared error as graph nodes, skipping missing
//!   entries
//! - [`SummaryRecorder`]: per-step scalar history of training metrics
//!
//! ```rust,ignore
//! use srcnn_asg::metrics::{rmse, SummaryRecorder};
//!
//! let error = rmse(&prediction, &target);
//! let mut summaries = SummaryRecorder::new();
//! summaries.record("rmse", step, value);
//! ```

pub mod summary;

pub use summary::{RunningMean, ScalarSummary, SummaryRecorder};

use crate::ops::stats::nanmean;
use crate::tensor::Tensor;

/// Root-mean-squared error over the finite entries of `y_pred - y_true`.
pub fn rmse(y_pred: &Tensor, y_true: &Tensor) -> Tensor {
    nanmean(&(y_pred - y_true).square(), None).sqrt()
}
