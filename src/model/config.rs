//! Construction-time hyperparameters of the SRCNN model.

use super::error::SrcnnError;
use crate::asg::ConvPadding;
use crate::metrics::summary::SummaryRecorder;
use crate::runtime::device::{Device, DeviceError};
use serde::{Deserialize, Serialize};

/// Factor applied to the learning rate of the last layer.
pub const LAST_LAYER_LR_SCALE: f32 = 0.1;

/// Hyperparameters of [`Srcnn`](super::Srcnn).
///
/// ```rust,ignore
/// let config = SrcnnConfig::default()
///     .with_layer_sizes(vec![64, 32, 3])
///     .with_input_channels(3)
///     .with_training(false);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SrcnnConfig {
    /// Output channels of each convolution; the last entry is the number of
    /// channels of the prediction.
    pub layer_sizes: Vec<usize>,
    /// Square kernel size of each convolution. Must be odd.
    pub filter_sizes: Vec<usize>,
    pub learning_rate: f32,
    /// Outside training the input of each layer is replicate-padded and
    /// the convolution itself does not pad.
    pub is_training: bool,
    /// Device identifier, e.g. `/cpu:0` or `/gpu:0`.
    pub device: String,
    /// Channels of the input images.
    pub input_channels: usize,
    /// Convolution padding used while training.
    pub train_padding: ConvPadding,
    /// Summary entries kept per metric; older entries are dropped.
    pub summary_history: usize,
}

impl Default for SrcnnConfig {
    fn default() -> Self {
        Self {
            layer_sizes: vec![64, 32, 1],
            filter_sizes: vec![9, 1, 5],
            learning_rate: 1e-4,
            is_training: true,
            device: "/cpu:0".to_string(),
            input_channels: 1,
            train_padding: ConvPadding::Same,
            summary_history: SummaryRecorder::DEFAULT_MAX_HISTORY,
        }
    }
}

impl SrcnnConfig {
    pub fn new(layer_sizes: Vec<usize>, filter_sizes: Vec<usize>) -> Self {
        Self {
            layer_sizes,
            filter_sizes,
            ..Default::default()
        }
    }

    pub fn with_layer_sizes(mut self, layer_sizes: Vec<usize>) -> Self {
        self.layer_sizes = layer_sizes;
        self
    }

    pub fn with_filter_sizes(mut self, filter_sizes: Vec<usize>) -> Self {
        self.filter_sizes = filter_sizes;
        self
    }

    pub fn with_learning_rate(mut self, learning_rate: f32) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    pub fn with_training(mut self, is_training: bool) -> Self {
        self.is_training = is_training;
        self
    }

    pub fn with_device(mut self, device: &str) -> Self {
        self.device = device.to_string();
        self
    }

    pub fn with_input_channels(mut self, input_channels: usize) -> Self {
        self.input_channels = input_channels;
        self
    }

    pub fn with_train_padding(mut self, padding: ConvPadding) -> Self {
        self.train_padding = padding;
        self
    }

    pub fn with_summary_history(mut self, entries: usize) -> Self {
        self.summary_history = entries;
        self
    }

    pub fn num_layers(&self) -> usize {
        self.layer_sizes.len()
    }

    pub fn last_layer_learning_rate(&self) -> f32 {
        self.learning_rate * LAST_LAYER_LR_SCALE
    }

    pub fn parsed_device(&self) -> Result<Device, DeviceError> {
        self.device.parse()
    }

    /// Checks the configuration before any graph is built.
    pub fn validate(&self) -> Result<(), SrcnnError> {
        let invalid = |msg: String| Err(SrcnnError::InvalidConfig(msg));

        if self.layer_sizes.is_empty() {
            return invalid("at least one layer is required".to_string());
        }
        if self.layer_sizes.len() != self.filter_sizes.len() {
            return invalid(format!(
                "{} layer sizes but {} filter sizes",
                self.layer_sizes.len(),
                self.filter_sizes.len()
            ));
        }
        if let Some(i) = self.layer_sizes.iter().position(|&c| c == 0) {
            return invalid(format!("layer {} has zero output channels", i));
        }
        if let Some((i, k)) = self
            .filter_sizes
            .iter()
            .enumerate()
            .find(|&(_, &k)| k == 0 || k % 2 == 0)
        {
            return invalid(format!("filter size {} of layer {} must be odd", k, i));
        }
        if self.input_channels == 0 {
            return invalid("input must have at least one channel".to_string());
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return invalid(format!(
                "learning rate must be positive and finite, got {}",
                self.learning_rate
            ));
        }
        self.parsed_device()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = SrcnnConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.num_layers(), 3);
        assert!((config.last_layer_learning_rate() - 1e-5).abs() < 1e-10);
        assert_eq!(config.parsed_device().unwrap(), Device::Cpu(0));
    }

    #[test]
    fn test_rejects_inconsistent_configs() {
        let cases = [
            SrcnnConfig::new(vec![], vec![]),
            SrcnnConfig::new(vec![64, 1], vec![9]),
            SrcnnConfig::new(vec![64, 1], vec![9, 4]),
            SrcnnConfig::new(vec![64, 1], vec![0, 5]),
            SrcnnConfig::new(vec![0, 1], vec![9, 5]),
            SrcnnConfig::default().with_input_channels(0),
            SrcnnConfig::default().with_learning_rate(0.0),
            SrcnnConfig::default().with_learning_rate(f32::INFINITY),
        ];
        for config in cases {
            assert!(
                matches!(config.validate(), Err(SrcnnError::InvalidConfig(_))),
                "{:?} should be rejected",
                config
            );
        }

        let bad_device = SrcnnConfig::default().with_device("/tpu:0");
        assert!(matches!(bad_device.validate(), Err(SrcnnError::Device(_))));
    }

    #[test]
    fn test_builders() {
        let config = SrcnnConfig::default()
            .with_layer_sizes(vec![8, 3])
            .with_filter_sizes(vec![3, 3])
            .with_input_channels(3)
            .with_training(false)
            .with_device("/gpu:1")
            .with_train_padding(ConvPadding::Valid)
            .with_summary_history(50);
        assert!(config.validate().is_ok());
        assert_eq!(config.summary_history, 50);
        assert!(!config.is_training);
        assert_eq!(config.parsed_device().unwrap(), Device::Gpu(1));
        assert_eq!(config.train_padding, ConvPadding::Valid);
    }
}
