//! Convolutional layer for NHWC image batches.

use crate::asg::{ConvPadding, Value};
use crate::nn::module::Module;
use crate::tensor::{GraphContext, Tensor};
use ndarray::{ArrayD, IxDyn};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::Rng;
use std::cell::RefCell;
use std::rc::Rc;

/// Configuration for Conv2d layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Conv2dConfig {
    /// Number of input channels.
    pub in_channels: usize,
    /// Number of output channels (filters).
    pub out_channels: usize,
    /// Square kernel size.
    pub kernel_size: usize,
    pub padding: ConvPadding,
    /// Use bias.
    pub bias: bool,
}

impl Default for Conv2dConfig {
    fn default() -> Self {
        Self {
            in_channels: 1,
            out_channels: 1,
            kernel_size: 3,
            padding: ConvPadding::Same,
            bias: true,
        }
    }
}

impl Conv2dConfig {
    pub fn new(in_channels: usize, out_channels: usize, kernel_size: usize) -> Self {
        Self {
            in_channels,
            out_channels,
            kernel_size,
            ..Default::default()
        }
    }

    pub fn with_padding(mut self, padding: ConvPadding) -> Self {
        self.padding = padding;
        self
    }

    /// Enables/disables bias.
    pub fn with_bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }
}

/// 2D convolution with stride 1.
///
/// Input is `[N, H, W, C_in]`, the weight `[k, k, C_in, C_out]` and the
/// optional bias `[C_out]`, broadcast over the output's channel axis.
///
/// ```rust,ignore
/// let conv = Conv2d::from_config(&context, "hidden_0", Conv2dConfig::new(1, 64, 9));
/// let features = conv.forward(&images).relu();
/// ```
pub struct Conv2d {
    /// Base name; parameters are `{name}.weight` and `{name}.bias`.
    pub name: String,
    pub weight: Tensor,
    pub bias: Option<Tensor>,
    pub config: Conv2dConfig,
}

impl Conv2d {
    pub fn new(
        context: &Rc<RefCell<GraphContext>>,
        name: &str,
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
    ) -> Self {
        let config = Conv2dConfig::new(in_channels, out_channels, kernel_size);
        Self::from_config(context, name, config)
    }

    pub fn from_config(
        context: &Rc<RefCell<GraphContext>>,
        name: &str,
        config: Conv2dConfig,
    ) -> Self {
        let weight = Tensor::new_parameter(context, &format!("{}.weight", name));
        let bias = config
            .bias
            .then(|| Tensor::new_parameter(context, &format!("{}.bias", name)));

        Self {
            name: name.to_string(),
            weight,
            bias,
            config,
        }
    }

    pub fn weight_name(&self) -> String {
        format!("{}.weight", self.name)
    }

    pub fn bias_name(&self) -> String {
        format!("{}.bias", self.name)
    }

    pub fn weight_shape(&self) -> Vec<usize> {
        let c = &self.config;
        vec![c.kernel_size, c.kernel_size, c.in_channels, c.out_channels]
    }

    /// Glorot-uniform weights and zero biases, keyed by parameter name.
    pub fn init_values<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<(String, Value)> {
        let c = &self.config;
        let receptive = c.kernel_size * c.kernel_size;
        let fan_in = (receptive * c.in_channels) as f32;
        let fan_out = (receptive * c.out_channels) as f32;
        let limit = (6.0 / (fan_in + fan_out)).sqrt();

        let weight = ArrayD::random_using(
            IxDyn(&self.weight_shape()),
            Uniform::new_inclusive(-limit, limit),
            rng,
        );
        let mut values = vec![(self.weight_name(), Value::Tensor(weight))];
        if self.bias.is_some() {
            let bias = ArrayD::zeros(IxDyn(&[c.out_channels]));
            values.push((self.bias_name(), Value::Tensor(bias)));
        }
        values
    }
}

impl Module for Conv2d {
    fn forward(&self, inputs: &Tensor) -> Tensor {
        let out = inputs.conv2d(&self.weight, self.config.padding);
        match &self.bias {
            Some(bias) => &out + bias,
            None => out,
        }
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut params = vec![self.weight.clone()];
        if let Some(ref bias) = self.bias {
            params.push(bias.clone());
        }
        params
    }
}
