//! SRCNN: a stack of convolutions trained with a masked MSE loss.
//!
//! The whole model lives in one graph: the forward pass, the loss, the RMSE
//! metric and the gradient of the loss with respect to every parameter.
//! Parameters of all layers but the last are updated with the configured
//! learning rate, those of the last layer with a tenth of it, and both
//! updates form one step of a shared global step counter.

use super::config::SrcnnConfig;
use super::error::SrcnnError;
use crate::analysis::{ShapeInference, ShapeInferenceError};
use crate::asg::{ConvPadding, DType, NodeId, NodeType, Shape, Value};
use crate::autograd::gradients;
use crate::losses::masked_mse_loss;
use crate::metrics::{self, SummaryRecorder};
use crate::nn::{Conv2d, Conv2dConfig, Module};
use crate::ops::maybe_pad;
use crate::optimizers::{Adam, GroupedUpdate};
use crate::runtime::{Backend, Device, Session};
use crate::tensor::{GraphContext, Tensor};
use ndarray::ArrayD;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

/// Loss and RMSE of one batch, with the global step they belong to.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepMetrics {
    pub global_step: u64,
    pub loss: f32,
    pub rmse: f32,
}

pub struct Srcnn {
    config: SrcnnConfig,
    device: Device,
    context: Rc<RefCell<GraphContext>>,
    x_name: String,
    y_name: String,
    layers: Vec<Conv2d>,
    prediction: Tensor,
    loss: Tensor,
    rmse: Tensor,
    /// Parameter name and the node holding d(loss)/d(parameter).
    gradients: Vec<(String, Tensor)>,
    update: GroupedUpdate,
    summaries: SummaryRecorder,
}

fn input_name(tensor: &Tensor, role: &'static str) -> Result<String, SrcnnError> {
    let ctx = tensor.context.borrow();
    let node = ctx.main_graph().get_node(tensor.node_id)?;
    match &node.node_type {
        NodeType::Input { name } => Ok(name.clone()),
        _ => Err(SrcnnError::NotAnInput(role)),
    }
}

fn named_parameters(conv: &Conv2d) -> Vec<(String, Tensor)> {
    let mut params = vec![(conv.weight_name(), conv.weight.clone())];
    if let Some(bias) = &conv.bias {
        params.push((conv.bias_name(), bias.clone()));
    }
    params
}

fn scalar(name: &str, value: &Value) -> Result<f32, SrcnnError> {
    value.as_scalar().ok_or_else(|| SrcnnError::NotAScalar {
        name: name.to_string(),
        shape: value.shape(),
    })
}

impl Srcnn {
    /// Builds the model graph on top of the inputs `x` (images) and `y`
    /// (targets), both NHWC.
    ///
    /// Layer `i` is named `hidden_{i}`; its parameters are
    /// `hidden_{i}.weight` (`[k, k, c_in, c_out]`) and `hidden_{i}.bias`.
    pub fn new(x: &Tensor, y: &Tensor, config: SrcnnConfig) -> Result<Self, SrcnnError> {
        config.validate()?;
        if !Rc::ptr_eq(&x.context, &y.context) {
            return Err(SrcnnError::ContextMismatch);
        }
        let device = config.parsed_device()?;
        let x_name = input_name(x, "x")?;
        let y_name = input_name(y, "y")?;
        let context = Rc::clone(&x.context);

        let (layers, prediction) = Self::inference(&context, x, &config)?;
        let loss = masked_mse_loss(&prediction, y);
        let rmse = metrics::rmse(&prediction, y);

        let params: Vec<(String, Tensor)> = layers.iter().flat_map(named_parameters).collect();
        let tensors: Vec<Tensor> = params.iter().map(|(_, t)| t.clone()).collect();
        let gradients: Vec<(String, Tensor)> = params
            .iter()
            .zip(gradients(&loss, &tensors)?)
            .filter_map(|((name, _), grad)| grad.map(|g| (name.clone(), g)))
            .collect();

        let (last, primary) = layers
            .split_last()
            .ok_or_else(|| SrcnnError::InvalidConfig("at least one layer is required".to_string()))?;
        let primary_names: Vec<String> = primary
            .iter()
            .flat_map(named_parameters)
            .map(|(name, _)| name)
            .collect();
        let last_names: Vec<String> = named_parameters(last).into_iter().map(|(name, _)| name).collect();

        let update = GroupedUpdate::new()
            .with_group("primary", primary_names, Adam::new(config.learning_rate)?)?
            .with_group("last_layer", last_names, Adam::new(config.last_layer_learning_rate())?)?;

        log::debug!(
            "built SRCNN with {} layers on {} ({} graph nodes, {} gradients)",
            layers.len(),
            device,
            context.borrow().main_graph().nodes.len(),
            gradients.len()
        );

        let summaries = SummaryRecorder::with_max_history(config.summary_history);
        Ok(Self {
            config,
            device,
            context,
            x_name,
            y_name,
            layers,
            prediction,
            loss,
            rmse,
            gradients,
            update,
            summaries,
        })
    }

    fn inference(
        context: &Rc<RefCell<GraphContext>>,
        x: &Tensor,
        config: &SrcnnConfig,
    ) -> Result<(Vec<Conv2d>, Tensor), SrcnnError> {
        let num_layers = config.num_layers();
        let padding = if config.is_training {
            config.train_padding
        } else {
            ConvPadding::Valid
        };

        let mut layers = Vec::with_capacity(num_layers);
        let mut h = x.clone();
        let mut in_channels = config.input_channels;
        for (i, (&channels, &k)) in config.layer_sizes.iter().zip(&config.filter_sizes).enumerate() {
            let pad_amt = ((k - 1) / 2) as i64;
            h = maybe_pad(&h, pad_amt, config.is_training)?;

            let conv = Conv2d::from_config(
                context,
                &format!("hidden_{}", i),
                Conv2dConfig::new(in_channels, channels, k).with_padding(padding),
            );
            h = conv.forward(&h);
            if i + 1 < num_layers {
                h = h.relu();
            }

            in_channels = channels;
            layers.push(conv);
        }
        Ok((layers, h))
    }

    /// Sets every parameter to its initial value: Glorot-uniform kernels and
    /// zero biases, drawn from a generator seeded with `seed`.
    pub fn init_variables<B: Backend>(&self, session: &mut Session<B>, seed: u64) {
        let mut rng = StdRng::seed_from_u64(seed);
        for conv in &self.layers {
            session.extend_variables(conv.init_values(&mut rng));
        }
    }

    /// A CPU session on the model's device with freshly initialised
    /// variables.
    pub fn new_session(&self, seed: u64) -> Session {
        let mut session = Session::new(self.device);
        self.init_variables(&mut session, seed);
        session
    }

    fn feeds(&self, x: &ArrayD<f32>, y: Option<&ArrayD<f32>>) -> HashMap<String, Value> {
        let mut feeds = HashMap::from([(self.x_name.clone(), Value::Tensor(x.clone()))]);
        if let Some(y) = y {
            feeds.insert(self.y_name.clone(), Value::Tensor(y.clone()));
        }
        feeds
    }

    /// Runs one forward and backward pass on a batch and applies the
    /// grouped update.
    ///
    /// The returned loss and RMSE are those of the batch before the update.
    /// Both are also recorded as summaries under the new global step.
    pub fn train_step<B: Backend>(
        &mut self,
        session: &mut Session<B>,
        x: &ArrayD<f32>,
        y: &ArrayD<f32>,
    ) -> Result<StepMetrics, SrcnnError> {
        let feeds = self.feeds(x, Some(y));
        let mut fetches = vec![self.loss.node_id, self.rmse.node_id];
        fetches.extend(self.gradients.iter().map(|(_, g)| g.node_id));

        let values = session.run(self.context.borrow().main_graph(), &fetches, &feeds)?;
        let (loss, rmse, grad_values) = match values.as_slice() {
            [loss, rmse, grads @ ..] => (scalar("loss", loss)?, scalar("rmse", rmse)?, grads),
            _ => return Err(SrcnnError::MissingOutput("loss")),
        };

        let grads: HashMap<String, Value> = self
            .gradients
            .iter()
            .map(|(name, _)| name.clone())
            .zip(grad_values.iter().cloned())
            .collect();
        let global_step = self.update.apply(session.variables_mut(), &grads)?;

        self.summaries.record("loss", global_step, loss);
        self.summaries.record("rmse", global_step, rmse);
        Ok(StepMetrics {
            global_step,
            loss,
            rmse,
        })
    }

    /// Loss and RMSE of a batch without updating anything.
    pub fn evaluate<B: Backend>(
        &self,
        session: &Session<B>,
        x: &ArrayD<f32>,
        y: &ArrayD<f32>,
    ) -> Result<StepMetrics, SrcnnError> {
        let feeds = self.feeds(x, Some(y));
        let fetches = [self.loss.node_id, self.rmse.node_id];
        let values = session.run(self.context.borrow().main_graph(), &fetches, &feeds)?;
        match values.as_slice() {
            [loss, rmse] => Ok(StepMetrics {
                global_step: self.global_step(),
                loss: scalar("loss", loss)?,
                rmse: scalar("rmse", rmse)?,
            }),
            _ => Err(SrcnnError::MissingOutput("loss")),
        }
    }

    /// Prediction for `x`; no target is needed.
    pub fn predict<B: Backend>(&self, session: &Session<B>, x: &ArrayD<f32>) -> Result<ArrayD<f32>, SrcnnError> {
        let feeds = self.feeds(x, None);
        let fetches = [self.prediction.node_id];
        let values = session.run(self.context.borrow().main_graph(), &fetches, &feeds)?;
        values
            .into_iter()
            .next()
            .map(Value::into_array)
            .ok_or(SrcnnError::MissingOutput("prediction"))
    }

    /// Static shape of the prediction for an input of shape `input_shape`.
    pub fn prediction_shape(&self, input_shape: &[usize]) -> Result<Shape, SrcnnError> {
        let prediction_id = self.prediction.node_id;
        let mut graph = self.context.borrow().main_graph().clone();
        let keep: HashSet<NodeId> = graph.ancestors(&[prediction_id])?.into_iter().collect();
        graph.nodes.retain(|id, _| keep.contains(id));

        let mut shapes = HashMap::from([(self.x_name.clone(), (input_shape.to_vec(), DType::F32))]);
        for conv in &self.layers {
            shapes.insert(conv.weight_name(), (conv.weight_shape(), DType::F32));
            if conv.bias.is_some() {
                shapes.insert(conv.bias_name(), (vec![conv.config.out_channels], DType::F32));
            }
        }
        ShapeInference::run(&mut graph, &shapes)?;

        graph
            .get_node(prediction_id)?
            .shape
            .clone()
            .ok_or_else(|| ShapeInferenceError::MissingShapeInfo(prediction_id).into())
    }

    pub fn config(&self) -> &SrcnnConfig {
        &self.config
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn context(&self) -> &Rc<RefCell<GraphContext>> {
        &self.context
    }

    pub fn layers(&self) -> &[Conv2d] {
        &self.layers
    }

    pub fn prediction(&self) -> &Tensor {
        &self.prediction
    }

    pub fn loss(&self) -> &Tensor {
        &self.loss
    }

    pub fn rmse(&self) -> &Tensor {
        &self.rmse
    }

    pub fn global_step(&self) -> u64 {
        self.update.global_step()
    }

    pub fn optimizer(&self) -> &GroupedUpdate {
        &self.update
    }

    /// Gradient node of the named parameter.
    pub fn gradient(&self, name: &str) -> Option<&Tensor> {
        self.gradients.iter().find(|(n, _)| n == name).map(|(_, g)| g)
    }

    pub fn parameters(&self) -> Vec<Tensor> {
        self.layers.iter().flat_map(|l| l.parameters()).collect()
    }

    /// Parameters of every layer but the last.
    pub fn primary_parameters(&self) -> Vec<Tensor> {
        match self.layers.split_last() {
            Some((_, primary)) => primary.iter().flat_map(|l| l.parameters()).collect(),
            None => Vec::new(),
        }
    }

    pub fn last_layer_parameters(&self) -> Vec<Tensor> {
        self.layers.last().map(|l| l.parameters()).unwrap_or_default()
    }

    pub fn summaries(&self) -> &SummaryRecorder {
        &self.summaries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(config: SrcnnConfig) -> Result<Srcnn, SrcnnError> {
        let context = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&context, "x");
        let y = Tensor::new_input(&context, "y");
        Srcnn::new(&x, &y, config)
    }

    #[test]
    fn test_layer_names_and_parameter_split() {
        let model = build(SrcnnConfig::default()).unwrap();
        let names: Vec<String> = model.parameters().iter().filter_map(|p| p.name()).collect();
        assert_eq!(
            names,
            vec![
                "hidden_0.weight",
                "hidden_0.bias",
                "hidden_1.weight",
                "hidden_1.bias",
                "hidden_2.weight",
                "hidden_2.bias"
            ]
        );
        assert_eq!(model.primary_parameters().len(), 4);
        let last: Vec<String> = model.last_layer_parameters().iter().filter_map(|p| p.name()).collect();
        assert_eq!(last, vec!["hidden_2.weight", "hidden_2.bias"]);
        assert!(model.gradient("hidden_0.weight").is_some());
        assert_eq!(model.global_step(), 0);
    }

    #[test]
    fn test_split_is_by_layer_not_by_name_prefix() {
        let config = SrcnnConfig::new(vec![2; 11], vec![1; 11]);
        let model = build(config).unwrap();
        let groups = model.optimizer().groups();
        assert_eq!(groups[1].parameters, vec!["hidden_10.weight", "hidden_10.bias"]);
        assert!(groups[0].parameters.contains(&"hidden_1.weight".to_string()));
        assert!((groups[1].optimizer.learning_rate() - 1e-5).abs() < 1e-10);
    }

    #[test]
    fn test_inputs_must_be_graph_inputs() {
        let context = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&context, "x");
        let y = x.relu();
        assert!(matches!(
            Srcnn::new(&x, &y, SrcnnConfig::default()),
            Err(SrcnnError::NotAnInput("y"))
        ));

        let other = Rc::new(RefCell::new(GraphContext::new()));
        let y = Tensor::new_input(&other, "y");
        assert!(matches!(
            Srcnn::new(&x, &y, SrcnnConfig::default()),
            Err(SrcnnError::ContextMismatch)
        ));
    }

    #[test]
    fn test_prediction_shape_follows_padding_policy() {
        let train = build(SrcnnConfig::default()).unwrap();
        assert_eq!(train.prediction_shape(&[2, 16, 16, 1]).unwrap(), vec![2, 16, 16, 1]);

        let infer = build(SrcnnConfig::default().with_training(false)).unwrap();
        assert_eq!(infer.prediction_shape(&[1, 12, 10, 1]).unwrap(), vec![1, 12, 10, 1]);

        let valid = build(SrcnnConfig::default().with_train_padding(ConvPadding::Valid)).unwrap();
        assert_eq!(valid.prediction_shape(&[1, 20, 20, 1]).unwrap(), vec![1, 8, 8, 1]);
    }

    #[test]
    fn test_invalid_config_builds_nothing() {
        let context = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&context, "x");
        let y = Tensor::new_input(&context, "y");
        let config = SrcnnConfig::new(vec![64, 1], vec![9, 2]);
        assert!(matches!(Srcnn::new(&x, &y, config), Err(SrcnnError::InvalidConfig(_))));
        assert_eq!(context.borrow().main_graph().nodes.len(), 2);
    }
}
