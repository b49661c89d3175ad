//! End-to-end tests of the SRCNN model: training steps, the two learning
//! rates, missing targets and inference-time padding.

use ndarray::{ArrayD, IxDyn};
use srcnn_asg::asg::Value;
use srcnn_asg::model::{Srcnn, SrcnnConfig, SrcnnError};
use srcnn_asg::runtime::Session;
use srcnn_asg::tensor::{GraphContext, Tensor};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

const LR: f32 = 1e-2;

fn init_logging() {
    let _ = stderrlog::new().module("srcnn_asg").verbosity(2).init();
}

fn small_config() -> SrcnnConfig {
    SrcnnConfig::new(vec![8, 8, 1], vec![3, 1, 3]).with_learning_rate(LR)
}

fn build(config: SrcnnConfig) -> Srcnn {
    let context = Rc::new(RefCell::new(GraphContext::new()));
    let x = Tensor::new_input(&context, "x");
    let y = Tensor::new_input(&context, "y");
    Srcnn::new(&x, &y, config).unwrap()
}

/// A smooth positive image batch.
fn images(shape: &[usize]) -> ArrayD<f32> {
    ArrayD::from_shape_fn(IxDyn(shape), |idx| {
        let (n, h, w) = (idx[0] as f32, idx[1] as f32, idx[2] as f32);
        0.5 + 0.3 * ((h + 2.0 * n) * 0.7).sin() * (w * 0.5).cos()
    })
}

fn snapshot(session: &Session) -> HashMap<String, ArrayD<f32>> {
    session
        .variables()
        .iter()
        .map(|(name, value)| (name.clone(), value.clone().into_array()))
        .collect()
}

fn max_change(before: &HashMap<String, ArrayD<f32>>, session: &Session, name: &str) -> f32 {
    let after = session.variable(name).unwrap().clone().into_array();
    (&after - &before[name]).iter().fold(0.0f32, |m, d| m.max(d.abs()))
}

#[test]
fn test_train_step_advances_global_step_by_one() {
    init_logging();
    let mut model = build(small_config());
    let mut session = model.new_session(1);
    let x = images(&[2, 6, 6, 1]);

    for expected in 1..=3 {
        let metrics = model.train_step(&mut session, &x, &x).unwrap();
        assert_eq!(metrics.global_step, expected);
        assert_eq!(model.global_step(), expected);
        assert!(metrics.loss.is_finite());
        assert!((metrics.rmse - metrics.loss.sqrt()).abs() < 1e-4);
    }

    let history = model.summaries().history("loss").unwrap();
    assert_eq!(history.iter().map(|s| s.step).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert_eq!(model.summaries().history("rmse").unwrap().len(), 3);
}

#[test]
fn test_summary_history_keeps_the_latest_steps() {
    let mut model = build(small_config().with_summary_history(2));
    let mut session = model.new_session(6);
    let x = images(&[1, 5, 5, 1]);

    for _ in 0..4 {
        model.train_step(&mut session, &x, &x).unwrap();
    }

    let steps: Vec<u64> = model.summaries().history("loss").unwrap().iter().map(|s| s.step).collect();
    assert_eq!(steps, vec![3, 4]);
    assert!(model.summaries().best("loss").is_some());
}

#[test]
fn test_last_layer_moves_less() {
    let mut model = build(small_config());
    let mut session = model.new_session(7);
    let x = images(&[2, 6, 6, 1]);
    let y = x.mapv(|v| 1.0 - v);

    let before = snapshot(&session);
    model.train_step(&mut session, &x, &y).unwrap();

    // Adam's first step moves every parameter with a gradient by about its
    // learning rate.
    let primary = ["hidden_0.weight", "hidden_0.bias", "hidden_1.weight", "hidden_1.bias"]
        .iter()
        .map(|name| max_change(&before, &session, name))
        .fold(0.0f32, f32::max);
    let last = max_change(&before, &session, "hidden_2.bias");
    assert!(primary > 0.5 * LR && primary <= 1.01 * LR, "primary moved {}", primary);
    assert!(last > 0.05 * LR && last <= 0.101 * LR, "last layer moved {}", last);
}

#[test]
fn test_nan_targets_keep_parameters_finite() {
    let mut model = build(small_config());
    let mut session = model.new_session(3);
    let x = images(&[2, 6, 6, 1]);
    let mut y = x.clone();
    for (i, v) in y.iter_mut().enumerate() {
        if i % 3 == 0 {
            *v = f32::NAN;
        } else if i % 7 == 0 {
            *v = f32::INFINITY;
        }
    }

    for _ in 0..3 {
        let metrics = model.train_step(&mut session, &x, &y).unwrap();
        assert!(metrics.loss.is_finite());
        assert!(metrics.rmse.is_finite());
    }
    for (name, value) in session.variables() {
        let Value::Tensor(arr) = value else {
            panic!("{} is not a tensor", name);
        };
        assert!(arr.iter().all(|v| v.is_finite()), "{} became non-finite", name);
    }
}

#[test]
fn test_training_reduces_loss() {
    let mut model = build(small_config());
    let mut session = model.new_session(11);
    let x = images(&[2, 8, 8, 1]);

    let start = model.evaluate(&session, &x, &x).unwrap();
    for _ in 0..40 {
        model.train_step(&mut session, &x, &x).unwrap();
    }
    let end = model.evaluate(&session, &x, &x).unwrap();

    assert_eq!(start.global_step, 0);
    assert_eq!(end.global_step, 40);
    assert!(end.loss < start.loss, "loss went from {} to {}", start.loss, end.loss);
}

#[test]
fn test_inference_keeps_spatial_size() {
    let mut train = build(small_config());
    let mut session = train.new_session(5);
    let x = images(&[1, 7, 9, 1]);
    train.train_step(&mut session, &x, &x).unwrap();

    // Same parameter names, so the trained variables carry over.
    let infer = build(small_config().with_training(false));
    let prediction = infer.predict(&session, &x).unwrap();
    assert_eq!(prediction.shape(), &[1, 7, 9, 1]);
    assert_eq!(infer.prediction_shape(&[1, 7, 9, 1]).unwrap(), vec![1, 7, 9, 1]);
    assert!(prediction.iter().all(|v| v.is_finite()));
}

#[test]
fn test_replicate_padding_preserves_constant_images() {
    let infer = build(small_config().with_training(false));
    let session = infer.new_session(9);
    let x = ArrayD::from_elem(IxDyn(&[1, 5, 6, 1]), 0.75f32);

    let prediction = infer.predict(&session, &x).unwrap();
    let first = prediction[[0, 0, 0, 0]];
    assert!(prediction.iter().all(|v| (v - first).abs() < 1e-5));
}

#[test]
fn test_evaluate_and_predict_do_not_update() {
    let model = build(small_config());
    let session = model.new_session(2);
    let x = images(&[1, 4, 4, 1]);
    let before = snapshot(&session);

    model.evaluate(&session, &x, &x).unwrap();
    model.predict(&session, &x).unwrap();

    assert_eq!(snapshot(&session), before);
    assert_eq!(model.global_step(), 0);
}

#[test]
fn test_uninitialised_session_is_an_error() {
    let mut model = build(small_config());
    let mut session = Session::new(model.device());
    let x = images(&[1, 4, 4, 1]);
    assert!(matches!(
        model.train_step(&mut session, &x, &x),
        Err(SrcnnError::Runtime(_))
    ));
    assert_eq!(model.global_step(), 0);
}

#[test]
fn test_gpu_device_falls_back_to_cpu() {
    init_logging();
    let mut model = build(small_config().with_device("/device:GPU:0"));
    let mut session = model.new_session(4);
    let x = images(&[1, 4, 4, 1]);
    assert!(model.train_step(&mut session, &x, &x).is_ok());
}
