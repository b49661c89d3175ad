//! # srcnn-asg: SRCNN super-resolution on an Abstract Semantic Graph
//!
//! The model is built as a graph: a symbolic [`Tensor`](tensor::Tensor)
//! appends nodes to an **Abstract Semantic Graph (ASG)**, autograd appends
//! the gradient nodes to the same graph, and a
//! [`Session`](runtime::Session) evaluates it on the `ndarray` CPU backend.
//!
//! ## Usage Example
//!
//! ```no_run
//! use std::rc::Rc;
//! use std::cell::RefCell;
//! use ndarray::ArrayD;
//! use srcnn_asg::model::{Srcnn, SrcnnConfig};
//! use srcnn_asg::tensor::{GraphContext, Tensor};
//!
//! let context = Rc::new(RefCell::new(GraphContext::new()));
//! let x = Tensor::new_input(&context, "x");
//! let y = Tensor::new_input(&context, "y");
//!
//! let mut model = Srcnn::new(&x, &y, SrcnnConfig::default()).unwrap();
//! let mut session = model.new_session(42);
//!
//! let images = ArrayD::<f32>::zeros(vec![4, 33, 33, 1]);
//! let targets = ArrayD::<f32>::zeros(vec![4, 33, 33, 1]);
//! let metrics = model.train_step(&mut session, &images, &targets).unwrap();
//! println!("step {}: loss {}", metrics.global_step, metrics.loss);
//! ```

pub mod analysis;
pub mod asg;
pub mod autograd;
pub mod losses;
pub mod metrics;
pub mod model;
pub mod nn;
pub mod ops;
pub mod optimizers;
pub mod runtime;
pub mod tensor;
