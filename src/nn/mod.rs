//! # Neural Network Layers
//!
//! Each layer is a constructor that adds a pattern of nodes (operations and
//! parameters) to the ASG.
//!
//! - [`Conv2d`]: NHWC convolution, stride 1, `Same` or `Valid` padding
//! - [`Module`]: the trait every layer implements
//!
//! ```ignore
//! use srcnn_asg::nn::{Conv2d, Module};
//! use srcnn_asg::tensor::{GraphContext, Tensor};
//!
//! let ctx = Rc::new(RefCell::new(GraphContext::new()));
//! let conv = Conv2d::new(&ctx, "hidden_0", 1, 64, 9);
//!
//! let x = Tensor::new_input(&ctx, "x");
//! let h = conv.forward(&x).relu();
//! ```

pub mod conv;
pub mod module;

pub use conv::{Conv2d, Conv2dConfig};
pub use module::Module;
