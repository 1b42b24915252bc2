//! Single dense layer with a sigmoid output.

use burn::{
    config::Config,
    module::Module,
    nn::{Linear, LinearConfig},
    tensor::{activation::sigmoid, backend::Backend, Tensor},
};

#[derive(Config, Debug)]
pub struct BinaryHeadConfig {
    /// Width of the incoming feature vectors
    pub input_dim: usize,
}

impl BinaryHeadConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> BinaryHead<B> {
        BinaryHead {
            linear: LinearConfig::new(self.input_dim, 1).init(device),
        }
    }
}

/// Logistic-regression head: `sigmoid(W x + b)`
#[derive(Module, Debug)]
pub struct BinaryHead<B: Backend> {
    pub linear: Linear<B>,
}

impl<B: Backend> BinaryHead<B> {
    /// Logits, [N, 1]
    pub fn forward(&self, features: Tensor<B, 2>) -> Tensor<B, 2> {
        self.linear.forward(features)
    }

    /// Probability of class 1, [N, 1]
    pub fn predict_proba(&self, features: Tensor<B, 2>) -> Tensor<B, 2> {
        sigmoid(self.forward(features))
    }

    pub fn input_dim(&self) -> usize {
        self.linear.weight.dims()[0]
    }
}
