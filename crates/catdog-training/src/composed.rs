//! Backbone and head composed end to end for fine-tuning.
//!
//! Units before `trainable_from` are frozen: they carry no gradients and,
//! in [`ComposedModel::forward_finetune`], run on the inner backend so their
//! batch-norm statistics stay fixed as well.

use crate::backbone::{ResNet, ResNetConfig};
use crate::head::BinaryHead;
use burn::{
    module::{AutodiffModule, Module},
    tensor::{activation::sigmoid, backend::AutodiffBackend, backend::Backend, Tensor},
};
use catdog_core::{Error, FreezeBoundary, Result};
use tracing::info;

#[derive(Module, Debug)]
pub struct ComposedModel<B: Backend> {
    pub backbone: ResNet<B>,
    pub head: BinaryHead<B>,
    trainable_from: usize,
}

impl<B: Backend> ComposedModel<B> {
    /// Joins a backbone with a head trained on its features; nothing frozen yet
    pub fn new(backbone: ResNet<B>, head: BinaryHead<B>) -> Result<Self> {
        if head.input_dim() != backbone.feature_dim() {
            return Err(Error::shape_mismatch(
                "head input vs backbone features",
                format!("D={}", backbone.feature_dim()),
                format!("D={}", head.input_dim()),
            ));
        }
        Ok(Self {
            backbone,
            head,
            trainable_from: 0,
        })
    }

    /// First unit that receives gradient updates
    pub fn trainable_from(&self) -> usize {
        self.trainable_from
    }

    /// Freezes units `< trainable_from`.
    ///
    /// Freezing only ever moves the boundary forward; a smaller index than
    /// the current one is an error.
    pub fn freeze_before(mut self, trainable_from: usize) -> Result<Self> {
        let units = self.backbone.num_units();
        if trainable_from > units {
            return Err(Error::InvalidArgument(format!(
                "freeze index {trainable_from} is past the last unit ({units})"
            )));
        }
        if trainable_from < self.trainable_from {
            return Err(Error::InvalidArgument(format!(
                "units before {} are already frozen; cannot unfreeze down to {trainable_from}",
                self.trainable_from
            )));
        }

        self.backbone = self.backbone.freeze_before(trainable_from);
        self.trainable_from = trainable_from;
        info!("Frozen units [0, {trainable_from}) of {units}");
        Ok(self)
    }

    /// Resolves a named or indexed boundary against `config`, then freezes
    pub fn freeze_at(self, config: &ResNetConfig, boundary: &FreezeBoundary) -> Result<Self> {
        let index = config.resolve_boundary(boundary)?;
        self.freeze_before(index)
    }

    /// Logits, [N, 1]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.head.forward(self.backbone.features(images))
    }

    /// Probability of class 1, [N, 1]
    pub fn predict_proba(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        sigmoid(self.forward(images))
    }
}

impl<B: AutodiffBackend> ComposedModel<B> {
    /// Training-mode forward pass that keeps the frozen prefix in inference
    /// mode: its output is computed on the inner backend and re-enters the
    /// graph as a constant.
    pub fn forward_finetune(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let start = self.trainable_from;
        let units = self.backbone.num_units();

        let x = if start > 0 {
            let prefix = self.backbone.valid();
            Tensor::from_inner(prefix.forward_units(images.inner(), 0, start))
        } else {
            images
        };

        let x = self.backbone.forward_units(x, start, units);
        self.head.forward(self.backbone.pool_features(x))
    }
}
