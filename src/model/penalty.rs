//! Gradient penalty of WGAN-GP.
//!
//! The penalty pushes the critic's input-gradient norm towards 1 on random
//! interpolations between real and generated samples.

use burn::{prelude::*, tensor::Distribution};

use crate::model::architecture::Critic;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradientPenalty {
    /// Penalty weight.
    pub lam: f64,
    /// Added under the square root of the gradient norm. Zero reproduces the
    /// unguarded norm, whose gradient is NaN when a sample's input gradient
    /// vanishes exactly.
    pub epsilon: f64,
}

pub struct PenaltyOutput<B: Backend> {
    /// `lam * mean((grad_norm - 1)^2)`, shape `[1]`.
    pub loss: Tensor<B, 1>,
    /// Per-sample input-gradient L2 norm, shape `[batch]`.
    pub grad_norm: Tensor<B, 1>,
}

/// `eps * x_real + (1 - eps) * x_fake`, with `eps` broadcast from `[batch, 1, 1, 1]`.
pub fn interpolate<B: Backend>(
    x_real: Tensor<B, 4>,
    x_fake: Tensor<B, 4>,
    eps: Tensor<B, 4>,
) -> Tensor<B, 4> {
    let complement = eps.clone().neg().add_scalar(1.0);
    eps * x_real + complement * x_fake
}

impl GradientPenalty {
    pub fn new(lam: f64, epsilon: f64) -> Self {
        Self { lam, epsilon }
    }

    /// Samples a fresh `eps ~ U(0, 1)` per sample and evaluates the penalty.
    ///
    /// `x_fake` must already be detached from the generator graph.
    pub fn evaluate<B: Backend, D: Critic<B>>(
        &self,
        critic: &D,
        x_real: Tensor<B, 4>,
        x_fake: Tensor<B, 4>,
    ) -> PenaltyOutput<B> {
        let batch_size = x_real.dims()[0];
        let eps = Tensor::<B, 4>::random(
            [batch_size, 1, 1, 1],
            Distribution::Uniform(0.0, 1.0),
            &x_real.device(),
        );
        self.evaluate_with(critic, x_real, x_fake, eps)
    }

    pub fn evaluate_with<B: Backend, D: Critic<B>>(
        &self,
        critic: &D,
        x_real: Tensor<B, 4>,
        x_fake: Tensor<B, 4>,
        eps: Tensor<B, 4>,
    ) -> PenaltyOutput<B> {
        let x_mid = interpolate(x_real, x_fake, eps);
        let (_, grad) = critic.score_and_input_gradient(x_mid);

        let grad_norm = grad
            .flatten::<2>(1, 3)
            .powf_scalar(2.0)
            .sum_dim(1)
            .add_scalar(self.epsilon)
            .sqrt()
            .squeeze::<1>(1);

        let loss = grad_norm
            .clone()
            .sub_scalar(1.0)
            .powf_scalar(2.0)
            .mean()
            .mul_scalar(self.lam);

        PenaltyOutput { loss, grad_norm }
    }
}
