use burn::{
    nn::{
        BatchNorm, BatchNormConfig, LeakyRelu, LeakyReluConfig, Linear, LinearConfig,
        PaddingConfig2d, Relu, Tanh,
        conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig},
    },
    prelude::*,
    tensor::{Distribution, module::conv_transpose2d, ops::ConvTransposeOptions},
};

use crate::model::constants::{BOTTOM, CHANNELS};

/// A generator maps latent codes `[batch, latent_dim]` to images `[batch, C, H, W]`.
pub trait Generator<B: Backend> {
    fn latent_dim(&self) -> usize;

    fn forward(&self, z: Tensor<B, 2>) -> Tensor<B, 4>;

    fn latent_distribution(&self) -> Distribution {
        Distribution::Normal(0.0, 1.0)
    }

    /// Fresh latent codes; never cached between calls.
    fn sample_latent(&self, n: usize, device: &B::Device) -> Tensor<B, 2> {
        Tensor::random([n, self.latent_dim()], self.latent_distribution(), device)
    }
}

/// A Wasserstein critic scoring every sample independently.
///
/// burn differentiates to first order only, so a critic has to spell out its
/// own input gradient with tracked tensor ops. Backpropagating through the
/// returned gradient then yields the second-order term the gradient penalty
/// needs.
pub trait Critic<B: Backend> {
    /// Scores of shape `[batch, 1]`.
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2>;

    /// Scores together with `d(sum of scores)/dx`, differentiable w.r.t. the
    /// critic parameters. Samples must not interact, so row `i` of the
    /// gradient only depends on sample `i`.
    fn score_and_input_gradient(&self, x: Tensor<B, 4>) -> (Tensor<B, 2>, Tensor<B, 4>);
}

#[derive(Module, Debug)]
pub struct GeneratorModel<B: Backend> {
    linear1: Linear<B>,
    bn0: BatchNorm<B, 2>,
    conv1: ConvTranspose2d<B>,
    conv2: ConvTranspose2d<B>,
    conv3: ConvTranspose2d<B>,
    bn1: BatchNorm<B, 2>,
    bn2: BatchNorm<B, 2>,
    bn3: BatchNorm<B, 2>,
    conv_out: Conv2d<B>,
    activation: Relu,
    activation_out: Tanh,
    latent_dim: usize,
    base_channels: usize,
}

#[derive(Config, Debug)]
pub struct GeneratorModelConfig {
    #[config(default = 128)]
    pub latent_dim: usize,
    /// Channels of the 4x4 map; halved by each upsampling block.
    #[config(default = 512)]
    pub base_channels: usize,
}

#[derive(Module, Debug)]
pub struct CriticModel<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    conv3: Conv2d<B>,
    head: Linear<B>,
    activation: LeakyRelu,
    negative_slope: f64,
    features: usize,
}

#[derive(Config, Debug)]
pub struct CriticModelConfig {
    #[config(default = "0.2")]
    pub leaky_relu_slope: f64,
    /// Channels after the first downsampling block; doubled by the next two.
    #[config(default = 64)]
    pub base_channels: usize,
}

fn upsample(channels: [usize; 2]) -> ConvTranspose2dConfig {
    ConvTranspose2dConfig::new(channels, [4, 4])
        .with_stride([2, 2])
        .with_padding([1, 1])
}

// Every critic convolution halves the spatial size: k4 s2 p1.
const CRITIC_STRIDE: [usize; 2] = [2, 2];
const CRITIC_PADDING: [usize; 2] = [1, 1];

fn downsample(channels: [usize; 2]) -> Conv2dConfig {
    Conv2dConfig::new(channels, [4, 4])
        .with_stride(CRITIC_STRIDE)
        .with_padding(PaddingConfig2d::Explicit(CRITIC_PADDING[0], CRITIC_PADDING[1]))
}

impl GeneratorModelConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> GeneratorModel<B> {
        let c = self.base_channels;

        GeneratorModel {
            linear1: LinearConfig::new(self.latent_dim, c * BOTTOM * BOTTOM).init(device),
            bn0: BatchNormConfig::new(c).init(device),
            conv1: upsample([c, c / 2]).init(device),    // 4 -> 8
            conv2: upsample([c / 2, c / 4]).init(device), // 8 -> 16
            conv3: upsample([c / 4, c / 8]).init(device), // 16 -> 32
            bn1: BatchNormConfig::new(c / 2).init(device),
            bn2: BatchNormConfig::new(c / 4).init(device),
            bn3: BatchNormConfig::new(c / 8).init(device),
            conv_out: Conv2dConfig::new([c / 8, CHANNELS], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device),
            activation: Relu,
            activation_out: Tanh::new(),
            latent_dim: self.latent_dim,
            base_channels: c,
        }
    }
}

impl CriticModelConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> CriticModel<B> {
        let c = self.base_channels;
        let features = c * 4 * BOTTOM * BOTTOM;

        CriticModel {
            conv1: downsample([CHANNELS, c]).init(device), // 32 -> 16
            conv2: downsample([c, c * 2]).init(device),    // 16 -> 8
            conv3: downsample([c * 2, c * 4]).init(device), // 8 -> 4
            head: LinearConfig::new(features, 1).init(device),
            activation: LeakyReluConfig::new()
                .with_negative_slope(self.leaky_relu_slope)
                .init(),
            negative_slope: self.leaky_relu_slope,
            features,
        }
    }
}

impl<B: Backend> Generator<B> for GeneratorModel<B> {
    fn latent_dim(&self) -> usize {
        self.latent_dim
    }

    fn forward(&self, z: Tensor<B, 2>) -> Tensor<B, 4> {
        let batch_size = z.dims()[0];
        let x = self.linear1.forward(z);
        let mut x = x.reshape([batch_size, self.base_channels, BOTTOM, BOTTOM]);
        x = self.bn0.forward(x);
        x = self.activation.forward(x);
        x = self.conv1.forward(x);
        x = self.bn1.forward(x);
        x = self.activation.forward(x);
        x = self.conv2.forward(x);
        x = self.bn2.forward(x);
        x = self.activation.forward(x);
        x = self.conv3.forward(x);
        x = self.bn3.forward(x);
        x = self.activation.forward(x);
        x = self.conv_out.forward(x);
        self.activation_out.forward(x)
    }
}

impl<B: Backend> CriticModel<B> {
    /// Leaky ReLU derivative at the pre-activation: 1 where positive, slope elsewhere.
    /// Built from a comparison mask, so it carries no graph.
    fn activation_derivative(&self, pre: Tensor<B, 4>) -> Tensor<B, 4> {
        pre.lower_equal_elem(0.0)
            .float()
            .mul_scalar(self.negative_slope - 1.0)
            .add_scalar(1.0)
    }

    /// Pulls a gradient back through one k4 s2 p1 convolution.
    fn conv_input_gradient(&self, grad: Tensor<B, 4>, conv: &Conv2d<B>) -> Tensor<B, 4> {
        conv_transpose2d(
            grad,
            conv.weight.val(),
            None,
            ConvTransposeOptions::new(CRITIC_STRIDE, CRITIC_PADDING, [0, 0], [1, 1], 1),
        )
    }
}

impl<B: Backend> Critic<B> for CriticModel<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let batch_size = x.dims()[0];
        let mut x = self.conv1.forward(x);
        x = self.activation.forward(x);
        x = self.conv2.forward(x);
        x = self.activation.forward(x);
        x = self.conv3.forward(x);
        x = self.activation.forward(x);

        let x_flat = x.reshape([batch_size, self.features]);
        self.head.forward(x_flat)
    }

    fn score_and_input_gradient(&self, x: Tensor<B, 4>) -> (Tensor<B, 2>, Tensor<B, 4>) {
        let batch_size = x.dims()[0];

        // Forward, keeping the pre-activations for the backward pass.
        let h1 = self.conv1.forward(x);
        let h2 = self.conv2.forward(self.activation.forward(h1.clone()));
        let h3 = self.conv3.forward(self.activation.forward(h2.clone()));
        let shape = h3.dims();
        let x_flat = self.activation.forward(h3.clone()).reshape([batch_size, self.features]);
        let score = self.head.forward(x_flat);

        // Backward in tracked ops. head.weight is [features, 1].
        let ones = Tensor::<B, 2>::ones([batch_size, 1], &score.device());
        let grad = ones.matmul(self.head.weight.val().transpose());
        let grad = grad.reshape(shape) * self.activation_derivative(h3);
        let grad = self.conv_input_gradient(grad, &self.conv3) * self.activation_derivative(h2);
        let grad = self.conv_input_gradient(grad, &self.conv2) * self.activation_derivative(h1);
        let grad = self.conv_input_gradient(grad, &self.conv1);

        (score, grad)
    }
}
