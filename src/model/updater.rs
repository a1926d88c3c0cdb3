//! The WGAN-GP updater: `n_dis` critic updates per generator update.

use burn::{
    module::AutodiffModule,
    optim::{GradientsParams, Optimizer},
    prelude::*,
    tensor::{ElementConversion, backend::AutodiffBackend},
};
use tracing::debug;

use crate::error::{GanError, GanResult};
use crate::model::{
    architecture::{Critic, Generator},
    data::BatchSource,
    penalty::GradientPenalty,
    report::{GRAD_NORM, LOSS_DIS, LOSS_GEN, LOSS_GP, Reporter},
};

#[derive(Config, Debug)]
pub struct WganGpConfig {
    /// Critic updates per generator update.
    #[config(default = 5)]
    pub n_dis: usize,

    /// Gradient penalty weight.
    #[config(default = 10.0)]
    pub lam: f64,

    #[config(default = 64)]
    pub batch_size: usize,

    /// Adam step size shared by both optimizers.
    #[config(default = 2e-4)]
    pub learning_rate: f64,

    /// Added under the square root of the penalty's gradient norm.
    #[config(default = 0.0)]
    pub gp_epsilon: f64,
}

impl WganGpConfig {
    pub fn validate(&self) -> GanResult<()> {
        if self.n_dis == 0 {
            return Err(GanError::Config("n_dis must be at least 1".to_string()));
        }
        if !self.lam.is_finite() || self.lam < 0.0 {
            return Err(GanError::Config(format!(
                "lam must be finite and non-negative, got {}",
                self.lam
            )));
        }
        if self.batch_size == 0 {
            return Err(GanError::Config("batch_size must be at least 1".to_string()));
        }
        if !self.gp_epsilon.is_finite() || self.gp_epsilon < 0.0 {
            return Err(GanError::Config(format!(
                "gp_epsilon must be finite and non-negative, got {}",
                self.gp_epsilon
            )));
        }
        Ok(())
    }
}

/// Critic-side losses of one inner iteration.
pub struct CriticObjective<B: Backend> {
    /// `mean(-D(x_real)) + mean(D(x_fake))`.
    pub loss_dis: Tensor<B, 1>,
    pub loss_gp: Tensor<B, 1>,
    pub grad_norm: Tensor<B, 1>,
}

/// Wasserstein loss plus gradient penalty. `x_fake` must be detached.
pub fn critic_objective<B: Backend, D: Critic<B>>(
    critic: &D,
    penalty: &GradientPenalty,
    x_real: Tensor<B, 4>,
    x_fake: Tensor<B, 4>,
) -> CriticObjective<B> {
    let y_real = critic.forward(x_real.clone());
    let y_fake = critic.forward(x_fake.clone());
    let loss_dis = y_real.neg().mean() + y_fake.mean();

    let gp = penalty.evaluate(critic, x_real, x_fake);

    CriticObjective {
        loss_dis,
        loss_gp: gp.loss,
        grad_norm: gp.grad_norm,
    }
}

/// Owns both networks, their optimizers and the data stream for the whole run.
pub struct WganGpUpdater<B, G, D, OG, OD, S>
where
    B: AutodiffBackend,
{
    generator: G,
    critic: D,
    optim_gen: OG,
    optim_critic: OD,
    source: S,
    penalty: GradientPenalty,
    n_dis: usize,
    learning_rate: f64,
    device: B::Device,
    iteration: usize,
    generator_updates: usize,
    critic_updates: usize,
}

impl<B, G, D, OG, OD, S> WganGpUpdater<B, G, D, OG, OD, S>
where
    B: AutodiffBackend,
    G: Generator<B> + AutodiffModule<B>,
    D: Critic<B> + AutodiffModule<B>,
    OG: Optimizer<G, B>,
    OD: Optimizer<D, B>,
    S: BatchSource<B>,
{
    pub fn new(
        config: &WganGpConfig,
        generator: G,
        critic: D,
        optim_gen: OG,
        optim_critic: OD,
        source: S,
        device: B::Device,
    ) -> GanResult<Self> {
        config.validate()?;
        if source.batch_size() != config.batch_size {
            return Err(GanError::Config(format!(
                "data source yields batches of {}, config expects {}",
                source.batch_size(),
                config.batch_size
            )));
        }

        Ok(Self {
            generator,
            critic,
            optim_gen,
            optim_critic,
            source,
            penalty: GradientPenalty::new(config.lam, config.gp_epsilon),
            n_dis: config.n_dis,
            learning_rate: config.learning_rate,
            device,
            iteration: 0,
            generator_updates: 0,
            critic_updates: 0,
        })
    }

    /// Runs one step: `n_dis` critic updates, the first preceded by the only
    /// generator update of the step. Any error aborts the step.
    pub fn update<R: Reporter>(&mut self, reporter: &mut R) -> GanResult<()> {
        for i in 0..self.n_dis {
            let x_real = self.source.next_batch(&self.device)?;
            let batch_size = x_real.dims()[0];

            let z = self.generator.sample_latent(batch_size, &self.device);
            let x_fake = self.generator.forward(z);

            if i == 0 {
                self.update_generator(x_fake.clone(), reporter)?;
            }
            // gen is not updated after here
            let x_fake = x_fake.detach();

            self.update_critic(x_real, x_fake, reporter)?;
        }

        self.iteration += 1;
        Ok(())
    }

    fn update_generator<R: Reporter>(
        &mut self,
        x_fake: Tensor<B, 4>,
        reporter: &mut R,
    ) -> GanResult<()> {
        let y_fake = self.critic.forward(x_fake);
        let loss_gen = y_fake.neg().mean();
        let value = self.checked(LOSS_GEN, &loss_gen)?;

        // Only the generator's share of the gradients is kept.
        let grads = GradientsParams::from_grads(loss_gen.backward(), &self.generator);
        self.generator = self
            .optim_gen
            .step(self.learning_rate, self.generator.clone(), grads);
        self.generator_updates += 1;

        reporter.report(LOSS_GEN, value);
        Ok(())
    }

    fn update_critic<R: Reporter>(
        &mut self,
        x_real: Tensor<B, 4>,
        x_fake: Tensor<B, 4>,
        reporter: &mut R,
    ) -> GanResult<()> {
        let objective = critic_objective(&self.critic, &self.penalty, x_real, x_fake);
        let loss_dis = self.checked(LOSS_DIS, &objective.loss_dis)?;
        let loss_gp = self.checked(LOSS_GP, &objective.loss_gp)?;
        let g = objective
            .grad_norm
            .mean()
            .into_scalar()
            .elem::<f32>();

        // Gradients of both terms accumulate into the same fresh buffers.
        let loss = objective.loss_dis + objective.loss_gp;
        let grads = GradientsParams::from_grads(loss.backward(), &self.critic);
        self.critic = self
            .optim_critic
            .step(self.learning_rate, self.critic.clone(), grads);
        self.critic_updates += 1;

        debug!(
            iteration = self.iteration,
            loss_dis, loss_gp, g, "critic updated"
        );
        reporter.report(LOSS_DIS, loss_dis);
        reporter.report(LOSS_GP, loss_gp);
        reporter.report(GRAD_NORM, g);
        Ok(())
    }

    fn checked(&self, name: &'static str, loss: &Tensor<B, 1>) -> GanResult<f32> {
        let value = loss.clone().into_scalar().elem::<f32>();
        if !value.is_finite() {
            return Err(GanError::NonFinite {
                name,
                iteration: self.iteration,
                value,
            });
        }
        Ok(value)
    }
}

impl<B, G, D, OG, OD, S> WganGpUpdater<B, G, D, OG, OD, S>
where
    B: AutodiffBackend,
    S: BatchSource<B>,
{
    /// Completed steps.
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn epoch(&self) -> usize {
        self.source.epoch()
    }

    pub fn generator_updates(&self) -> usize {
        self.generator_updates
    }

    pub fn critic_updates(&self) -> usize {
        self.critic_updates
    }

    pub fn generator(&self) -> &G {
        &self.generator
    }

    pub fn critic(&self) -> &D {
        &self.critic
    }

    pub fn into_modules(self) -> (G, D) {
        (self.generator, self.critic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::data::{ImageBatcher, ImageItem, ShuffledBatches};
    use crate::model::report::MetricAccumulator;
    use approx::assert_abs_diff_eq;
    use burn::backend::{Autodiff, NdArray};
    use burn::data::dataset::InMemDataset;
    use burn::nn::{Initializer, Linear, LinearConfig};
    use burn::optim::AdamConfig;
    use burn::tensor::Distribution;
    use std::collections::BTreeMap;

    type TestBackend = Autodiff<NdArray>;

    const LATENT: usize = 8;
    const CHANNELS: usize = 3;
    const SIDE: usize = 4;
    const FEATURES: usize = CHANNELS * SIDE * SIDE;
    const CRITIC_WEIGHT: f64 = 0.05;

    #[derive(Module, Debug)]
    struct LinearGenerator<B: Backend> {
        linear: Linear<B>,
    }

    impl<B: Backend> Generator<B> for LinearGenerator<B> {
        fn latent_dim(&self) -> usize {
            LATENT
        }

        fn forward(&self, z: Tensor<B, 2>) -> Tensor<B, 4> {
            let batch_size = z.dims()[0];
            self.linear
                .forward(z)
                .reshape([batch_size, CHANNELS, SIDE, SIDE])
        }

        fn latent_distribution(&self) -> Distribution {
            Distribution::Uniform(-1.0, 1.0)
        }
    }

    #[derive(Module, Debug)]
    struct LinearCritic<B: Backend> {
        linear: Linear<B>,
    }

    impl<B: Backend> Critic<B> for LinearCritic<B> {
        fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
            self.linear.forward(x.flatten::<2>(1, 3))
        }

        fn score_and_input_gradient(&self, x: Tensor<B, 4>) -> (Tensor<B, 2>, Tensor<B, 4>) {
            let dims = x.dims();
            let score = self.forward(x);
            let ones = Tensor::<B, 2>::ones([dims[0], 1], &score.device());
            let grad = ones
                .matmul(self.linear.weight.val().transpose())
                .reshape(dims);
            (score, grad)
        }
    }

    /// Keeps every reported value in order.
    #[derive(Default)]
    struct Recorder {
        values: BTreeMap<String, Vec<f32>>,
    }

    impl Reporter for Recorder {
        fn report(&mut self, name: &str, value: f32) {
            self.values.entry(name.to_string()).or_default().push(value);
        }
    }

    impl Recorder {
        fn get(&self, name: &str) -> &[f32] {
            self.values.get(name).map(Vec::as_slice).unwrap_or(&[])
        }

        fn count(&self, name: &str) -> usize {
            self.get(name).len()
        }
    }

    fn source(batch_size: usize) -> ShuffledBatches<InMemDataset<ImageItem>> {
        let items = (0..10)
            .map(|i| ImageItem {
                image: (0..FEATURES)
                    .map(|j| ((i * FEATURES + j) % 7) as f32 / 3.5 - 1.0)
                    .collect(),
            })
            .collect();
        let batcher = ImageBatcher {
            channels: CHANNELS,
            height: SIDE,
            width: SIDE,
        };
        ShuffledBatches::new(InMemDataset::new(items), batcher, batch_size, 5).unwrap()
    }

    fn modules(
        device: &<TestBackend as Backend>::Device,
    ) -> (LinearGenerator<TestBackend>, LinearCritic<TestBackend>) {
        let generator = LinearGenerator {
            linear: LinearConfig::new(LATENT, FEATURES).init(device),
        };
        let critic = LinearCritic {
            linear: LinearConfig::new(FEATURES, 1)
                .with_initializer(Initializer::Constant {
                    value: CRITIC_WEIGHT,
                })
                .init(device),
        };
        (generator, critic)
    }

    fn updater(
        config: &WganGpConfig,
    ) -> WganGpUpdater<
        TestBackend,
        LinearGenerator<TestBackend>,
        LinearCritic<TestBackend>,
        impl Optimizer<LinearGenerator<TestBackend>, TestBackend> + use<>,
        impl Optimizer<LinearCritic<TestBackend>, TestBackend> + use<>,
        ShuffledBatches<InMemDataset<ImageItem>>,
    > {
        TestBackend::seed(17);
        let device = Default::default();
        let (generator, critic) = modules(&device);
        let optim = AdamConfig::new().with_beta_1(0.0).with_beta_2(0.9);

        WganGpUpdater::new(
            config,
            generator,
            critic,
            optim.init(),
            optim.init(),
            source(config.batch_size),
            device,
        )
        .unwrap()
    }

    fn weights<B: Backend>(linear: &Linear<B>) -> Vec<f32> {
        linear.weight.val().into_data().to_vec().unwrap()
    }

    fn scenario_config() -> WganGpConfig {
        WganGpConfig::new()
            .with_batch_size(4)
            .with_n_dis(2)
            .with_lam(10.0)
    }

    #[test]
    fn one_step_reports_each_metric_per_update() {
        let mut updater = updater(&scenario_config());
        let mut recorder = Recorder::default();

        updater.update(&mut recorder).unwrap();

        assert_eq!(recorder.count(LOSS_GEN), 1);
        assert_eq!(recorder.count(LOSS_DIS), 2);
        assert_eq!(recorder.count(LOSS_GP), 2);
        assert_eq!(recorder.count(GRAD_NORM), 2);
        assert_eq!(updater.iteration(), 1);
    }

    #[test]
    fn first_penalty_matches_linear_critic_closed_form() {
        let mut updater = updater(&scenario_config());
        let mut recorder = Recorder::default();

        updater.update(&mut recorder).unwrap();

        // A linear critic's input gradient is its weight vector wherever x_mid lies.
        let norm = (CRITIC_WEIGHT * (FEATURES as f64).sqrt()) as f32;
        assert_abs_diff_eq!(recorder.get(GRAD_NORM)[0], norm, epsilon = 1e-5);
        assert_abs_diff_eq!(
            recorder.get(LOSS_GP)[0],
            10.0 * (norm - 1.0).powi(2),
            epsilon = 1e-4
        );
    }

    #[test]
    fn generator_updates_once_and_critic_n_dis_times_per_step() {
        let mut updater = updater(&scenario_config().with_n_dis(3));
        let mut recorder = Recorder::default();

        for step in 1..=3 {
            let gen_before = weights(&updater.generator().linear);
            let critic_before = weights(&updater.critic().linear);

            updater.update(&mut recorder).unwrap();

            assert_eq!(updater.generator_updates(), step);
            assert_eq!(updater.critic_updates(), 3 * step);
            assert_ne!(weights(&updater.generator().linear), gen_before);
            assert_ne!(weights(&updater.critic().linear), critic_before);
        }
        assert_eq!(recorder.count(LOSS_GEN), 3);
        assert_eq!(recorder.count(LOSS_DIS), 9);
    }

    #[test]
    fn single_critic_iteration_is_one_to_one() {
        let mut updater = updater(&scenario_config().with_n_dis(1));
        let mut recorder = Recorder::default();

        for _ in 0..4 {
            updater.update(&mut recorder).unwrap();
        }

        assert_eq!(updater.generator_updates(), 4);
        assert_eq!(updater.critic_updates(), 4);
        assert_eq!(recorder.count(LOSS_GEN), recorder.count(LOSS_DIS));
    }

    #[test]
    fn zero_lambda_zeroes_penalty_but_reports_norm() {
        let mut updater = updater(&scenario_config().with_lam(0.0));
        let mut recorder = Recorder::default();

        updater.update(&mut recorder).unwrap();
        updater.update(&mut recorder).unwrap();

        assert!(recorder.get(LOSS_GP).iter().all(|v| *v == 0.0));
        assert_eq!(recorder.count(GRAD_NORM), 4);
        assert!(recorder.get(GRAD_NORM).iter().all(|g| *g > 0.0));
    }

    #[test]
    fn accumulator_sees_the_same_counts() {
        let mut updater = updater(&scenario_config());
        let mut metrics = MetricAccumulator::new();

        updater.update(&mut metrics).unwrap();

        assert_eq!(metrics.count(LOSS_GEN), 1);
        assert_eq!(metrics.count(LOSS_DIS), 2);
        assert_eq!(metrics.count(LOSS_GP), 2);
        assert_eq!(metrics.count(GRAD_NORM), 2);
    }

    #[test]
    fn detached_fakes_send_no_gradient_to_generator() {
        let device = Default::default();
        let (generator, critic) = modules(&device);
        let penalty = GradientPenalty::new(10.0, 0.0);
        let x_real = Tensor::<TestBackend, 4>::random(
            [4, CHANNELS, SIDE, SIDE],
            Distribution::Uniform(-1.0, 1.0),
            &device,
        );
        let z = generator.sample_latent(4, &device);
        let x_fake = generator.forward(z);

        let objective = critic_objective(&critic, &penalty, x_real.clone(), x_fake.clone().detach());
        let grads = (objective.loss_dis + objective.loss_gp).backward();
        assert!(generator.linear.weight.val().grad(&grads).is_none());
        assert!(critic.linear.weight.val().grad(&grads).is_some());

        // Without detaching, the same objective does reach the generator.
        let objective = critic_objective(&critic, &penalty, x_real, x_fake);
        let grads = objective.loss_dis.backward();
        assert!(generator.linear.weight.val().grad(&grads).is_some());
    }

    #[test]
    fn invalid_configs_are_rejected() {
        assert!(WganGpConfig::new().with_n_dis(0).validate().is_err());
        assert!(WganGpConfig::new().with_lam(-1.0).validate().is_err());
        assert!(WganGpConfig::new().with_lam(f64::NAN).validate().is_err());
        assert!(WganGpConfig::new().with_batch_size(0).validate().is_err());
        assert!(WganGpConfig::new().with_gp_epsilon(-1e-8).validate().is_err());
        assert!(WganGpConfig::new().with_lam(0.0).validate().is_ok());
    }

    #[test]
    fn source_batch_size_must_match_config() {
        let device = Default::default();
        let (generator, critic) = modules(&device);
        let optim = AdamConfig::new();
        let result = WganGpUpdater::<TestBackend, _, _, _, _, _>::new(
            &WganGpConfig::new().with_batch_size(4),
            generator,
            critic,
            optim.init(),
            optim.init(),
            source(2),
            device,
        );
        assert!(matches!(result, Err(GanError::Config(_))));
    }

    #[test]
    fn non_finite_loss_aborts_the_step() {
        let device = Default::default();
        let (generator, _) = modules(&device);
        let critic = LinearCritic {
            linear: LinearConfig::new(FEATURES, 1)
                .with_initializer(Initializer::Constant { value: f64::NAN })
                .init(&device),
        };
        let optim = AdamConfig::new();
        let mut updater = WganGpUpdater::<TestBackend, _, _, _, _, _>::new(
            &scenario_config(),
            generator,
            critic,
            optim.init(),
            optim.init(),
            source(4),
            device,
        )
        .unwrap();

        let result = updater.update(&mut Recorder::default());
        assert!(matches!(
            result,
            Err(GanError::NonFinite { name: LOSS_GEN, iteration: 0, .. })
        ));
        assert_eq!(updater.generator_updates(), 0);
        assert_eq!(updater.iteration(), 0);
    }
}
