use crate::error::{GanError, GanResult};
use crate::model::{
    architecture::{CriticModel, CriticModelConfig, Generator, GeneratorModel, GeneratorModelConfig},
    data::{ImageBatcher, ImageItem, ShuffledBatches},
    report::{MetricAccumulator, REPORT_KEYS},
    updater::{WganGpConfig, WganGpUpdater},
};
use crate::utils::save_image_grid;

use burn::{
    data::dataset::Dataset,
    module::AutodiffModule,
    optim::AdamConfig,
    prelude::*,
    record::CompactRecorder,
    tensor::backend::AutodiffBackend,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;
use tracing::info;

#[derive(Config)]
pub struct TrainingConfig {
    pub generator: GeneratorModelConfig,
    pub critic: CriticModelConfig,
    pub updater: WganGpConfig,
    pub optimizer: AdamConfig,

    #[config(default = 100000)]
    pub max_iter: usize,

    #[config(default = 10000)]
    pub snapshot_interval: usize,

    #[config(default = 100)]
    pub display_interval: usize,

    #[config(default = 10)]
    pub grid_rows: usize,

    #[config(default = 10)]
    pub grid_cols: usize,

    #[config(default = 42)]
    pub seed: u64,
}

impl TrainingConfig {
    pub fn validate(&self) -> GanResult<()> {
        self.updater.validate()?;
        if self.snapshot_interval == 0 || self.display_interval == 0 {
            return Err(GanError::Config(
                "snapshot and display intervals must be at least 1".to_string(),
            ));
        }
        if self.grid_rows == 0 || self.grid_cols == 0 {
            return Err(GanError::Config("preview grid must not be empty".to_string()));
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct LogEntry {
    iteration: usize,
    epoch: usize,
    elapsed_time: f64,
    #[serde(flatten)]
    metrics: BTreeMap<String, f32>,
}

fn write_log(artifact_dir: &Path, entries: &[LogEntry]) -> GanResult<()> {
    let json = serde_json::to_string_pretty(entries)
        .map_err(|e| GanError::Io(std::io::Error::other(e)))?;
    std::fs::write(artifact_dir.join("log"), json)?;
    Ok(())
}

fn save_snapshot<B: Backend, M: Module<B>>(
    module: &M,
    artifact_dir: &Path,
    name: String,
) -> GanResult<()> {
    module
        .clone()
        .save_file(artifact_dir.join(name), &CompactRecorder::new())
        .map_err(|e| GanError::Checkpoint(format!("{e:?}")))
}

/// Renders a grid of generator samples with inference-mode batch norm.
fn save_preview<B: AutodiffBackend>(
    generator: &GeneratorModel<B>,
    config: &TrainingConfig,
    artifact_dir: &Path,
    iteration: usize,
    device: &B::Device,
) -> GanResult<()> {
    let generator = generator.valid();
    let z = generator.sample_latent(config.grid_rows * config.grid_cols, device);
    let images = generator.forward(z);
    save_image_grid(
        images,
        config.grid_rows,
        config.grid_cols,
        artifact_dir
            .join("preview")
            .join(format!("iter{iteration:06}.png")),
    )
}

fn summary_line(metrics: &BTreeMap<String, f32>) -> String {
    REPORT_KEYS
        .iter()
        .filter_map(|key| metrics.get(*key).map(|v| format!("{key}: {v:.4}")))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Trains G and D on `dataset` until `max_iter` updater steps, writing the
/// config, a JSON log, module snapshots and per-epoch previews to `artifact_dir`.
pub fn train<B: AutodiffBackend, D: Dataset<ImageItem>>(
    artifact_dir: &Path,
    config: TrainingConfig,
    dataset: D,
    device: B::Device,
) -> GanResult<(GeneratorModel<B>, CriticModel<B>)> {
    config.validate()?;
    std::fs::create_dir_all(artifact_dir)?;
    config.save(artifact_dir.join("config.json"))?;

    B::seed(config.seed);

    info!("Training on {} images", dataset.len());
    let source = ShuffledBatches::new(
        dataset,
        ImageBatcher::default(),
        config.updater.batch_size,
        config.seed,
    )?;

    let generator = config.generator.init::<B>(&device);
    let critic = config.critic.init::<B>(&device);
    let optim_gen = config.optimizer.init();
    let optim_critic = config.optimizer.init();

    let mut updater = WganGpUpdater::new(
        &config.updater,
        generator,
        critic,
        optim_gen,
        optim_critic,
        source,
        device.clone(),
    )?;

    let start = Instant::now();
    let mut window = MetricAccumulator::new();
    let mut log = Vec::new();
    let mut last_epoch = updater.epoch();

    while updater.iteration() < config.max_iter {
        updater.update(&mut window)?;
        let iteration = updater.iteration();
        let epoch = updater.epoch();

        if iteration % config.display_interval == 0 {
            let metrics = window.summarize();
            info!(
                "[Epoch {} Iter {}/{}] {}",
                epoch,
                iteration,
                config.max_iter,
                summary_line(&metrics)
            );
            log.push(LogEntry {
                iteration,
                epoch,
                elapsed_time: start.elapsed().as_secs_f64(),
                metrics,
            });
            write_log(artifact_dir, &log)?;
        }

        if iteration % config.snapshot_interval == 0 {
            save_snapshot::<B, _>(updater.generator(), artifact_dir, format!("iter{iteration}_generator"))?;
            save_snapshot::<B, _>(updater.critic(), artifact_dir, format!("iter{iteration}_critic"))?;
            info!("Saved snapshot at iteration {}", iteration);
        }

        if epoch != last_epoch {
            last_epoch = epoch;
            save_preview(updater.generator(), &config, artifact_dir, iteration, &device)?;
        }
    }

    info!(
        "Finished {} iterations in {:.1}s",
        updater.iteration(),
        start.elapsed().as_secs_f64()
    );
    Ok(updater.into_modules())
}
