use anyhow::Result;
use burn::optim::AdamConfig;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use wgan_gp::model::{
    architecture::{CriticModelConfig, GeneratorModelConfig},
    data::{Cifar10Dataset, ImageFolderDataset, Split},
    training::{TrainingConfig, train},
    updater::WganGpConfig,
};

#[cfg(not(feature = "cuda"))]
mod backend {
    pub type MyBackend = burn::backend::NdArray<f32>;
    pub fn device() -> burn::backend::ndarray::NdArrayDevice {
        burn::backend::ndarray::NdArrayDevice::default()
    }
}

#[cfg(feature = "cuda")]
mod backend {
    pub type MyBackend = burn::backend::Cuda<f32, i32>;
    pub fn device() -> burn::backend::cuda::CudaDevice {
        burn::backend::cuda::CudaDevice::default()
    }
}

type MyAutodiffBackend = burn::backend::Autodiff<backend::MyBackend>;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DatasetKind {
    /// CIFAR-10 binary release (data_batch_*.bin)
    Cifar10,
    /// Directory of jpg/png/bmp/tiff images
    Folder,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Train a WGAN-GP on 32x32 RGB images", long_about = None)]
struct Args {
    #[arg(long, value_enum, default_value_t = DatasetKind::Cifar10)]
    dataset: DatasetKind,

    /// Directory holding the dataset files
    #[arg(long, default_value = "dataset/cifar-10-batches-bin")]
    data_dir: PathBuf,

    #[arg(long, default_value_t = 64)]
    batch_size: usize,

    #[arg(long, default_value_t = 100000)]
    max_iter: usize,

    /// Output directory for config, log, snapshots and previews
    #[arg(short, long, default_value = "results")]
    out_dir: PathBuf,

    #[arg(long, default_value_t = 10000)]
    snapshot_interval: usize,

    #[arg(long, default_value_t = 100)]
    display_interval: usize,

    /// The number of critic updates per generator update
    #[arg(long, default_value_t = 5)]
    n_dis: usize,

    /// Gradient penalty weight
    #[arg(long, default_value_t = 10.0)]
    lam: f64,

    /// Alpha in Adam optimizer
    #[arg(long, default_value_t = 0.0002)]
    adam_alpha: f64,

    /// Beta1 in Adam optimizer
    #[arg(long, default_value_t = 0.0)]
    adam_beta1: f32,

    /// Beta2 in Adam optimizer
    #[arg(long, default_value_t = 0.9)]
    adam_beta2: f32,

    /// Added under the square root of the penalty's gradient norm
    #[arg(long, default_value_t = 0.0)]
    gp_epsilon: f64,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Verbosity level
    #[arg(short, long, default_value = "info")]
    log_level: Level,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = TrainingConfig::new(
        GeneratorModelConfig::new(),
        CriticModelConfig::new(),
        WganGpConfig::new()
            .with_n_dis(args.n_dis)
            .with_lam(args.lam)
            .with_batch_size(args.batch_size)
            .with_learning_rate(args.adam_alpha)
            .with_gp_epsilon(args.gp_epsilon),
        AdamConfig::new()
            .with_beta_1(args.adam_beta1)
            .with_beta_2(args.adam_beta2),
    )
    .with_max_iter(args.max_iter)
    .with_snapshot_interval(args.snapshot_interval)
    .with_display_interval(args.display_interval)
    .with_seed(args.seed);

    let device = backend::device();
    info!("Writing results to {}", args.out_dir.display());

    match args.dataset {
        DatasetKind::Cifar10 => {
            let dataset = Cifar10Dataset::new(&args.data_dir, Split::Train)?;
            train::<MyAutodiffBackend, _>(&args.out_dir, config, dataset, device)?;
        }
        DatasetKind::Folder => {
            let dataset = ImageFolderDataset::new(&args.data_dir)?;
            train::<MyAutodiffBackend, _>(&args.out_dir, config, dataset, device)?;
        }
    }

    Ok(())
}
