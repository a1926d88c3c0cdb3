use thiserror::Error;

/// Errors surfaced by the trainer. None of them is recovered locally.
#[derive(Error, Debug)]
pub enum GanError {
    /// Invalid hyperparameters or a source/config shape mismatch.
    #[error("config error: {0}")]
    Config(String),

    /// Empty dataset or an item that could not be loaded.
    #[error("dataset error: {0}")]
    Dataset(String),

    /// NaN/Inf in a loss, detected before the optimizer step that would consume it.
    #[error("non-finite {name} at iteration {iteration}: {value}")]
    NonFinite {
        name: &'static str,
        iteration: usize,
        value: f32,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),
}

pub type GanResult<T> = Result<T, GanError>;
