use resnet_config::ConfigError;
use resnet_data::{DataError, Split};

use crate::checkpoint::CheckpointError;

#[derive(Debug, thiserror::Error)]
pub enum TrainingError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error("failed to access {0}: {1}")]
    Io(String, std::io::Error),
    #[error("cannot evaluate in {0} mode, expected Valid or Test")]
    InvalidMode(Split),
    #[error("model predicts {model} classes but {dir} holds {data}")]
    ClassMismatch {
        dir: String,
        model: usize,
        data: usize,
    },
    #[error("{0} holds fewer images than one batch of {1}")]
    TooFewImages(String, usize),
}
