use std::fmt;
use std::io;
use std::path::Path;

use burn::module::Module;
use burn::record::{BinFileRecorder, FullPrecisionSettings};
use burn::tensor::backend::Backend;

#[derive(Debug)]
pub enum CheckpointError {
    Io(io::Error),
    Recorder(String),
    NoCheckpoint,
}

impl fmt::Display for CheckpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointError::Io(e) => write!(f, "checkpoint io error: {}", e),
            CheckpointError::Recorder(msg) => write!(f, "checkpoint recorder error: {}", msg),
            CheckpointError::NoCheckpoint => write!(f, "no checkpoint found at the given path"),
        }
    }
}

impl std::error::Error for CheckpointError {}

impl From<io::Error> for CheckpointError {
    fn from(e: io::Error) -> Self {
        CheckpointError::Io(e)
    }
}

/// Saves model weights as a binary record, creating parent directories
/// as needed. The recorder appends its own file extension.
pub fn save_params<B: Backend, M: Module<B>>(
    model: &M,
    path: impl AsRef<Path>,
) -> Result<(), CheckpointError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    model
        .clone()
        .save_file(path, &recorder)
        .map_err(|e| CheckpointError::Recorder(e.to_string()))
}

/// Loads weights saved by `save_params` into a freshly built model.
pub fn load_params<B: Backend, M: Module<B>>(
    template: M,
    path: impl AsRef<Path>,
    device: &B::Device,
) -> Result<M, CheckpointError> {
    let path = path.as_ref();
    if !path.with_extension("bin").exists() && !path.exists() {
        return Err(CheckpointError::NoCheckpoint);
    }
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    template
        .load_file(path, &recorder, device)
        .map_err(|e| CheckpointError::Recorder(e.to_string()))
}
