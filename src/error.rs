use std::{fmt, path::PathBuf};

use thiserror::Error;

/// Error kinds raised by the conversion core.
#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("unsupported input extension: {path} (expected .vrm)")]
    ExtInvalid { path: PathBuf },

    #[error("input file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("parse failed: {0}")]
    ParseFailed(String),

    #[error("unsupported format: {0}")]
    FormatUnsupported(String),

    #[error("model invalid: {0}")]
    ModelInvalid(String),

    #[error("i/o failed on {path}: {source}")]
    IoFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ConvertError {
    pub(crate) fn parse(message: impl Into<String>) -> Self {
        Self::ParseFailed(message.into())
    }

    pub(crate) fn unsupported(message: impl Into<String>) -> Self {
        Self::FormatUnsupported(message.into())
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::ModelInvalid(message.into())
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::IoFailed {
            path: path.into(),
            source,
        }
    }
}

/// Named pipeline stage used to label errors surfaced by the entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Input,
    Decode,
    Scene,
    Skeleton,
    Layout,
    Mesh,
    MaterialReorder,
    HumanoidMap,
    StanceTransfer,
    MorphRename,
    Save,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Input => "input",
            Stage::Decode => "decode",
            Stage::Scene => "scene",
            Stage::Skeleton => "skeleton",
            Stage::Layout => "output-layout",
            Stage::Mesh => "mesh",
            Stage::MaterialReorder => "material-reorder",
            Stage::HumanoidMap => "humanoid-map",
            Stage::StanceTransfer => "stance-transfer",
            Stage::MorphRename => "morph-rename",
            Stage::Save => "save",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A [`ConvertError`] labelled with the stage it escaped from.
#[derive(Error, Debug)]
#[error("{stage}: {source}")]
pub struct PipelineError {
    pub stage: Stage,
    #[source]
    pub source: ConvertError,
}

impl PipelineError {
    pub fn kind(&self) -> &ConvertError {
        &self.source
    }
}

/// Attach a stage label to a stage-local result.
pub(crate) trait StageExt<T> {
    fn at(self, stage: Stage) -> Result<T, PipelineError>;
}

impl<T> StageExt<T> for Result<T, ConvertError> {
    fn at(self, stage: Stage) -> Result<T, PipelineError> {
        self.map_err(|source| PipelineError { stage, source })
    }
}

pub type ConvertResult<T> = Result<T, ConvertError>;
