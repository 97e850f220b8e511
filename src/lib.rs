//! VRM (glTF 2.0 + `VRM`/`VRMC_vrm`) to PMX converter.

pub mod batch;
pub mod convert;
pub mod correction;
pub mod error;
pub mod logging;
pub mod notify;
pub mod pipeline;
pub mod pmx;
pub mod progress;
pub mod project;
pub mod texture;

pub use convert::{ConversionReport, ConvertOptions, Profile, VrmVersion};
pub use error::{ConvertError, PipelineError, Stage};
pub use pipeline::{convert_vrm_to_pmx, load_model, prepare_model, save_model};
pub use pmx::PmxModel;
pub use progress::{LogReporter, NoopReporter, ProgressEvent, ProgressReporter};
