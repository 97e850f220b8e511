//! Sequential multi-model conversion used by the CLI.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::{
    convert::{ConversionReport, ConvertOptions},
    convert::layout::file_stem,
    logging::ResultExt,
    pipeline::{convert_vrm_to_pmx, load_model, prepare_model},
    progress::ProgressReporter,
    project::ConvertSettings,
};

/// One model to convert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchJob {
    pub input: PathBuf,
    /// Explicit output path; otherwise derived from the settings.
    pub output: Option<PathBuf>,
}

impl BatchJob {
    pub fn new(input: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            output: None,
        }
    }
}

/// Result of a batch run.
#[derive(Debug, Default)]
pub struct BatchSummary {
    pub converted: Vec<ConversionReport>,
    pub failed: Vec<(PathBuf, anyhow::Error)>,
    /// Jobs not attempted after a fail-fast stop.
    pub skipped: usize,
}

impl BatchSummary {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Output path for `job`: explicit path, then `{root}/{stem}/{stem}.pmx`
/// under the output root, then the options' path, else the default.
fn resolve_output(job: &BatchJob, settings: &ConvertSettings) -> Option<PathBuf> {
    if let Some(output) = &job.output {
        return Some(output.clone());
    }
    if let Some(root) = &settings.output_root {
        let stem = file_stem(&job.input);
        return Some(Path::new(root).join(&stem).join(format!("{stem}.pmx")));
    }
    settings.options.output_path.clone()
}

fn run_job(
    job: &BatchJob,
    settings: &ConvertSettings,
    reporter: &mut dyn ProgressReporter,
) -> Result<ConversionReport> {
    let options = ConvertOptions {
        output_path: resolve_output(job, settings),
        ..settings.options.clone()
    };
    let label = job.input.display().to_string();
    if settings.dry_run {
        let loaded = load_model(&job.input, &options, reporter).log_error(Some(&label))?;
        let prepared = prepare_model(loaded, reporter).log_error(Some(&label))?;
        return Ok(prepared.report().clone());
    }
    Ok(convert_vrm_to_pmx(&job.input, &options, reporter).log_error(Some(&label))?)
}

/// Convert every job in order. Failures are collected unless
/// `settings.fail_fast` is set, in which case the run stops at the first one.
pub fn run_batch(
    jobs: &[BatchJob],
    settings: &ConvertSettings,
    reporter: &mut dyn ProgressReporter,
) -> BatchSummary {
    let mut summary = BatchSummary::default();
    for (position, job) in jobs.iter().enumerate() {
        log::info!("[{}/{}] {}", position + 1, jobs.len(), job.input.display());
        let result = run_job(job, settings, reporter)
            .with_context(|| format!("failed to convert {}", job.input.display()));
        match result {
            Ok(report) => summary.converted.push(report),
            Err(err) => {
                summary.failed.push((job.input.clone(), err));
                if settings.fail_fast {
                    summary.skipped = jobs.len() - position - 1;
                    break;
                }
            }
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::{
        convert::test_support::{GltfFixture, vrm1_json},
        progress::NoopReporter,
    };

    fn write_model(dir: &Path, name: &str) -> PathBuf {
        GltfFixture::new(vrm1_json(
            json!([{ "name": "hips", "translation": [0.0, 0.8, 0.0] }]),
            json!({ "hips": { "node": 0 } }),
        ))
        .write(dir, name)
    }

    fn settings_with_root(root: &Path) -> ConvertSettings {
        ConvertSettings {
            output_root: Some(root.to_string_lossy().into_owned()),
            ..ConvertSettings::default()
        }
    }

    #[test]
    fn given_output_root_when_resolving_then_model_gets_its_own_folder() {
        let settings = settings_with_root(Path::new("/out"));

        let output = resolve_output(&BatchJob::new("/in/Alicia.vrm"), &settings);

        assert_eq!(output, Some(PathBuf::from("/out/Alicia/Alicia.pmx")));
    }

    #[test]
    fn given_two_models_when_running_batch_then_both_are_written() {
        let dir = TempDir::new().unwrap();
        let jobs = [
            BatchJob::new(write_model(dir.path(), "a.vrm")),
            BatchJob::new(write_model(dir.path(), "b.vrm")),
        ];
        let settings = settings_with_root(&dir.path().join("out"));

        let summary = run_batch(&jobs, &settings, &mut NoopReporter);

        assert!(summary.is_success());
        assert_eq!(summary.converted.len(), 2);
        assert!(dir.path().join("out/a/a.pmx").is_file());
        assert!(dir.path().join("out/b/b.pmx").is_file());
    }

    #[test]
    fn given_dry_run_when_running_batch_then_pmx_is_not_written() {
        let dir = TempDir::new().unwrap();
        let jobs = [BatchJob::new(write_model(dir.path(), "a.vrm"))];
        let settings = ConvertSettings {
            dry_run: true,
            ..settings_with_root(&dir.path().join("out"))
        };

        let summary = run_batch(&jobs, &settings, &mut NoopReporter);

        assert_eq!(summary.converted.len(), 1);
        assert!(!summary.converted[0].written);
        assert!(!dir.path().join("out/a/a.pmx").exists());
    }

    #[test]
    fn given_failure_with_fail_fast_when_running_batch_then_rest_is_skipped() {
        let dir = TempDir::new().unwrap();
        let jobs = [
            BatchJob::new(dir.path().join("missing.vrm")),
            BatchJob::new(write_model(dir.path(), "a.vrm")),
        ];
        let settings = ConvertSettings {
            fail_fast: true,
            ..settings_with_root(&dir.path().join("out"))
        };

        let summary = run_batch(&jobs, &settings, &mut NoopReporter);

        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.skipped, 1);
        assert!(summary.converted.is_empty());
        assert!(format!("{:#}", summary.failed[0].1).contains("input file not found"));
    }

    #[test]
    fn given_failure_without_fail_fast_when_running_batch_then_others_continue() {
        let dir = TempDir::new().unwrap();
        let jobs = [
            BatchJob::new(dir.path().join("wrong.txt")),
            BatchJob::new(write_model(dir.path(), "a.vrm")),
        ];

        let summary = run_batch(&jobs, &settings_with_root(&dir.path().join("out")), &mut NoopReporter);

        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.converted.len(), 1);
    }
}
