use std::{env, path::PathBuf, process};

use vrm2pmx::{
    LogReporter,
    batch::{BatchJob, run_batch},
    logging::{LogLevel, init_logging},
    notify::{failure_message, play_completion_cue},
    project::{ConvertSettings, load_settings},
};

const USAGE: &str = "Usage: vrm2pmx [-v] [-config <settings.json>] [-output-root <dir>] \
[-dry-run] [-fail-fast] (<input.vrm> [output.pmx] | -in <input.vrm> [-out <output.pmx>] | <input.vrm>...)";

#[derive(Debug, Default, PartialEq)]
struct CliArgs {
    inputs: Vec<PathBuf>,
    output: Option<PathBuf>,
    output_root: Option<String>,
    config: Option<PathBuf>,
    dry_run: bool,
    fail_fast: bool,
    log_level: LogLevel,
}

fn parse_args(args: &[String]) -> Result<CliArgs, String> {
    let mut cli = CliArgs::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let mut value = |flag: &str| {
            iter.next()
                .cloned()
                .ok_or_else(|| format!("missing value for {flag}"))
        };
        match arg.as_str() {
            "-in" => cli.inputs.push(PathBuf::from(value("-in")?)),
            "-out" => cli.output = Some(PathBuf::from(value("-out")?)),
            "-output-root" => cli.output_root = Some(value("-output-root")?),
            "-config" => cli.config = Some(PathBuf::from(value("-config")?)),
            "-dry-run" => cli.dry_run = true,
            "-fail-fast" => cli.fail_fast = true,
            "-v" => cli.log_level = cli.log_level.raised(),
            flag if flag.starts_with('-') => return Err(format!("unknown option: {flag}")),
            path => cli.inputs.push(PathBuf::from(path)),
        }
    }

    // `<input.vrm> <output.pmx>` keeps the single-model form.
    if cli.output.is_none()
        && cli.inputs.len() == 2
        && cli.inputs[1]
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pmx"))
    {
        cli.output = cli.inputs.pop();
    }
    if cli.inputs.is_empty() {
        return Err("no input model given".to_string());
    }
    if cli.output.is_some() && cli.inputs.len() > 1 {
        return Err("-out needs exactly one input".to_string());
    }
    Ok(cli)
}

fn main() {
    let args: Vec<String> = env::args().skip(1).collect();
    let cli = match parse_args(&args) {
        Ok(cli) => cli,
        Err(message) => {
            eprintln!("{message}\n{USAGE}");
            process::exit(2);
        }
    };
    init_logging(cli.log_level);

    match run(cli) {
        Ok(true) => play_completion_cue(),
        Ok(false) => process::exit(1),
        Err(err) => {
            eprintln!("{}", failure_message("Conversion failed", &format!("{err:#}")));
            process::exit(1);
        }
    }
}

fn run(cli: CliArgs) -> anyhow::Result<bool> {
    let mut settings = match &cli.config {
        Some(path) => load_settings(path)?,
        None => ConvertSettings::default(),
    };
    if cli.output_root.is_some() {
        settings.output_root = cli.output_root;
    }
    settings.dry_run |= cli.dry_run;
    settings.fail_fast |= cli.fail_fast;

    let jobs: Vec<BatchJob> = cli
        .inputs
        .into_iter()
        .map(|input| BatchJob {
            input,
            output: cli.output.clone(),
        })
        .collect();

    let summary = run_batch(&jobs, &settings, &mut LogReporter);

    for report in &summary.converted {
        println!("Model: {} (VRM {}, {})", report.model_name, report.vrm_version, report.profile);
        println!(
            "Bones: {} ({} renamed, {} inserted), Morphs: {} ({} renamed)",
            report.bone_count,
            report.renamed_bones.len(),
            report.inserted_bones,
            report.morph_count,
            report.renamed_morphs
        );
        println!(
            "Vertices: {}, Faces: {}, Materials: {}, Textures: {}",
            report.vertex_count, report.face_count, report.material_count, report.texture_count
        );
        let action = if report.written { "Written" } else { "Dry run" };
        println!("{action}: {}", report.output_path.display());
    }
    for (input, err) in &summary.failed {
        eprintln!(
            "{}",
            failure_message(&format!("Conversion failed: {}", input.display()), &format!("{err:#}"))
        );
    }
    if summary.skipped > 0 {
        eprintln!("Skipped {} model(s) after the first failure", summary.skipped);
    }
    Ok(summary.is_success())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn given_input_and_pmx_when_parsing_then_second_path_is_output() {
        let cli = parse_args(&args(&["a.vrm", "b.pmx"])).unwrap();

        assert_eq!(cli.inputs, vec![PathBuf::from("a.vrm")]);
        assert_eq!(cli.output, Some(PathBuf::from("b.pmx")));
    }

    #[test]
    fn given_flags_when_parsing_then_settings_are_collected() {
        let cli = parse_args(&args(&[
            "-v", "-v", "-dry-run", "-fail-fast", "-output-root", "out", "-in", "a.vrm", "b.vrm",
        ]))
        .unwrap();

        assert_eq!(cli.inputs.len(), 2);
        assert_eq!(cli.output_root.as_deref(), Some("out"));
        assert!(cli.dry_run && cli.fail_fast);
        assert_eq!(cli.log_level, LogLevel::Debug);
    }

    #[test]
    fn given_bad_arguments_when_parsing_then_usage_error_is_returned() {
        assert!(parse_args(&[]).is_err());
        assert!(parse_args(&args(&["-bogus", "a.vrm"])).is_err());
        assert!(parse_args(&args(&["-out"])).is_err());
        assert!(parse_args(&args(&["a.vrm", "b.vrm", "-out", "c.pmx"])).is_err());
    }
}
