//! Top-level application orchestration.
//!
//! `src/main.rs` only sets up logging; this module is the "real main" that
//! parses arguments, loads the config, runs the pipeline and writes outputs.

use clap::Parser;
use tracing::info;

use crate::cli::{CheckArgs, Command, MockCatalogArgs, RunArgs};
use crate::config::RunConfig;
use crate::data::{MockCatalogSpec, mock_catalog};
use crate::error::CovError;
use crate::io::{CatalogColumns, ExportOptions, write_catalog, write_outputs};

pub mod pipeline;

/// Entry point for the `lsscov` binary.
pub fn run() -> Result<(), CovError> {
    let cli = crate::cli::Cli::parse();
    match cli.command {
        Command::Run(args) => handle_run(args),
        Command::Check(args) => handle_check(args),
        Command::MockCatalog(args) => handle_mock_catalog(args),
    }
}

/// Config file plus command-line overrides.
pub fn run_config_from_args(args: &RunArgs) -> Result<RunConfig, CovError> {
    let mut config = crate::config::load(&args.config)?;
    if let Some(cores) = args.cores {
        config.num_cores = cores;
    }
    if let Some(dir) = &args.output {
        config.output.dir = dir.clone();
    }
    config.diagnostics.check_psd |= args.check_psd;
    config.output.cells |= args.cells;
    config.validate()?;
    Ok(config)
}

fn handle_run(args: RunArgs) -> Result<(), CovError> {
    let config = run_config_from_args(&args)?;
    info!(config = %args.config.display(), cores = config.num_cores, "starting run");
    let run = pipeline::run_covariance(&config)?;

    let options = ExportOptions {
        correlation: config.output.correlation,
        cells: config.output.cells,
    };
    let written = write_outputs(&config.output.dir, &run.covariance, Some(&run.spectra), &run.summary, options)?;
    println!("{}", crate::report::format_run_summary(&run.summary, &written));
    Ok(())
}

fn handle_check(args: CheckArgs) -> Result<(), CovError> {
    let config = crate::config::load(&args.config)?;
    let combinator = pipeline::plan(&config)?;
    let segments = pipeline::segment_summaries(&combinator);
    let columns: Vec<&str> = config.terms.columns().iter().map(|k| k.column_name()).collect();
    println!("Config OK: {}", args.config.display());
    println!(
        "Observables: {}",
        config
            .active_observables()
            .iter()
            .map(|k| format!("{} ({})", k.display_name(), config.statistics.kind_for(*k).display_name()))
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!("Terms: {}", if columns.is_empty() { "none".to_string() } else { columns.join(", ") });
    println!("Blocks: {}", combinator.blocks().len());
    print!("{}", crate::report::format_layout(&segments, combinator.dimension()));
    Ok(())
}

fn mock_spec_from_args(args: &MockCatalogArgs) -> Result<MockCatalogSpec, CovError> {
    let range = |v: &[f64], what: &str| match v {
        [lo, hi] => Ok((*lo, *hi)),
        _ => Err(CovError::config(format!("--{what} takes exactly two values."))),
    };
    Ok(MockCatalogSpec {
        geometry: args.geometry,
        x_range: range(&args.x_range, "x-range")?,
        y_range: range(&args.y_range, "y-range")?,
        points: args.points,
        bins: args.bins,
        holes: args.holes,
        hole_radius_deg: args.hole_radius,
        weight_scatter: args.weight_scatter,
        seed: args.seed,
    })
}

fn handle_mock_catalog(args: MockCatalogArgs) -> Result<(), CovError> {
    let spec = mock_spec_from_args(&args)?;
    let catalog = mock_catalog(&spec)?;
    write_catalog(&args.output, &CatalogColumns::default(), &catalog.points)?;
    println!("Wrote {} points to {}", catalog.points.len(), args.output.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::cli::Cli;

    #[test]
    fn command_line_overrides_the_config_file() {
        let dir = std::env::temp_dir().join(format!("lsscov_app_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("run.json");
        std::fs::write(
            &path,
            r#"{ "samples": { "lensing": { "mock_means": [0.6], "n_eff": [5], "sigma_e": [0.27] } }, "num_cores": 2 }"#,
        )
        .unwrap();

        let args = RunArgs {
            config: path,
            cores: Some(3),
            output: Some(PathBuf::from("elsewhere")),
            check_psd: true,
            cells: false,
        };
        let config = run_config_from_args(&args).unwrap();
        assert_eq!(config.num_cores, 3);
        assert_eq!(config.output.dir, PathBuf::from("elsewhere"));
        assert!(config.diagnostics.check_psd);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_config_is_an_io_error() {
        let args = RunArgs {
            config: PathBuf::from("/nonexistent/lsscov.json"),
            cores: None,
            output: None,
            check_psd: false,
            cells: false,
        };
        let err = run_config_from_args(&args).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn mock_catalog_arguments_become_a_spec() {
        let cli = Cli::parse_from(["lsscov", "mock-catalog", "-o", "cat.csv", "--points", "10", "--holes", "2"]);
        let Command::MockCatalog(args) = cli.command else {
            panic!("expected mock-catalog");
        };
        let spec = mock_spec_from_args(&args).unwrap();
        assert_eq!(spec.points, 10);
        assert_eq!(spec.holes, 2);
        assert_eq!(spec.x_range, (0.0, 10.0));
    }
}
