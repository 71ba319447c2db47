use std::fs;
use std::io;
use std::path::PathBuf;
use std::thread;
use std::time::Instant;

use clap::Parser;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use thiserror::Error;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use psmrescore::normalize::NormalizationKind;
use psmrescore::{
    CrossValidationParams, DirectionSource, LabelClass, PsmDataset, RescoreEngine, RescoreError,
    RescoreOutcome, RescoreParams,
};

use crate::progress::ProgressRecord;
use crate::reader::{open_input, stream_records, InputError, InputRecord};
use crate::write::{open_output, read_initial_weights, write_collection, write_weights, WeightFileError};

/// How many parsed rows may queue between the reader thread and the
/// dataset builder.
const BUFFER_SIZE: usize = 2000;

fn fdr_value(s: &str) -> Result<f64, String> {
    let value = s.parse::<f64>().map_err(|e| e.to_string())?;
    if value > 0.0 && value <= 1.0 {
        Ok(value)
    } else {
        Err(format!("`{s}` is not within (0, 1]"))
    }
}

#[derive(Debug, Error)]
pub enum PsmRescorerError {
    #[error("An IO error occurred: {0}")]
    IOError(
        #[source]
        #[from]
        io::Error,
    ),
    #[error("Failed to read the input collection: {0}")]
    InputError(
        #[source]
        #[from]
        InputError,
    ),
    #[error("Failed to read the initial weights: {0}")]
    WeightFileError(
        #[source]
        #[from]
        WeightFileError,
    ),
    #[error("Failed to load the configuration: {0}")]
    ConfigError(
        #[source]
        #[from]
        Box<figment::Error>,
    ),
    #[error("Rescoring failed: {0}")]
    RescoreError(
        #[source]
        #[from]
        RescoreError,
    ),
}

/// Semi-supervised rescoring of peptide-spectrum matches.
///
/// Read a tab-separated feature table, learn a discriminant between targets
/// and decoys by cross-validated SVM training, and write out the rescored,
/// FDR-calibrated collection.
#[derive(Parser, Debug, Clone, Deserialize, Serialize)]
#[command(author, version)]
pub struct PsmRescorer {
    /// The path to read the feature table from, or if '-' is passed, read
    /// from STDIN. Gzip-compressed input is detected automatically.
    #[arg()]
    pub input_file: String,

    /// The path to write target PSM results to, or if '-' is passed, write
    /// to STDOUT. Paths ending in '.gz' are compressed.
    #[arg(short = 'r', long = "results-psms", default_value = "-")]
    pub results_psms: PathBuf,

    /// The path to write decoy PSM results to
    #[arg(short = 'B', long = "decoy-results-psms")]
    pub decoy_results_psms: Option<PathBuf>,

    /// The path to write target peptide results to
    #[arg(long = "results-peptides")]
    pub results_peptides: Option<PathBuf>,

    /// The path to write decoy peptide results to
    #[arg(long = "decoy-results-peptides")]
    pub decoy_results_peptides: Option<PathBuf>,

    /// The path to write the learned per-fold feature weights to
    #[arg(short = 'w', long = "weights")]
    pub weights_file: Option<PathBuf>,

    /// The path to read a bootstrap direction from, in the format written
    /// by --weights
    #[arg(short = 'W', long = "init-weights")]
    pub init_weights: Option<PathBuf>,

    /// The path to write a log file to, in addition to STDERR
    #[arg(short = 'l', long = "log-file")]
    pub log_file: Option<PathBuf>,

    /// A TOML configuration file to read additional parameters from.
    ///
    /// Configurations are also read from `psmrescorer.toml` in the working
    /// directory. Environment variables prefixed with `PSMRESCORER_` will
    /// be read too.
    #[arg(long = "config-file")]
    pub config_file: Option<PathBuf>,

    /// The FDR threshold admitting targets into the positive training set
    #[arg(short = 'F', long = "train-fdr", default_value_t = 0.01, value_parser = fdr_value)]
    pub train_fdr: f64,

    /// The FDR threshold used when counting and reporting positives
    #[arg(long = "test-fdr", default_value_t = 0.01, value_parser = fdr_value)]
    pub test_fdr: f64,

    /// The FDR threshold for the first labeling pass under the bootstrap
    /// direction, defaulting to the training FDR
    #[arg(long = "initial-fdr", value_parser = fdr_value)]
    pub initial_fdr: Option<f64>,

    /// The maximum number of training iterations
    #[arg(short = 'i', long = "maxiter", default_value_t = 10)]
    pub maxiter: usize,

    /// The cost of misclassified positive examples; when omitted it is
    /// found by cross-validation
    #[arg(long = "cpos")]
    pub cpos: Option<f64>,

    /// The cost of misclassified negative examples; when omitted it is
    /// found by cross-validation
    #[arg(long = "cneg")]
    pub cneg: Option<f64>,

    /// The number of cross-validation folds
    #[arg(
        long = "num-folds",
        default_value_t = 3,
        value_parser = clap::value_parser!(u32).range(2..),
    )]
    pub num_folds: u32,

    /// Calibrate the cost pair on the first fold only and reuse it for the
    /// remaining folds
    #[arg(short = 'Q', long = "quick-validation")]
    pub quick_validation: bool,

    /// Admit only the best-scoring target per spectrum into the positive
    /// training set
    #[arg(long = "train-best-positive")]
    pub train_best_positive: bool,

    /// Keep learned directions even when they perform worse than the
    /// bootstrap direction
    #[arg(long = "override-direction-check")]
    pub override_direction_check: bool,

    /// Report PSM-level results only, skipping the peptide-level rollup
    #[arg(short = 'U', long = "only-psms")]
    pub only_psms: bool,

    /// Skip estimating pi0, the fraction of incorrect targets, and leave
    /// q-values unscaled
    #[arg(long = "no-pi0")]
    pub no_pi0: bool,

    /// The seed for fold assignment and bootstrap resampling
    #[arg(short = 'S', long = "seed", default_value_t = 1)]
    pub seed: u64,

    /// Log the estimated positive count after every training iteration
    #[arg(long = "report-each-iteration")]
    pub report_each_iteration: bool,

    /// The number of threads to use, passing a value < 1 to use all
    /// available threads
    #[arg(short = 't', long = "threads", default_value_t = -1)]
    pub threads: i32,

    /// How much to log: 0 errors only, 1 warnings, 2 standard progress,
    /// 3 debugging detail, 4 everything
    #[arg(short = 'v', long = "verbosity", default_value_t = 2)]
    pub verbosity: u8,

    /// Scale features to the unit interval by their observed range instead
    /// of standardizing them
    #[arg(long = "unit-norm")]
    pub unit_norm: bool,

    /// Use feature values exactly as given, without any rescaling
    #[arg(long = "skip-feature-normalization")]
    pub skip_feature_normalization: bool,

    /// Leave per-fold scores on their native scales when merging the test
    /// collections
    #[arg(long = "skip-score-normalization")]
    pub skip_score_normalization: bool,
}

impl PsmRescorer {
    fn verbosity_filter(&self) -> EnvFilter {
        let level = match self.verbosity {
            0 => tracing::Level::ERROR,
            1 => tracing::Level::WARN,
            2 => tracing::Level::INFO,
            3 => tracing::Level::DEBUG,
            _ => tracing::Level::TRACE,
        };
        EnvFilter::builder()
            .with_default_directive(level.into())
            .from_env_lossy()
    }

    /// Install the global subscriber: a compact STDERR layer, plus a file
    /// layer when a log file was requested. `init` also installs the `log`
    /// bridge. The returned guard must stay alive until the process exits
    /// or buffered log lines are lost.
    pub fn init_logging(&self) -> Result<Option<WorkerGuard>, PsmRescorerError> {
        let stderr_layer = fmt::layer()
            .compact()
            .with_writer(io::stderr)
            .with_filter(self.verbosity_filter());
        let registry = tracing_subscriber::registry().with(stderr_layer);
        if let Some(path) = &self.log_file {
            let handle = fs::File::create(path)?;
            let (writer, guard) = tracing_appender::non_blocking(handle);
            registry
                .with(
                    fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer)
                        .with_filter(self.verbosity_filter()),
                )
                .init();
            Ok(Some(guard))
        } else {
            registry.init();
            Ok(None)
        }
    }

    fn create_threadpool(&self) -> rayon::ThreadPool {
        let num_threads = if self.threads > 0 {
            self.threads as usize
        } else {
            thread::available_parallelism().unwrap().into()
        };
        debug!("Using {} cores", num_threads);
        rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build()
            .unwrap()
    }

    pub fn main(&self) -> Result<(), PsmRescorerError> {
        info!(
            "psmrescorer v{}",
            option_env!("CARGO_PKG_VERSION").unwrap_or("unknown")
        );
        info!("Input: {}", self.input_file);
        info!("Output: {}", self.results_psms.display());
        if let Ok(rendered) = toml::to_string_pretty(self) {
            debug!("Configuration:\n{rendered}");
        }
        self.create_threadpool().install(|| self.run_workflow())
    }

    /// Read the input on a separate thread, feeding the dataset builder
    /// through a bounded channel.
    fn read_dataset(&self) -> Result<(PsmDataset, ProgressRecord), PsmRescorerError> {
        let (send, recv) = crossbeam_channel::bounded(BUFFER_SIZE);
        let path = self.input_file.clone();
        let read_task = thread::spawn(move || -> Result<usize, PsmRescorerError> {
            let stream = open_input(&path)?;
            let skipped = stream_records(stream, send)?;
            Ok(skipped)
        });

        let mut dataset: Option<PsmDataset> = None;
        let mut prog = ProgressRecord::default();
        let mut spectra = std::collections::HashSet::new();
        for record in recv {
            match record {
                InputRecord::Header { feature_names } => {
                    info!(
                        "Input carries {} features: {}",
                        feature_names.len(),
                        feature_names.join(", ")
                    );
                    dataset = Some(PsmDataset::new(feature_names));
                }
                InputRecord::DefaultDirection(weights) => {
                    debug!("Input carries a default direction: {weights:?}");
                    if let Some(dataset) = dataset.as_mut() {
                        dataset
                            .set_default_direction(weights)
                            .map_err(RescoreError::from)?;
                    }
                }
                InputRecord::Row {
                    psm,
                    label,
                    features,
                } => {
                    let dataset = dataset
                        .as_mut()
                        .expect("the reader always sends the header first");
                    match label {
                        LabelClass::Target => prog.target_psms += 1,
                        LabelClass::Decoy => prog.decoy_psms += 1,
                    }
                    if spectra.insert(psm.spectrum.key()) {
                        prog.spectra += 1;
                    }
                    dataset.push(psm, label, &features).map_err(RescoreError::from)?;
                }
            }
        }
        match read_task.join() {
            Ok(outcome) => prog.skipped_lines = outcome?,
            Err(e) => {
                warn!("Failed to join reader task: {e:?}");
            }
        }
        let dataset = dataset.ok_or(InputError::MissingHeader)?;
        Ok((dataset, prog))
    }

    fn build_params(&self) -> Result<RescoreParams, PsmRescorerError> {
        let initial_direction = match &self.init_weights {
            Some(path) => {
                let weights = read_initial_weights(io::BufReader::new(fs::File::open(path)?))?;
                info!("Bootstrapping from the weights in {}", path.display());
                Some(DirectionSource::InitialWeights(weights))
            }
            None => None,
        };
        let normalization = if self.skip_feature_normalization {
            NormalizationKind::Off
        } else if self.unit_norm {
            NormalizationKind::UnitRange
        } else {
            NormalizationKind::StandardDeviation
        };
        Ok(RescoreParams {
            crossval: CrossValidationParams {
                num_folds: self.num_folds as usize,
                max_iterations: self.maxiter,
                train_fdr: self.train_fdr,
                test_fdr: self.test_fdr,
                initial_fdr: self.initial_fdr.unwrap_or(self.train_fdr),
                cpos: self.cpos,
                cneg: self.cneg,
                quick_validation: self.quick_validation,
                train_best_positive: self.train_best_positive,
                report_each_iteration: self.report_each_iteration,
                seed: self.seed,
                ..Default::default()
            },
            normalization,
            skip_score_normalization: self.skip_score_normalization,
            use_pi0: !self.no_pi0,
            unique_peptides: !self.only_psms,
            override_direction_check: self.override_direction_check,
            initial_direction,
        })
    }

    fn write_outputs(&self, outcome: &RescoreOutcome) -> Result<(), PsmRescorerError> {
        let mut writer = open_output(&self.results_psms)?;
        let written = write_collection(&mut writer, &outcome.psms, LabelClass::Target)?;
        debug!(
            "Wrote {written} target PSMs to {}",
            self.results_psms.display()
        );
        if let Some(path) = &self.decoy_results_psms {
            let mut writer = open_output(path)?;
            write_collection(&mut writer, &outcome.psms, LabelClass::Decoy)?;
        }
        if let Some(peptides) = &outcome.peptides {
            if let Some(path) = &self.results_peptides {
                let mut writer = open_output(path)?;
                write_collection(&mut writer, peptides, LabelClass::Target)?;
            }
            if let Some(path) = &self.decoy_results_peptides {
                let mut writer = open_output(path)?;
                write_collection(&mut writer, peptides, LabelClass::Decoy)?;
            }
        }
        if let Some(path) = &self.weights_file {
            let mut writer = io::BufWriter::new(fs::File::create(path)?);
            write_weights(
                &mut writer,
                &outcome.feature_names,
                &outcome.weights,
                &outcome.raw_weights,
            )?;
        }
        Ok(())
    }

    fn run_workflow(&self) -> Result<(), PsmRescorerError> {
        let started = Instant::now();
        let (dataset, prog) = self.read_dataset()?;
        info!("Target PSMs: {}", prog.target_psms);
        info!("Decoy PSMs: {}", prog.decoy_psms);
        info!("Spectra: {}", prog.spectra);
        debug!("Read {} PSMs in total", prog.psms());
        if prog.skipped_lines > 0 {
            warn!("Skipped {} blank line(s) in the input", prog.skipped_lines);
        }
        let read_done = Instant::now();

        let params = self.build_params()?;
        let engine = RescoreEngine::new(params);
        let outcome = engine.run(dataset)?;
        info!(
            "Positives at FDR {}: {}",
            self.test_fdr, outcome.num_positives
        );
        if !self.no_pi0 {
            info!("Estimated pi0: {:0.4}", outcome.pi0);
        }
        for (fold, weights) in outcome.raw_weights.iter().enumerate() {
            debug!(
                "Fold {fold} raw weights: {}",
                outcome
                    .feature_names
                    .iter()
                    .map(String::as_str)
                    .chain(["m0"])
                    .zip(weights.values())
                    .map(|(name, w)| format!("{name}={w:0.4}"))
                    .join(", ")
            );
        }

        self.write_outputs(&outcome)?;

        let done = Instant::now();
        let elapsed = done - started;
        debug!("Reading took {:0.3?}", read_done - started);
        info!("Elapsed Time: {:0.3?}", elapsed);
        Ok(())
    }
}
