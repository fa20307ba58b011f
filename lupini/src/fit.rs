use crate::common::*;
use crate::data::{split_rows, Matrix, Standardizer};

use bnn_util::bayes_dense::MeanFieldInit;
use bnn_util::bayes_mlp::{BayesianMlp, MlpShape};
use bnn_util::checkpoint::{checkpoint_digest, digest_hex, Checkpoint};
use bnn_util::context::{CancelToken, ExecutionContext};
use bnn_util::refine::{
    EnsembleRefinementController, MemberSeeding, NumericFailurePolicy, RefinementConfig,
};
use bnn_util::trainer::{ElboTrainer, FineTune, RegressionData, TrainConfig};
use clap::{Args, ValueEnum};
use log::{info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::Duration;

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq)]
#[clap(rename_all = "lowercase")]
pub enum FailurePolicyArg {
    Abort,
    Skip,
}

#[derive(Args, Debug)]
pub struct FitArgs {
    #[arg(
        long,
        required = true,
        help = "Training features",
        long_help = "Training feature matrix (rows = examples).\n\
		     Comma, tab or space separated; `.gz` is decompressed.\n\
		     Lines starting with `#` are skipped; a non-numeric\n\
		     first line is taken as a header."
    )]
    x_train: Box<str>,

    #[arg(
        long,
        required = true,
        help = "Training outputs",
        long_help = "Training output column, one row per example,\n\
		     same format as the feature file."
    )]
    y_train: Box<str>,

    #[arg(
        long,
        requires = "y_test",
        help = "Test features",
        long_help = "Held-out feature matrix. Without it, a random\n\
		     `--test-fraction` of the training rows is held out."
    )]
    x_test: Option<Box<str>>,

    #[arg(long, requires = "x_test", help = "Test outputs")]
    y_test: Option<Box<str>>,

    #[arg(
        long,
        default_value_t = 0.1,
        help = "Held-out fraction without test files",
        long_help = "Fraction of training rows held out for testing when\n\
		     no test files are given (0 disables testing)."
    )]
    test_fraction: f64,

    #[arg(
        long,
        short,
        required = true,
        help = "Output directory",
        long_help = "Output directory. Written files:\n\
		     - {out}/models/base_model.safetensors\n\
		     - {out}/models/ensemble_component_{i}.safetensors\n\
		     - {out}/manifest.json"
    )]
    out: Box<str>,

    #[arg(long, default_value_t = 30000, help = "Base training steps")]
    training_steps: usize,

    #[arg(long, default_value_t = 256, help = "Minibatch size")]
    batch_size: usize,

    #[arg(long, default_value_t = 1e-3, help = "Base learning rate")]
    learning_rate: f64,

    #[arg(
        long,
        default_value_t = 1e-5,
        help = "Learning rate while refining",
        long_help = "Learning rate of the fine-tuning passes between\n\
		     refinement rounds. Round j uses\n\
		     lr * sqrt(1 - ratio)^j."
    )]
    learning_rate_for_sampling: f64,

    #[arg(
        long,
        default_value_t = 100,
        help = "Fine-tuning steps per refinement round",
        long_help = "Fine-tuning steps after each refinement round.\n\
		     0 refines without any fine-tuning."
    )]
    auxiliary_sampling_frequency: usize,

    #[arg(
        long,
        default_value_t = 0.7,
        help = "Auxiliary variance ratio in [0, 1]",
        long_help = "Fraction of the prior variance assigned to each\n\
		     sampled auxiliary variable. 0 leaves the posterior\n\
		     unchanged; 1 collapses it onto the draw."
    )]
    aux_variance_ratio: f64,

    #[arg(long, default_value_t = 5, help = "Refinement rounds per member")]
    n_auxiliary_variables: usize,

    #[arg(long, default_value_t = 10, help = "Number of ensemble members")]
    ensemble_size: usize,

    #[arg(
        long,
        default_value_t = -7.0,
        allow_negative_numbers = true,
        help = "Initial pre-softplus posterior scale"
    )]
    init_untransformed_scale: f64,

    #[arg(long, default_value_t = 50, help = "Hidden units")]
    hidden_units: usize,

    #[arg(
        long,
        default_value_t = false,
        help = "Keep the prior scale fixed",
        long_help = "Do not learn the prior scale before refinement\n\
		     (empirical Bayes is on by default)."
    )]
    no_empirical_bayes: bool,

    #[arg(
        long,
        default_value_t = 5,
        help = "Steps between logged metrics (verbose)"
    )]
    validation_freq: usize,

    #[arg(long, default_value_t = 0, help = "Random seed")]
    seed: u64,

    #[arg(
        long,
        default_value_t = false,
        help = "Use the same seed for every member",
        long_help = "Seed every member identically instead of with\n\
		     seed + member index. Members then coincide."
    )]
    shared_seed: bool,

    #[arg(
        long,
        value_enum,
        default_value = "abort",
        help = "On non-finite weights: abort or skip the member"
    )]
    on_numeric_failure: FailurePolicyArg,

    #[arg(
        long,
        default_value_t = false,
        help = "Also train the base model further for comparison",
        long_help = "Train the base model for\n\
		     n_auxiliary_variables x auxiliary_sampling_frequency x ensemble_size\n\
		     more steps and report its metrics next to the ensemble."
    )]
    compare_overtrained: bool,

    #[arg(long, value_enum, default_value = "cpu", help = "Candle device")]
    device: ComputeDevice,

    #[arg(long, value_enum, default_value = "f32", help = "Floating point precision")]
    precision: Precision,

    #[arg(
        long,
        help = "Stop generating members after this many seconds",
        long_help = "Time limit for ensemble generation. Members finished\n\
		     by then are kept; the member in progress is dropped."
    )]
    time_limit_secs: Option<u64>,

    #[arg(long, default_value_t = false, help = "Show progress bars")]
    show_progress: bool,

    #[arg(long, short, default_value_t = false, help = "Verbose logging")]
    verbose: bool,
}

impl FitArgs {
    fn refinement_config(&self, model_dir: &Path) -> RefinementConfig {
        RefinementConfig {
            aux_variance_ratio: self.aux_variance_ratio,
            n_auxiliary_variables: self.n_auxiliary_variables,
            ensemble_size: self.ensemble_size,
            auxiliary_sampling_frequency: self.auxiliary_sampling_frequency,
            learning_rate_for_sampling: self.learning_rate_for_sampling,
            seed: self.seed,
            member_seeding: if self.shared_seed {
                MemberSeeding::Shared
            } else {
                MemberSeeding::Distinct
            },
            on_numeric_failure: match self.on_numeric_failure {
                FailurePolicyArg::Abort => NumericFailurePolicy::Abort,
                FailurePolicyArg::Skip => NumericFailurePolicy::Skip,
            },
            output_dir: model_dir.to_path_buf(),
        }
    }
}

struct LoadedData {
    standardizer: Standardizer,
    train: RegressionData,
    test: Option<RegressionData>,
}

fn load_data(args: &FitArgs, ctx: &ExecutionContext) -> anyhow::Result<LoadedData> {
    let x = Matrix::from_file(&args.x_train)?;
    let y = Matrix::from_file(&args.y_train)?;
    if x.nrows != y.nrows {
        anyhow::bail!("X has {} rows but Y has {}", x.nrows, y.nrows);
    }

    let (x_train, y_train, test) = match (&args.x_test, &args.y_test) {
        (Some(xt), Some(yt)) => (x, y, Some((Matrix::from_file(xt)?, Matrix::from_file(yt)?))),
        _ => {
            if !(0.0..1.0).contains(&args.test_fraction) {
                anyhow::bail!("test fraction must be in [0, 1): {}", args.test_fraction);
            }
            let mut rng = StdRng::seed_from_u64(args.seed);
            let (train_rows, test_rows) = split_rows(x.nrows, args.test_fraction, &mut rng);
            let test = if test_rows.is_empty() {
                None
            } else {
                Some((x.select_rows(&test_rows), y.select_rows(&test_rows)))
            };
            (x.select_rows(&train_rows), y.select_rows(&train_rows), test)
        }
    };

    let standardizer = Standardizer::fit(&x_train, &y_train)?;
    let train = standardizer.regression_data(&x_train, &y_train, ctx)?;
    let test = match test {
        Some((xt, yt)) => Some(standardizer.regression_data(&xt, &yt, ctx)?),
        None => None,
    };

    info!(
        "{} training and {} test examples, {} features",
        train.num_rows(),
        test.as_ref().map(|t| t.num_rows()).unwrap_or(0),
        x_train.ncols
    );

    Ok(LoadedData {
        standardizer,
        train,
        test,
    })
}

pub fn fit_ensemble(args: &FitArgs) -> anyhow::Result<()> {
    init_logger(args.verbose);

    let out_dir = PathBuf::from(args.out.as_ref());
    let model_dir = out_dir.join("models");
    std::fs::create_dir_all(&model_dir)?;

    // 0. Reject a bad configuration before any training
    let controller = EnsembleRefinementController::new(args.refinement_config(&model_dir))?
        .with_progress(args.show_progress && !args.verbose);

    let cancel = match args.time_limit_secs {
        Some(secs) => CancelToken::new().with_time_limit(Duration::from_secs(secs)),
        None => CancelToken::new(),
    };
    {
        let stop = cancel.flag();
        ctrlc::set_handler(move || {
            info!("Interrupt received: stopping at the next training step...");
            stop.store(true, Ordering::SeqCst);
        })?;
    }
    let controller = controller.with_cancel_token(cancel.clone());

    let dev = select_device(&args.device);
    let mut ctx = ExecutionContext::new(dev, args.precision.dtype(), args.seed);

    // 1-2. Data and standardization
    let LoadedData {
        standardizer,
        train,
        test,
    } = load_data(args, &ctx)?;

    // 3. Base variational fit
    let shape = MlpShape {
        input_dim: train.x_nd.dims()[1],
        hidden_units: args.hidden_units,
        output_scaler: standardizer.output_scaler(),
        init: MeanFieldInit {
            empirical_bayes: !args.no_empirical_bayes,
            posterior_untransformed_scale: args.init_untransformed_scale,
        },
    };
    let mut model = BayesianMlp::new(shape.clone(), &mut ctx)?;

    let mut trainer = ElboTrainer::new(
        train,
        test,
        TrainConfig {
            batch_size: args.batch_size,
            validation_freq: args.validation_freq,
            show_progress: args.show_progress,
            verbose: args.verbose,
        },
    )?
    .with_cancel_token(cancel.clone());

    info!("Training the base model for {} steps", args.training_steps);
    let base_report =
        trainer.fine_tune(&mut model, &mut ctx, args.learning_rate, args.training_steps)?;
    info!("base model loss: {:.4}", base_report.loss);
    if base_report.steps < args.training_steps {
        warn!(
            "base model stopped after {}/{} steps; no ensemble members will be refined",
            base_report.steps, args.training_steps
        );
    }

    let base_path = model_dir.join("base_model.safetensors");
    model.save(&base_path)?;
    let base_digest = digest_hex(checkpoint_digest(&base_path)?);
    info!("Saved {:?}", base_path);

    // 4. Base metrics
    let base = split_metrics(&mut model, &mut ctx, &trainer, &[])?;

    // 5. Overtrained comparison
    let overtrained = if args.compare_overtrained && !cancel.is_cancelled() {
        let steps =
            args.n_auxiliary_variables * args.auxiliary_sampling_frequency * args.ensemble_size;
        info!("Training the base model {} steps further for comparison", steps);
        trainer.fine_tune(&mut model, &mut ctx, args.learning_rate, steps)?;
        let metrics = split_metrics(&mut model, &mut ctx, &trainer, &[])?;
        model.load(&base_path)?;
        Some(metrics)
    } else {
        None
    };

    // 6. Refinement
    let ensemble = controller.run(&mut model, &base_path, &mut trainer, &mut ctx)?;
    ensemble.write_json(&model_dir.join("ensemble.json"))?;

    // 7. Ensemble metrics and manifest
    let files = ensemble.paths();
    let auxiliary = if files.is_empty() {
        None
    } else {
        Some(split_metrics(&mut model, &mut ctx, &trainer, &files)?)
    };

    let metrics = MetricGroups {
        base,
        overtrained,
        auxiliary,
    };
    metrics.log();

    let manifest = Manifest {
        training: TrainingSummary {
            training_steps: args.training_steps,
            batch_size: args.batch_size,
            learning_rate: args.learning_rate,
            seed: args.seed,
            precision: args.precision,
        },
        refinement: controller.config().clone(),
        model: shape,
        standardizer,
        base_model: base_path,
        base_digest,
        ensemble,
        metrics,
    };
    let manifest_path = out_dir.join(MANIFEST_FILE);
    manifest.write(&manifest_path)?;
    info!("Wrote {:?}", manifest_path);
    Ok(())
}
