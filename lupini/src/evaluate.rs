use crate::common::*;
use crate::data::Matrix;

use bnn_util::bayes_mlp::BayesianMlp;
use bnn_util::context::ExecutionContext;
use bnn_util::metrics::ensemble_metrics;
use clap::Args;
use log::info;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct EvaluateArgs {
    #[arg(
        long,
        short,
        required = true,
        help = "Output directory of a previous `fit`",
        long_help = "Directory holding manifest.json and models/\n\
		     written by `lupini fit`."
    )]
    out: Box<str>,

    #[arg(long, required = true, help = "Features to score")]
    x: Box<str>,

    #[arg(long, required = true, help = "Outputs to score")]
    y: Box<str>,

    #[arg(
        long,
        default_value_t = false,
        help = "Score the base model instead of the ensemble"
    )]
    base_only: bool,

    #[arg(long, default_value_t = 0, help = "Random seed")]
    seed: u64,

    #[arg(long, value_enum, default_value = "cpu", help = "Candle device")]
    device: ComputeDevice,

    #[arg(long, short, default_value_t = false, help = "Verbose logging")]
    verbose: bool,
}

pub fn evaluate_ensemble(args: &EvaluateArgs) -> anyhow::Result<()> {
    init_logger(args.verbose);

    let out_dir = PathBuf::from(args.out.as_ref());
    let manifest = Manifest::read(&out_dir.join(MANIFEST_FILE))?;

    let dev = select_device(&args.device);
    let mut ctx = ExecutionContext::new(dev, manifest.training.precision.dtype(), args.seed);

    let x = Matrix::from_file(&args.x)?;
    let y = Matrix::from_file(&args.y)?;
    let data = manifest.standardizer.regression_data(&x, &y, &ctx)?;

    let mut model = BayesianMlp::new(manifest.model.clone(), &mut ctx)?;
    let files = if args.base_only {
        let base = match manifest.base_model.file_name() {
            Some(name) if !manifest.base_model.exists() => out_dir.join("models").join(name),
            _ => manifest.base_model.clone(),
        };
        vec![base]
    } else {
        manifest.member_files(&out_dir)
    };
    if files.is_empty() {
        anyhow::bail!("no ensemble members recorded in {:?}", out_dir);
    }
    info!("Scoring {} checkpoint(s)", files.len());

    let metrics = ensemble_metrics(&mut model, &mut ctx, &data.x_nd, &data.y_n1, &files)?;
    println!("{}", serde_json::to_string_pretty(&metrics)?);
    Ok(())
}
