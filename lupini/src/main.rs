mod common;
mod data;
mod evaluate;
mod fit;

use evaluate::*;
use fit::*;

use clap::{Parser, Subcommand};
use log::info;

#[derive(Parser, Debug)]
#[command(
    version,
    about = "LUPINI",
    long_about = "Refined variational inference for Bayesian neural networks\n\
		  Fits a mean-field Bayesian MLP to tabular regression data,\n\
		  then sharpens its posterior with auxiliary-variable draws\n\
		  into an ensemble of refined members."
)]
struct Cli {
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Fit a base model and a refined ensemble",
        long_about = "Fit a Bayesian MLP and refine it in four stages:\n\
		      (1) Standardize features and outputs\n\
		      (2) Fit the base variational posterior by SGD\n\
		      (3) For each member, draw auxiliary variables and fine-tune\n\
		      (4) Score base and ensemble, write manifest.json\n"
    )]
    Fit(FitArgs),

    #[command(
        about = "Score a previously fitted ensemble",
        long_about = "Rebuild the model from manifest.json and report the\n\
		      ensemble log-likelihood and RMSE on new data as JSON.\n"
    )]
    Evaluate(EvaluateArgs),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.commands {
        Commands::Fit(args) => {
            fit_ensemble(args)?;
        }
        Commands::Evaluate(args) => {
            evaluate_ensemble(args)?;
        }
    }

    info!("Done");
    Ok(())
}
