use candle_core::Tensor;
use log::debug;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::bayes_mlp::BayesianMlp;
use crate::checkpoint::Checkpoint;
use crate::context::ExecutionContext;
use crate::likelihood::{log_mean_exp, mean_squared_error};
use crate::refine::gaussian_param::to_host;

/// Predictive quality of an ensemble whose members are averaged.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EnsembleMetrics {
    pub members: usize,
    /// mean over examples of log (1/M) Σ_m p_m(y|x)
    pub log_likelihood: f64,
    /// RMSE of the member-averaged predictive mean
    pub rmse: f64,
    /// mean per-member log-likelihood
    pub member_log_likelihood: f64,
}

/// Score an ensemble on `(x_nd, y_n1)` with one stochastic pass per
/// member. With no `weight_files` the live weights form a one-member
/// ensemble; otherwise each file is loaded into `model` in turn and the
/// last one stays loaded.
pub fn ensemble_metrics(
    model: &mut BayesianMlp,
    ctx: &mut ExecutionContext,
    x_nd: &Tensor,
    y_n1: &Tensor,
    weight_files: &[PathBuf],
) -> anyhow::Result<EnsembleMetrics> {
    let mut llik_vec = vec![];
    let mut loc_vec = vec![];

    if weight_files.is_empty() {
        let (llik_n, pred) = model.log_likelihood(x_nd, y_n1, ctx)?;
        llik_vec.push(llik_n);
        loc_vec.push(pred.loc_n1);
    }

    for path in weight_files {
        debug!("scoring {:?}", path);
        model.load(path)?;
        let (llik_n, pred) = model.log_likelihood(x_nd, y_n1, ctx)?;
        llik_vec.push(llik_n);
        loc_vec.push(pred.loc_n1);
    }

    let llik_mn = Tensor::stack(&llik_vec, 0)?;
    let loc_n1 = Tensor::stack(&loc_vec, 0)?.mean(0)?;

    let log_likelihood = to_host(&log_mean_exp(&llik_mn)?.mean_all()?)?[0];
    let member_log_likelihood = to_host(&llik_mn.mean_all()?)?[0];
    let mse = to_host(&mean_squared_error(y_n1, &loc_n1)?)?[0];

    Ok(EnsembleMetrics {
        members: llik_vec.len(),
        log_likelihood,
        rmse: mse.sqrt(),
        member_log_likelihood,
    })
}
