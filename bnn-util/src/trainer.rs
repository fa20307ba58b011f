use candle_core::Tensor;
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::info;
use serde::{Deserialize, Serialize};

use crate::bayes_mlp::{BayesianMlp, ModelMetrics};
use crate::context::{CancelToken, ExecutionContext};
use crate::error::RefineError;
use crate::refine::gaussian_param::to_host;

/// Supervised fine-tuning collaborator of the ensemble controller.
pub trait FineTune<M> {
    /// Take `steps` optimizer steps on `model` with `learning_rate`.
    fn fine_tune(
        &mut self,
        model: &mut M,
        ctx: &mut ExecutionContext,
        learning_rate: f64,
        steps: usize,
    ) -> anyhow::Result<FineTuneReport>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ValidationMetrics {
    pub log_likelihood: f64,
    pub rmse: f64,
}

/// Last metrics seen during a fine-tuning pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FineTuneReport {
    pub steps: usize,
    pub learning_rate: f64,
    pub loss: f64,
    pub train: ModelMetrics,
    pub validation: Option<ValidationMetrics>,
}

/// Features `(n, d)` and targets `(n, 1)` in the model dtype and device
pub struct RegressionData {
    pub x_nd: Tensor,
    pub y_n1: Tensor,
}

impl RegressionData {
    pub fn new(x_nd: Tensor, y_n1: Tensor) -> anyhow::Result<Self> {
        let (n, _) = x_nd.dims2()?;
        let (ny, k) = y_n1.dims2()?;
        if n == 0 || n != ny || k != 1 {
            return Err(RefineError::invalid(format!(
                "need n > 0 rows of X {:?} and Y {:?} with one output column",
                x_nd.dims(),
                y_n1.dims()
            ))
            .into());
        }
        Ok(Self { x_nd, y_n1 })
    }

    pub fn num_rows(&self) -> usize {
        self.x_nd.dims()[0]
    }
}

pub struct TrainConfig {
    pub batch_size: usize,
    /// log training and validation metrics every this many steps
    /// when verbose (0: never)
    pub validation_freq: usize,
    pub show_progress: bool,
    pub verbose: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            batch_size: 256,
            validation_freq: 5,
            show_progress: false,
            verbose: false,
        }
    }
}

/// Minibatch ELBO optimization with Adam (no weight decay).
///
/// A fresh optimizer is created for every call, over the variables
/// that are trainable at that moment; frozen priors are left out.
/// A pass stops early once the cancel token fires.
pub struct ElboTrainer {
    train: RegressionData,
    validation: Option<RegressionData>,
    config: TrainConfig,
    cancel: CancelToken,
}

impl ElboTrainer {
    pub fn new(
        train: RegressionData,
        validation: Option<RegressionData>,
        config: TrainConfig,
    ) -> anyhow::Result<Self> {
        if config.batch_size == 0 {
            return Err(RefineError::invalid("batch size must be positive").into());
        }
        Ok(Self {
            train,
            validation,
            config,
            cancel: CancelToken::new(),
        })
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn n_train(&self) -> usize {
        self.train.num_rows()
    }

    pub fn train_data(&self) -> &RegressionData {
        &self.train
    }

    pub fn validation_data(&self) -> Option<&RegressionData> {
        self.validation.as_ref()
    }

    fn minibatch(&self, ctx: &mut ExecutionContext) -> candle_core::Result<(Tensor, Tensor)> {
        let ntot = self.train.num_rows();
        let nb = self.config.batch_size;
        let idx = ctx.sample_indices(ntot, nb);
        let idx = Tensor::from_vec(idx, nb, self.train.x_nd.device())?;
        Ok((
            self.train.x_nd.index_select(&idx, 0)?,
            self.train.y_n1.index_select(&idx, 0)?,
        ))
    }

    fn validate(
        &self,
        model: &BayesianMlp,
        ctx: &mut ExecutionContext,
    ) -> anyhow::Result<Option<ValidationMetrics>> {
        let Some(data) = &self.validation else {
            return Ok(None);
        };
        let m = model.metrics(&data.x_nd, &data.y_n1, self.n_train(), ctx)?;
        Ok(Some(ValidationMetrics {
            log_likelihood: m.log_likelihood,
            rmse: m.mse.sqrt(),
        }))
    }
}

impl FineTune<BayesianMlp> for ElboTrainer {
    fn fine_tune(
        &mut self,
        model: &mut BayesianMlp,
        ctx: &mut ExecutionContext,
        learning_rate: f64,
        steps: usize,
    ) -> anyhow::Result<FineTuneReport> {
        let n_train = self.n_train();
        let mut adam = AdamW::new(
            model.trainable_vars(),
            ParamsAdamW {
                lr: learning_rate,
                weight_decay: 0.0,
                ..Default::default()
            },
        )?;

        let pb = ProgressBar::new(steps as u64);
        if !self.config.show_progress || self.config.verbose {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }

        let mut loss_val = f64::NAN;
        let mut last_batch = None;
        let mut taken = 0;
        let freq = self.config.validation_freq;

        for step in 0..steps {
            if self.cancel.is_cancelled() {
                info!("stopped after {}/{} steps", step, steps);
                break;
            }
            let (x_bd, y_b1) = self.minibatch(ctx)?;
            let loss = model.loss(&x_bd, &y_b1, n_train, ctx)?;
            loss_val = to_host(&loss)?[0];
            if !loss_val.is_finite() {
                return Err(RefineError::non_finite("loss").into());
            }
            adam.backward_step(&loss)?;
            pb.inc(1);

            if self.config.verbose && freq > 0 && (step + 1) % freq == 0 {
                let m = model.metrics(&x_bd, &y_b1, n_train, ctx)?;
                match self.validate(model, ctx)? {
                    Some(v) => info!(
                        "[{}/{}] loss = {:.4}, ELBO = {:.4}, llik = {:.4}, \
                         valid llik = {:.4}, rmse = {:.4}",
                        step + 1,
                        steps,
                        loss_val,
                        m.elbo,
                        m.log_likelihood,
                        v.log_likelihood,
                        v.rmse
                    ),
                    None => info!(
                        "[{}/{}] loss = {:.4}, ELBO = {:.4}, llik = {:.4}",
                        step + 1,
                        steps,
                        loss_val,
                        m.elbo,
                        m.log_likelihood
                    ),
                }
            }
            last_batch = Some((x_bd, y_b1));
            taken = step + 1;
        }
        pb.finish_and_clear();

        let (x_bd, y_b1) = match last_batch {
            Some(batch) => batch,
            None => self.minibatch(ctx)?,
        };
        let report_train = model.metrics(&x_bd, &y_b1, n_train, ctx)?;
        if taken == 0 {
            let kl = report_train.kl - model.kl_cost();
            loss_val = -report_train.log_likelihood + kl / n_train as f64;
        }
        let report_valid = self.validate(model, ctx)?;

        Ok(FineTuneReport {
            steps: taken,
            learning_rate,
            loss: loss_val,
            train: report_train,
            validation: report_valid,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bayes_dense::MeanFieldInit;
    use crate::bayes_mlp::MlpShape;
    use candle_core::DType;

    fn toy(ctx: &mut ExecutionContext, n: usize) -> anyhow::Result<RegressionData> {
        let x = ctx.randn(0.0, 1.0, (n, 2))?;
        let noise = ctx.randn(0.0, 0.1, (n, 1))?;
        let y = ((x.narrow(1, 0, 1)? * 1.5)? + noise)?;
        RegressionData::new(x, y)
    }

    fn model(ctx: &mut ExecutionContext) -> anyhow::Result<BayesianMlp> {
        BayesianMlp::new(
            MlpShape {
                input_dim: 2,
                hidden_units: 16,
                output_scaler: 1.0,
                init: MeanFieldInit::default(),
            },
            ctx,
        )
    }

    #[test]
    fn test_training_improves_fit() -> anyhow::Result<()> {
        let mut ctx = ExecutionContext::cpu(DType::F32, 17);
        let train = toy(&mut ctx, 200)?;
        let valid = toy(&mut ctx, 50)?;
        let mut m = model(&mut ctx)?;

        let config = TrainConfig {
            batch_size: 32,
            validation_freq: 10,
            ..Default::default()
        };
        let mut trainer = ElboTrainer::new(train, Some(valid), config)?;

        let before = trainer.fine_tune(&mut m, &mut ctx, 1e-2, 0)?;
        let after = trainer.fine_tune(&mut m, &mut ctx, 1e-2, 300)?;

        assert_eq!(after.steps, 300);
        assert!(after.loss.is_finite());
        let (b, a) = (before.validation.unwrap(), after.validation.unwrap());
        assert!(a.rmse < b.rmse, "rmse {} -> {}", b.rmse, a.rmse);
        Ok(())
    }

    #[test]
    fn test_frozen_priors_do_not_move() -> anyhow::Result<()> {
        let mut ctx = ExecutionContext::cpu(DType::F32, 2);
        let train = toy(&mut ctx, 64)?;
        let mut m = model(&mut ctx)?;
        let mut trainer = ElboTrainer::new(train, None, TrainConfig::default())?;

        use crate::refine::RefinableModel;
        for layer in m.layers_mut() {
            for w in layer.weight_tensors_mut() {
                w.pair.prior.freeze();
            }
        }
        let first_prior_scale = |m: &BayesianMlp| {
            let w = m.layers()[0].weight_tensors().next().unwrap();
            to_host(w.pair.prior.untransformed_scale())
        };
        let prior_before = first_prior_scale(&m)?;
        trainer.fine_tune(&mut m, &mut ctx, 1e-2, 20)?;
        let prior_after = first_prior_scale(&m)?;
        assert_eq!(prior_before, prior_after);
        Ok(())
    }

    #[test]
    fn test_cancelled_pass_takes_no_steps() -> anyhow::Result<()> {
        use crate::refine::RefinableLayer;
        let mut ctx = ExecutionContext::cpu(DType::F32, 3);
        let train = toy(&mut ctx, 64)?;
        let mut m = model(&mut ctx)?;

        let cancel = CancelToken::new();
        let mut trainer = ElboTrainer::new(train, None, TrainConfig::default())?
            .with_cancel_token(cancel.clone());

        let partial = trainer.fine_tune(&mut m, &mut ctx, 1e-2, 5)?;
        assert_eq!(partial.steps, 5);

        cancel.cancel();
        let loc_before = to_host(m.layers()[1].kernel().pair.posterior.loc())?;
        let report = trainer.fine_tune(&mut m, &mut ctx, 1e-2, 1000)?;
        assert_eq!(report.steps, 0);
        assert!(report.loss.is_finite());
        assert_eq!(loc_before, to_host(m.layers()[1].kernel().pair.posterior.loc())?);
        Ok(())
    }

    #[test]
    fn test_mismatched_rows_rejected() -> anyhow::Result<()> {
        let mut ctx = ExecutionContext::cpu(DType::F32, 0);
        let x = ctx.randn(0.0, 1.0, (5, 2))?;
        let y = ctx.randn(0.0, 1.0, (4, 1))?;
        assert!(RegressionData::new(x, y).is_err());
        Ok(())
    }
}
