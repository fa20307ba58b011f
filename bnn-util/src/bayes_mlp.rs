use candle_core::{Device, Result, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::bayes_dense::{bayes_dense, BayesianDense, MeanFieldInit};
use crate::checkpoint::{
    check_weight_state, read_weight_state, write_weight_state, Checkpoint, TensorMap,
};
use crate::context::{dtype_epsilon, ExecutionContext};
use crate::error::RefineError;
use crate::likelihood::{gaussian_likelihood, mean_squared_error};
use crate::refine::gaussian_param::{all_finite, softplus, to_host};
use crate::refine::RefinableModel;

const OUTPUT_SCALE_KEY: &str = "output.untransformed_scale";

/// Architecture of the regression network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MlpShape {
    pub input_dim: usize,
    pub hidden_units: usize,
    /// multiplies the network output to give the predictive mean
    pub output_scaler: f64,
    pub init: MeanFieldInit,
}

/// Predictive distribution N(loc, scale²)
pub struct Prediction {
    pub loc_n1: Tensor,
    pub scale: Tensor,
}

/// Metrics of one stochastic pass over a batch.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ModelMetrics {
    pub elbo: f64,
    pub log_likelihood: f64,
    pub kl: f64,
    pub mse: f64,
}

/// Bayesian MLP for regression: one ReLU hidden layer, one output unit
/// and a learned homoscedastic output scale.
pub struct BayesianMlp {
    shape: MlpShape,
    layers: Vec<BayesianDense>,
    output_untransformed_scale: Var,
}

impl BayesianMlp {
    pub fn new(shape: MlpShape, ctx: &mut ExecutionContext) -> anyhow::Result<Self> {
        if shape.input_dim == 0 || shape.hidden_units == 0 {
            return Err(RefineError::invalid(format!(
                "network needs positive input and hidden sizes: {:?}",
                shape
            ))
            .into());
        }

        let hidden = bayes_dense(
            "dense_0",
            shape.input_dim,
            shape.hidden_units,
            true,
            true,
            &shape.init,
            ctx,
        )?;
        let output = bayes_dense("dense_1", shape.hidden_units, 1, true, false, &shape.init, ctx)?;

        let raw = ctx.host_tensor(vec![-3.0], ())?;

        Ok(Self {
            shape,
            layers: vec![hidden, output],
            output_untransformed_scale: Var::from_tensor(&raw)?,
        })
    }

    pub fn shape(&self) -> &MlpShape {
        &self.shape
    }

    pub fn layers(&self) -> &[BayesianDense] {
        &self.layers
    }

    /// softplus(s) + eps
    pub fn output_scale(&self) -> Result<Tensor> {
        let raw = self.output_untransformed_scale.as_tensor();
        softplus(raw)? + dtype_epsilon(raw.dtype())
    }

    /// One stochastic pass: fresh local-reparameterization noise per call.
    pub fn forward(&self, x_nd: &Tensor, ctx: &mut ExecutionContext) -> Result<Prediction> {
        let mut h = x_nd.clone();
        for layer in self.layers.iter() {
            h = layer.forward(&h, ctx)?;
        }
        Ok(Prediction {
            loc_n1: (h * self.shape.output_scaler)?,
            scale: self.output_scale()?,
        })
    }

    /// Per-example log-likelihood `(n,)` and the prediction it came from
    pub fn log_likelihood(
        &self,
        x_nd: &Tensor,
        y_n1: &Tensor,
        ctx: &mut ExecutionContext,
    ) -> Result<(Tensor, Prediction)> {
        let pred = self.forward(x_nd, ctx)?;
        let llik = gaussian_likelihood(y_n1, &pred.loc_n1, &pred.scale)?;
        Ok((llik, pred))
    }

    /// Σ KL(q || p) over all weight tensors
    pub fn kl(&self) -> Result<Tensor> {
        let mut kl = self.layers[0].kl()?;
        for layer in self.layers.iter().skip(1) {
            kl = (kl + layer.kl()?)?;
        }
        Ok(kl)
    }

    /// Σ accumulated auxiliary-sampling cost
    pub fn kl_cost(&self) -> f64 {
        self.layers.iter().map(|l| l.kl_cost()).sum()
    }

    /// Minibatch objective: -mean log p(y|x) + Σ KL / n_train
    pub fn loss(
        &self,
        x_nd: &Tensor,
        y_n1: &Tensor,
        n_train: usize,
        ctx: &mut ExecutionContext,
    ) -> Result<Tensor> {
        let (llik, _) = self.log_likelihood(x_nd, y_n1, ctx)?;
        let kl = (self.kl()? / n_train as f64)?;
        llik.mean_all()?.neg()? + kl
    }

    pub fn metrics(
        &self,
        x_nd: &Tensor,
        y_n1: &Tensor,
        n_train: usize,
        ctx: &mut ExecutionContext,
    ) -> anyhow::Result<ModelMetrics> {
        let (llik, pred) = self.log_likelihood(x_nd, y_n1, ctx)?;
        let log_likelihood = to_host(&llik.mean_all()?)?[0];
        let mse = to_host(&mean_squared_error(y_n1, &pred.loc_n1)?)?[0];
        let kl = to_host(&self.kl()?)?[0] + self.kl_cost();
        Ok(ModelMetrics {
            elbo: log_likelihood * n_train as f64 - kl,
            log_likelihood,
            kl,
            mse,
        })
    }

    /// Variables of trainable records plus the output scale.
    pub fn trainable_vars(&self) -> Vec<Var> {
        let mut vars: Vec<Var> = self.layers.iter().flat_map(|l| l.trainable_vars()).collect();
        vars.push(self.output_untransformed_scale.clone());
        vars
    }
}

impl Checkpoint for BayesianMlp {
    fn state(&self) -> anyhow::Result<TensorMap> {
        let mut out = TensorMap::new();
        for weight in self.layers.iter().flat_map(|l| l.weight_tensors()) {
            write_weight_state(weight, &mut out)?;
        }
        out.insert(
            OUTPUT_SCALE_KEY.to_string(),
            self.output_untransformed_scale.as_tensor().to_device(&Device::Cpu)?,
        );
        Ok(out)
    }

    fn restore(&mut self, state: &TensorMap) -> anyhow::Result<()> {
        for weight in self.layers.iter().flat_map(|l| l.weight_tensors()) {
            check_weight_state(weight, state)?;
        }
        let raw = state
            .get(OUTPUT_SCALE_KEY)
            .filter(|t| t.dims().is_empty())
            .ok_or_else(|| RefineError::invalid(format!("missing scalar `{}`", OUTPUT_SCALE_KEY)))?;

        for weight in self.layers.iter_mut().flat_map(|l| l.weight_tensors_mut()) {
            read_weight_state(weight, state)?;
        }
        let current = self.output_untransformed_scale.as_tensor();
        let raw = raw.to_device(current.device())?.to_dtype(current.dtype())?;
        self.output_untransformed_scale.set(&raw)?;
        Ok(())
    }
}

impl RefinableModel for BayesianMlp {
    type Layer = BayesianDense;

    fn layers_mut(&mut self) -> &mut [BayesianDense] {
        &mut self.layers
    }

    fn check_finite(&self) -> anyhow::Result<()> {
        for weight in self.layers.iter().flat_map(|l| l.weight_tensors()) {
            for param in [&weight.pair.prior, &weight.pair.posterior] {
                if !param.is_finite()? {
                    return Err(RefineError::non_finite(param.name()).into());
                }
            }
            if !weight.kl_cost.value().is_finite() {
                return Err(RefineError::non_finite(format!("{}.kl_cost", weight.name)).into());
            }
        }
        if !all_finite(self.output_untransformed_scale.as_tensor())? {
            return Err(RefineError::non_finite(OUTPUT_SCALE_KEY).into());
        }
        Ok(())
    }

    fn kl_cost(&self) -> f64 {
        self.layers.iter().map(|l| l.kl_cost()).sum()
    }
}
