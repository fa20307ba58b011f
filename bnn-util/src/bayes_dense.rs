use candle_core::{Result, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::context::ExecutionContext;
use crate::refine::gaussian_param::{
    softplus_inverse_f64, GaussianParam, PriorPosteriorPair, WeightTensor,
};
use crate::refine::RefinableLayer;

////////////////////////////////////////////
// Mean-field Gaussian prior and posterior //
////////////////////////////////////////////

/// How prior/posterior pairs are initialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeanFieldInit {
    /// learn the prior scale by gradient steps until it is frozen
    pub empirical_bayes: bool,
    /// mean of the initial pre-softplus posterior scale
    pub posterior_untransformed_scale: f64,
}

impl Default for MeanFieldInit {
    fn default() -> Self {
        Self {
            empirical_bayes: true,
            posterior_untransformed_scale: -7.0,
        }
    }
}

/// Prior N(0, 1) with fixed loc; posterior with He-normal loc and
/// pre-softplus scale ~ N(init, 0.1²).
pub fn mean_field_pair(
    name: &str,
    dims: &[usize],
    fan_in: usize,
    init: &MeanFieldInit,
    ctx: &mut ExecutionContext,
) -> anyhow::Result<PriorPosteriorPair> {
    let (dtype, device) = (ctx.dtype(), ctx.device().clone());

    let unit_raw = softplus_inverse_f64(1.0);
    let prior = GaussianParam::new(
        format!("{}.prior", name),
        &Tensor::zeros(dims, dtype, &device)?,
        &(Tensor::ones(dims, dtype, &device)? * unit_raw)?,
        init.empirical_bayes,
    )?
    .with_fixed_loc();

    let he_stdev = (2.0 / fan_in.max(1) as f64).sqrt();
    let loc = ctx.randn(0.0, he_stdev, dims)?;
    let raw = ctx.randn(init.posterior_untransformed_scale, 0.1, dims)?;
    let posterior = GaussianParam::new(format!("{}.posterior", name), &loc, &raw, true)?;

    PriorPosteriorPair::new(prior, posterior)
}

///////////////////////////////////////////////
// Dense layer with local reparameterization //
///////////////////////////////////////////////

/// Bayesian dense layer `h = x W + b` with `W`, `b` mean-field Gaussian.
///
/// The pre-activation is sampled directly (local reparameterization):
/// mean `x μ_W`, variance `x² σ_W²`. The bias is a reparameterized draw.
pub struct BayesianDense {
    name: String,
    kernel: WeightTensor,
    bias: Option<WeightTensor>,
    relu: bool,
}

impl BayesianDense {
    pub fn in_dim(&self) -> usize {
        self.kernel.pair.dims()[0]
    }

    pub fn out_dim(&self) -> usize {
        self.kernel.pair.dims()[1]
    }

    pub fn forward(&self, x_nd: &Tensor, ctx: &mut ExecutionContext) -> Result<Tensor> {
        let q = &self.kernel.pair.posterior;

        let mean_nk = x_nd.matmul(q.loc())?;
        // keep sqrt differentiable where every input is zero
        let var_nk = (x_nd.sqr()?.matmul(&q.var()?)? + 1e-16)?;
        let eps_nk = ctx.randn(0.0, 1.0, mean_nk.dims())?;
        let mut h_nk = (mean_nk + (var_nk.sqrt()? * eps_nk)?)?;

        if let Some(bias) = &self.bias {
            let eps_k = ctx.randn(0.0, 1.0, bias.pair.dims())?;
            h_nk = h_nk.broadcast_add(&bias.sample(&eps_k)?)?;
        }

        if self.relu {
            h_nk.relu()
        } else {
            Ok(h_nk)
        }
    }

    /// Sum of KL(q || p) over kernel and bias
    pub fn kl(&self) -> Result<Tensor> {
        let kl = self.kernel.pair.kl_divergence()?;
        match &self.bias {
            Some(bias) => kl + bias.pair.kl_divergence()?,
            None => Ok(kl),
        }
    }

    /// Accumulated auxiliary-sampling cost over kernel and bias
    pub fn kl_cost(&self) -> f64 {
        self.weight_tensors().map(|w| w.kl_cost.value()).sum()
    }

    pub fn weight_tensors(&self) -> impl Iterator<Item = &WeightTensor> {
        std::iter::once(&self.kernel).chain(self.bias.as_ref())
    }

    pub fn weight_tensors_mut(&mut self) -> impl Iterator<Item = &mut WeightTensor> {
        std::iter::once(&mut self.kernel).chain(self.bias.as_mut())
    }

    pub fn trainable_vars(&self) -> Vec<Var> {
        self.weight_tensors()
            .flat_map(|w| {
                let mut vars = w.pair.prior.trainable_vars();
                vars.extend(w.pair.posterior.trainable_vars());
                vars
            })
            .collect()
    }
}

impl RefinableLayer for BayesianDense {
    fn name(&self) -> &str {
        &self.name
    }

    fn kernel(&self) -> &WeightTensor {
        &self.kernel
    }

    fn kernel_mut(&mut self) -> &mut WeightTensor {
        &mut self.kernel
    }

    fn bias(&self) -> Option<&WeightTensor> {
        self.bias.as_ref()
    }

    fn bias_mut(&mut self) -> Option<&mut WeightTensor> {
        self.bias.as_mut()
    }
}

/// Build a Bayesian dense layer `in_dim -> out_dim`.
pub fn bayes_dense(
    name: &str,
    in_dim: usize,
    out_dim: usize,
    with_bias: bool,
    relu: bool,
    init: &MeanFieldInit,
    ctx: &mut ExecutionContext,
) -> anyhow::Result<BayesianDense> {
    let kernel_name = format!("{}.kernel", name);
    let kernel = WeightTensor::new(
        kernel_name.as_str(),
        mean_field_pair(&kernel_name, &[in_dim, out_dim], in_dim, init, ctx)?,
    );

    let bias = if with_bias {
        let bias_name = format!("{}.bias", name);
        let pair = mean_field_pair(&bias_name, &[out_dim], out_dim, init, ctx)?;
        Some(WeightTensor::new(bias_name, pair))
    } else {
        None
    };

    Ok(BayesianDense {
        name: name.to_string(),
        kernel,
        bias,
        relu,
    })
}
