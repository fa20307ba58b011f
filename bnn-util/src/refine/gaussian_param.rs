use candle_core::{DType, Device, Result, Tensor, Var};

use crate::context::dtype_epsilon;
use crate::error::RefineError;

/// softplus(x) = max(x, 0) + ln(1 + exp(-|x|))
pub fn softplus(x: &Tensor) -> Result<Tensor> {
    let tail = (x.abs()?.neg()?.exp()? + 1.0)?.log()?;
    x.relu()? + tail
}

pub fn softplus_f64(x: f64) -> f64 {
    x.max(0.0) + (-x.abs()).exp().ln_1p()
}

/// Inverse of softplus for y > 0: y + ln(1 - exp(-y))
pub fn softplus_inverse_f64(y: f64) -> f64 {
    y + (-(-y).exp_m1()).ln()
}

/// Flatten a tensor into host `f64` values (row-major).
pub fn to_host(t: &Tensor) -> Result<Vec<f64>> {
    t.flatten_all()?
        .to_device(&Device::Cpu)?
        .to_dtype(DType::F64)?
        .to_vec1::<f64>()
}

pub fn all_finite(t: &Tensor) -> Result<bool> {
    Ok(to_host(t)?.iter().all(|x| x.is_finite()))
}

/// Diagonal Gaussian N(loc, scale²) with
/// `scale = softplus(untransformed_scale) + eps`.
///
/// Both fields are `Var`s so the optimizer can move them; `set`
/// overwrites them in place. The shape never changes after
/// construction.
pub struct GaussianParam {
    name: String,
    loc: Var,
    untransformed_scale: Var,
    trainable: bool,
    /// loc is only moved by the auxiliary sampler, never by gradients
    fixed_loc: bool,
}

impl GaussianParam {
    /// # Arguments
    /// * `name` - identity used in logs and checkpoint keys
    /// * `loc` - initial location
    /// * `untransformed_scale` - initial pre-softplus scale, same shape as `loc`
    /// * `trainable` - whether gradient steps may move this distribution
    pub fn new(
        name: impl Into<String>,
        loc: &Tensor,
        untransformed_scale: &Tensor,
        trainable: bool,
    ) -> anyhow::Result<Self> {
        let name = name.into();
        if loc.dims() != untransformed_scale.dims() {
            return Err(RefineError::invalid(format!(
                "{}: loc {:?} vs untransformed_scale {:?}",
                name,
                loc.dims(),
                untransformed_scale.dims()
            ))
            .into());
        }
        Ok(Self {
            name,
            loc: Var::from_tensor(loc)?,
            untransformed_scale: Var::from_tensor(untransformed_scale)?,
            trainable,
            fixed_loc: false,
        })
    }

    /// Exclude `loc` from gradient updates (priors).
    pub fn with_fixed_loc(mut self) -> Self {
        self.fixed_loc = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn loc(&self) -> &Tensor {
        self.loc.as_tensor()
    }

    pub fn untransformed_scale(&self) -> &Tensor {
        self.untransformed_scale.as_tensor()
    }

    /// softplus(untransformed_scale) + machine epsilon, strictly positive
    pub fn scale(&self) -> Result<Tensor> {
        let eps = dtype_epsilon(self.loc.dtype());
        softplus(self.untransformed_scale.as_tensor())? + eps
    }

    pub fn var(&self) -> Result<Tensor> {
        self.scale()?.sqr()
    }

    pub fn dims(&self) -> &[usize] {
        self.loc.dims()
    }

    pub fn dtype(&self) -> DType {
        self.loc.dtype()
    }

    pub fn device(&self) -> &Device {
        self.loc.device()
    }

    /// Overwrite both fields. Shapes are checked before either field is
    /// touched, so a failed call leaves the record unchanged.
    pub fn set(&mut self, loc: &Tensor, untransformed_scale: &Tensor) -> anyhow::Result<()> {
        for (what, t) in [("loc", loc), ("untransformed_scale", untransformed_scale)] {
            if t.dims() != self.dims() {
                return Err(RefineError::invalid(format!(
                    "{}: cannot set {} of shape {:?} into {:?}",
                    self.name,
                    what,
                    t.dims(),
                    self.dims()
                ))
                .into());
            }
        }
        let (dtype, device) = (self.dtype(), self.device().clone());
        let loc = loc.to_device(&device)?.to_dtype(dtype)?;
        let untransformed_scale = untransformed_scale.to_device(&device)?.to_dtype(dtype)?;
        self.loc.set(&loc)?;
        self.untransformed_scale.set(&untransformed_scale)?;
        Ok(())
    }

    pub fn is_trainable(&self) -> bool {
        self.trainable
    }

    /// The variance is fixed from here on; undone only by reloading a
    /// checkpoint taken before the freeze.
    pub fn freeze(&mut self) {
        self.trainable = false;
    }

    pub(crate) fn restore_trainable(&mut self, trainable: bool) {
        self.trainable = trainable;
    }

    /// Variables the optimizer may update right now.
    pub fn trainable_vars(&self) -> Vec<Var> {
        match (self.trainable, self.fixed_loc) {
            (false, _) => vec![],
            (true, true) => vec![self.untransformed_scale.clone()],
            (true, false) => vec![self.loc.clone(), self.untransformed_scale.clone()],
        }
    }

    pub fn is_finite(&self) -> Result<bool> {
        Ok(all_finite(self.loc())? && all_finite(self.untransformed_scale())?)
    }
}

/// The prior and posterior attached to one weight tensor.
pub struct PriorPosteriorPair {
    pub prior: GaussianParam,
    pub posterior: GaussianParam,
}

impl PriorPosteriorPair {
    pub fn new(prior: GaussianParam, posterior: GaussianParam) -> anyhow::Result<Self> {
        if prior.dims() != posterior.dims() {
            return Err(RefineError::invalid(format!(
                "prior {:?} and posterior {:?} shapes differ",
                prior.dims(),
                posterior.dims()
            ))
            .into());
        }
        Ok(Self { prior, posterior })
    }

    pub fn dims(&self) -> &[usize] {
        self.posterior.dims()
    }

    /// KL(q || p) summed over all elements
    ///
    /// ln σp - ln σq + (σq² + (μq - μp)²) / (2σp²) - 1/2
    pub fn kl_divergence(&self) -> Result<Tensor> {
        let sp = self.prior.scale()?;
        let sq = self.posterior.scale()?;
        let diff_sq = (self.posterior.loc() - self.prior.loc())?.sqr()?;
        let num = (sq.sqr()? + diff_sq)?;
        let den = (sp.sqr()? * 2.0)?;
        let kl = (((sp.log()? - sq.log()?)? + (num / den)?)? - 0.5)?;
        kl.sum_all()
    }
}

/// Accumulated auxiliary-sampling log-density cost of one weight tensor.
/// Not trainable; only ever added to.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct KlCostAccumulator {
    value: f64,
}

impl KlCostAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, cost: f64) {
        self.value += cost;
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub(crate) fn restore(&mut self, value: f64) {
        self.value = value;
    }
}

/// One weight tensor of a layer: its distributions and its KL cost.
pub struct WeightTensor {
    pub name: String,
    pub pair: PriorPosteriorPair,
    pub kl_cost: KlCostAccumulator,
}

impl WeightTensor {
    pub fn new(name: impl Into<String>, pair: PriorPosteriorPair) -> Self {
        Self {
            name: name.into(),
            pair,
            kl_cost: KlCostAccumulator::new(),
        }
    }

    /// Draw the posterior weights: μ + σ ε
    pub fn sample(&self, eps: &Tensor) -> Result<Tensor> {
        let posterior = &self.pair.posterior;
        posterior.loc() + (posterior.scale()? * eps)?
    }
}
