//! Auxiliary-variable refinement of one (prior, posterior) pair.
//!
//! With prior p(z) = N(μp, σp²) split as z = a1 + a2,
//!
//! ```text
//! p(a1) = N(0,  r σp²)
//! p(a2) = N(μp, (1 - r) σp²)
//! ```
//!
//! the posterior q(z) = N(μq, σq²) induces
//!
//! ```text
//! q(a1)   = N((μq - μp) f,  (σq² f + σa2²) f),          f = σa1² / σp²
//! q(z|a1) = N(μp + ((μq - μp) σa2² σp² + a1 σq² σp²) / D,
//!             σq² σa2² σp² / D),                      D = σp² σa2² + σq² σa1²
//! ```
//!
//! One draw â1 ~ q(a1) then turns the prior into N(â1 + μp, σa2²) and
//! the posterior into q(z | â1). The cost of the draw is
//! log q(â1) - log p(â1).

use candle_core::{Device, Tensor};

use super::gaussian_param::{softplus_inverse_f64, to_host, PriorPosteriorPair};
use crate::context::ExecutionContext;
use crate::error::RefineError;

/// Scales written back by the sampler never go below this.
pub const MIN_SCALE: f64 = 1e-12;

/// Fraction r of the prior variance assigned to the sampled auxiliary
/// variable, validated to lie in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AuxVarianceRatio(f64);

impl AuxVarianceRatio {
    pub fn new(r: f64) -> Result<Self, RefineError> {
        if !(0.0..=1.0).contains(&r) {
            return Err(RefineError::invalid(format!(
                "auxiliary variance ratio must be within [0, 1], got {}",
                r
            )));
        }
        Ok(Self(r))
    }

    pub fn get(self) -> f64 {
        self.0
    }

    /// Step-size decay per refinement round, sqrt(1 - r)
    pub fn residual_scale(self) -> f64 {
        (1.0 - self.0).sqrt()
    }
}

/// Split of one prior element into the two auxiliary components.
#[derive(Debug, Clone, Copy)]
pub struct AuxiliaryDecomposition {
    pub prior_var: f64,
    pub a1_var: f64,
    pub a2_loc: f64,
    pub a2_var: f64,
}

impl AuxiliaryDecomposition {
    pub fn new(prior_loc: f64, prior_scale: f64, ratio: AuxVarianceRatio) -> Self {
        let prior_var = prior_scale * prior_scale;
        let a1_var = prior_var * ratio.get();
        Self {
            prior_var,
            a1_var,
            a2_loc: prior_loc,
            a2_var: prior_var - a1_var,
        }
    }

    fn is_degenerate(&self) -> bool {
        self.a1_var <= 0.0
    }
}

/// Result of refining a single element.
#[derive(Debug, Clone, Copy)]
pub struct ElementUpdate {
    pub a1: f64,
    pub prior_loc: f64,
    pub prior_scale: f64,
    pub posterior_loc: f64,
    pub posterior_scale: f64,
    pub log_density_ratio: f64,
}

impl ElementUpdate {
    fn is_finite(&self) -> bool {
        [
            self.a1,
            self.prior_loc,
            self.prior_scale,
            self.posterior_loc,
            self.posterior_scale,
            self.log_density_ratio,
        ]
        .iter()
        .all(|x| x.is_finite())
    }
}

fn normal_log_pdf(x: f64, mean: f64, var: f64) -> f64 {
    -0.5 * ((2.0 * std::f64::consts::PI * var).ln() + (x - mean).powi(2) / var)
}

/// Refine one element given a standard normal draw `z`.
///
/// A zero auxiliary variance (r = 0, or r so small it underflows)
/// leaves everything as it was with â1 = 0 and zero cost. At r = 1 the
/// prior and posterior collapse onto the draw with zero scale; the
/// caller floors scales before writing them back.
pub fn conjugate_update(
    prior_loc: f64,
    prior_scale: f64,
    posterior_loc: f64,
    posterior_scale: f64,
    ratio: AuxVarianceRatio,
    z: f64,
) -> ElementUpdate {
    let d = AuxiliaryDecomposition::new(prior_loc, prior_scale, ratio);

    if d.is_degenerate() {
        return ElementUpdate {
            a1: 0.0,
            prior_loc,
            prior_scale,
            posterior_loc,
            posterior_scale,
            log_density_ratio: 0.0,
        };
    }

    let post_var = posterior_scale * posterior_scale;
    let frac = d.a1_var / d.prior_var;

    // q(a1)
    let q_a1_loc = (posterior_loc - prior_loc) * frac;
    let q_a1_var = (post_var * frac + d.a2_var) * frac;
    let a1 = q_a1_loc + q_a1_var.sqrt() * z;

    // q(z | a1)
    let denom = d.prior_var * d.a2_var + post_var * d.a1_var;
    let z_loc = prior_loc
        + ((posterior_loc - prior_loc) * d.a2_var * d.prior_var + a1 * post_var * d.prior_var)
            / denom;
    let z_var = post_var * d.a2_var * d.prior_var / denom;

    let log_density_ratio =
        normal_log_pdf(a1, q_a1_loc, q_a1_var) - normal_log_pdf(a1, 0.0, d.a1_var);

    ElementUpdate {
        a1,
        prior_loc: a1 + d.a2_loc,
        prior_scale: d.a2_var.max(0.0).sqrt(),
        posterior_loc: z_loc,
        posterior_scale: z_var.max(0.0).sqrt(),
        log_density_ratio,
    }
}

/// One auxiliary refinement step over a whole weight tensor.
///
/// Draws one standard normal per element from `ctx` (row-major order),
/// overwrites the prior and the posterior in place, and returns the
/// summed log-density ratio of the draw. Nothing is written when any
/// refined value is non-finite.
pub fn sample_auxiliary(
    pair: &mut PriorPosteriorPair,
    ratio: AuxVarianceRatio,
    ctx: &mut ExecutionContext,
) -> anyhow::Result<f64> {
    if ratio.get() == 0.0 {
        return Ok(0.0);
    }

    let shape = pair.dims().to_vec();
    let mu_p = to_host(pair.prior.loc())?;
    let sd_p = to_host(&pair.prior.scale()?)?;
    let mu_q = to_host(pair.posterior.loc())?;
    let sd_q = to_host(&pair.posterior.scale()?)?;

    let n = mu_p.len();
    let draws = ctx.std_normal_vec(n);

    let mut prior_loc = Vec::with_capacity(n);
    let mut prior_raw = Vec::with_capacity(n);
    let mut post_loc = Vec::with_capacity(n);
    let mut post_raw = Vec::with_capacity(n);
    let mut log_density_ratio = 0.0;

    for i in 0..n {
        let u = conjugate_update(mu_p[i], sd_p[i], mu_q[i], sd_q[i], ratio, draws[i]);
        if !u.is_finite() {
            return Err(RefineError::non_finite(pair.posterior.name()).into());
        }
        prior_loc.push(u.prior_loc);
        prior_raw.push(softplus_inverse_f64(u.prior_scale.max(MIN_SCALE)));
        post_loc.push(u.posterior_loc);
        post_raw.push(softplus_inverse_f64(u.posterior_scale.max(MIN_SCALE)));
        log_density_ratio += u.log_density_ratio;
    }

    if !log_density_ratio.is_finite() {
        return Err(RefineError::non_finite(pair.posterior.name()).into());
    }

    let host = |v: Vec<f64>| Tensor::from_vec(v, shape.as_slice(), &Device::Cpu);
    pair.prior.set(&host(prior_loc)?, &host(prior_raw)?)?;
    pair.posterior.set(&host(post_loc)?, &host(post_raw)?)?;

    Ok(log_density_ratio)
}
