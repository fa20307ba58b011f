use candle_core::{Result, Tensor, D};

const LN_2PI: f64 = 1.837_877_066_409_345_5;

/// Gaussian log-likelihood of real-valued outputs
///
/// llik(i) = sum_k -0.5 ln(2π) - ln σ - 0.5 ((y(i,k) - μ(i,k)) / σ)²
///
/// * `y_nk` - observed outputs
/// * `loc_nk` - predictive means
/// * `scale` - predictive scale, broadcast against `loc_nk`
///
pub fn gaussian_likelihood(y_nk: &Tensor, loc_nk: &Tensor, scale: &Tensor) -> Result<Tensor> {
    let z_nk = (y_nk - loc_nk)?.broadcast_div(scale)?;
    let log_norm = (scale.log()? + 0.5 * LN_2PI)?;
    (z_nk.sqr()? * -0.5)?
        .broadcast_sub(&log_norm)?
        .sum(D::Minus1)
}

/// log (1/M) sum_m exp(x(m, ·)) along the first axis
///
/// * `x_mn` - per-member values, members on axis 0
///
pub fn log_mean_exp(x_mn: &Tensor) -> Result<Tensor> {
    let m = x_mn.dim(0)? as f64;
    let max_n = x_mn.max_keepdim(0)?;
    let sum_n = x_mn.broadcast_sub(&max_n)?.exp()?.sum_keepdim(0)?;
    (sum_n.log()? + max_n)?.squeeze(0)? - m.ln()
}

/// Mean squared error over all entries
pub fn mean_squared_error(y_nk: &Tensor, loc_nk: &Tensor) -> Result<Tensor> {
    (y_nk - loc_nk)?.sqr()?.mean_all()
}
