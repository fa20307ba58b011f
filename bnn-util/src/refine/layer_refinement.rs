use log::debug;

use super::conjugate::{sample_auxiliary, AuxVarianceRatio};
use super::gaussian_param::WeightTensor;
use crate::context::ExecutionContext;
use crate::error::RefineError;

/// A layer whose weight tensors carry prior/posterior pairs.
pub trait RefinableLayer {
    fn name(&self) -> &str;

    fn kernel(&self) -> &WeightTensor;

    fn kernel_mut(&mut self) -> &mut WeightTensor;

    /// `None` when the layer has no Bayesian bias
    fn bias(&self) -> Option<&WeightTensor>;

    fn bias_mut(&mut self) -> Option<&mut WeightTensor>;
}

/// Log-density costs added by one refinement of a layer.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LayerRefinement {
    pub kernel_cost: f64,
    pub bias_cost: Option<f64>,
}

impl LayerRefinement {
    pub fn total(&self) -> f64 {
        self.kernel_cost + self.bias_cost.unwrap_or(0.0)
    }
}

/// Draw an auxiliary variable for one tensor, add its cost to the
/// tensor's accumulator and freeze the prior variance.
pub fn refine_tensor(
    weight: &mut WeightTensor,
    ratio: AuxVarianceRatio,
    ctx: &mut ExecutionContext,
) -> anyhow::Result<f64> {
    let cost = sample_auxiliary(&mut weight.pair, ratio, ctx).map_err(|e| {
        let numeric = matches!(
            e.downcast_ref::<RefineError>(),
            Some(RefineError::NumericInstability { .. })
        );
        if numeric {
            RefineError::non_finite(weight.name.clone()).into()
        } else {
            e
        }
    })?;
    weight.kl_cost.add(cost);
    weight.pair.prior.freeze();
    debug!(
        "{}: auxiliary cost {:.4}, accumulated {:.4}",
        weight.name,
        cost,
        weight.kl_cost.value()
    );
    Ok(cost)
}

/// Refine the kernel, then the bias if the layer has one.
pub fn refine_layer<L>(
    layer: &mut L,
    ratio: AuxVarianceRatio,
    ctx: &mut ExecutionContext,
) -> anyhow::Result<LayerRefinement>
where
    L: RefinableLayer + ?Sized,
{
    let kernel_cost = refine_tensor(layer.kernel_mut(), ratio, ctx)?;
    let bias_cost = match layer.bias_mut() {
        Some(bias) => Some(refine_tensor(bias, ratio, ctx)?),
        None => None,
    };
    Ok(LayerRefinement {
        kernel_cost,
        bias_cost,
    })
}
