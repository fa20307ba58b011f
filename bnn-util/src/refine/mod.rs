//! Auxiliary-variable posterior refinement.
//!
//! A mean-field Gaussian posterior is sharpened by repeatedly splitting
//! each weight's prior into a sampled part and a residual part, drawing
//! the sampled part from its posterior, and conditioning both prior and
//! posterior on the draw in closed form.
//!
//! # Layers
//!
//! - [`gaussian_param`]: `GaussianParam`, `PriorPosteriorPair`, KL cost
//! - [`conjugate`]: one refinement step for one pair
//! - [`layer_refinement`]: kernel then bias of a layer, prior freeze
//! - [`ensemble`]: reset / refine / fine-tune / persist per member
//!
//! # Example
//!
//! ```ignore
//! use bnn_util::refine::{EnsembleRefinementController, RefinementConfig};
//!
//! model.save(&base)?;
//! let controller = EnsembleRefinementController::new(RefinementConfig {
//!     ensemble_size: 3,
//!     ..Default::default()
//! })?;
//! let output = controller.run(&mut model, &base, &mut trainer, &mut ctx)?;
//! let files = output.paths();
//! ```

pub mod conjugate;
pub mod ensemble;
pub mod gaussian_param;
pub mod layer_refinement;

pub use conjugate::{sample_auxiliary, AuxVarianceRatio, MIN_SCALE};
pub use ensemble::{
    EnsembleMember, EnsembleOutput, EnsembleRefinementController, FailedMember, MemberSeeding,
    NumericFailurePolicy, RefinableModel, RefinementConfig, RoundReport,
};
pub use gaussian_param::{GaussianParam, KlCostAccumulator, PriorPosteriorPair, WeightTensor};
pub use layer_refinement::{refine_layer, refine_tensor, LayerRefinement, RefinableLayer};
