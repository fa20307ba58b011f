use indicatif::{ProgressBar, ProgressDrawTarget};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::conjugate::AuxVarianceRatio;
use super::layer_refinement::{refine_layer, RefinableLayer};
use crate::checkpoint::{checkpoint_digest, digest_hex, Checkpoint};
use crate::context::{CancelToken, ExecutionContext};
use crate::error::RefineError;
use crate::trainer::{FineTune, FineTuneReport};

/// A network the controller can reset, refine and persist.
pub trait RefinableModel: Checkpoint {
    type Layer: RefinableLayer;

    /// Layers in refinement order
    fn layers_mut(&mut self) -> &mut [Self::Layer];

    /// Report the first non-finite tensor as `NumericInstability`.
    fn check_finite(&self) -> anyhow::Result<()>;

    /// Σ accumulated auxiliary-sampling cost
    fn kl_cost(&self) -> f64;
}

/// How each member seeds its random draws.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberSeeding {
    /// member `i` uses `seed + i`
    Distinct,
    /// every member uses `seed`
    Shared,
}

/// What to do with a member whose weights become non-finite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NumericFailurePolicy {
    /// stop the whole run with the error
    Abort,
    /// record the failure and continue with the next member
    Skip,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefinementConfig {
    pub aux_variance_ratio: f64,
    pub n_auxiliary_variables: usize,
    pub ensemble_size: usize,
    /// fine-tuning steps per refinement round (0: no fine-tuning)
    pub auxiliary_sampling_frequency: usize,
    pub learning_rate_for_sampling: f64,
    pub seed: u64,
    pub member_seeding: MemberSeeding,
    pub on_numeric_failure: NumericFailurePolicy,
    pub output_dir: PathBuf,
}

impl Default for RefinementConfig {
    fn default() -> Self {
        Self {
            aux_variance_ratio: 0.7,
            n_auxiliary_variables: 5,
            ensemble_size: 10,
            auxiliary_sampling_frequency: 100,
            learning_rate_for_sampling: 1e-5,
            seed: 0,
            member_seeding: MemberSeeding::Distinct,
            on_numeric_failure: NumericFailurePolicy::Abort,
            output_dir: PathBuf::from("models"),
        }
    }
}

impl RefinementConfig {
    /// Fail fast on anything the controller cannot run with.
    pub fn validate(&self) -> Result<AuxVarianceRatio, RefineError> {
        let ratio = AuxVarianceRatio::new(self.aux_variance_ratio)?;
        if self.n_auxiliary_variables < 1 {
            return Err(RefineError::invalid("n_auxiliary_variables must be >= 1"));
        }
        if self.ensemble_size < 1 {
            return Err(RefineError::invalid("ensemble_size must be >= 1"));
        }
        let lr = self.learning_rate_for_sampling;
        if !lr.is_finite() || lr < 0.0 {
            return Err(RefineError::invalid(format!(
                "learning_rate_for_sampling must be finite and >= 0, got {}",
                lr
            )));
        }
        Ok(ratio)
    }

    pub fn member_seed(&self, index: usize) -> u64 {
        match self.member_seeding {
            MemberSeeding::Distinct => self.seed.wrapping_add(index as u64),
            MemberSeeding::Shared => self.seed,
        }
    }

    pub fn member_path(&self, index: usize) -> PathBuf {
        self.output_dir
            .join(format!("ensemble_component_{}.safetensors", index))
    }

    /// lr_sampling · sqrt(1 - r)^round
    pub fn round_learning_rate(&self, ratio: AuxVarianceRatio, round: usize) -> f64 {
        self.learning_rate_for_sampling * ratio.residual_scale().powi(round as i32)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundReport {
    pub round: usize,
    pub learning_rate: f64,
    /// model-wide accumulated cost after this round's draws
    pub kl_cost: f64,
    pub fine_tune: Option<FineTuneReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsembleMember {
    pub index: usize,
    pub path: PathBuf,
    pub seed: u64,
    /// content hash of the persisted checkpoint, hex
    pub digest: String,
    pub rounds: Vec<RoundReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedMember {
    pub index: usize,
    pub seed: u64,
    pub reason: String,
}

/// Persisted members in order, plus members skipped after a numeric
/// failure and whether the run was cancelled.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnsembleOutput {
    pub members: Vec<EnsembleMember>,
    pub failed: Vec<FailedMember>,
    pub cancelled: bool,
}

impl EnsembleOutput {
    pub fn paths(&self) -> Vec<PathBuf> {
        self.members.iter().map(|m| m.path.clone()).collect()
    }

    pub fn write_json(&self, path: &Path) -> anyhow::Result<()> {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(file), self)?;
        Ok(())
    }
}

/// Drives every ensemble member through
/// `Reset -> Refining(0..n) -> Persisted` on one live model.
pub struct EnsembleRefinementController {
    config: RefinementConfig,
    ratio: AuxVarianceRatio,
    cancel: CancelToken,
    show_progress: bool,
}

impl EnsembleRefinementController {
    pub fn new(config: RefinementConfig) -> Result<Self, RefineError> {
        let ratio = config.validate()?;
        Ok(Self {
            config,
            ratio,
            cancel: CancelToken::new(),
            show_progress: false,
        })
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    pub fn config(&self) -> &RefinementConfig {
        &self.config
    }

    /// Load the base checkpoint into the live model.
    pub fn reset<M: RefinableModel>(&self, model: &mut M, base: &Path) -> anyhow::Result<()> {
        model.load(base)
    }

    /// Generate `ensemble_size` members from `base`.
    ///
    /// Persistence errors propagate unchanged. A numeric failure never
    /// reaches disk; it aborts the run or skips the member depending on
    /// `on_numeric_failure`.
    pub fn run<M, T>(
        &self,
        model: &mut M,
        base: &Path,
        trainer: &mut T,
        ctx: &mut ExecutionContext,
    ) -> anyhow::Result<EnsembleOutput>
    where
        M: RefinableModel,
        T: FineTune<M>,
    {
        let ntot = self.config.ensemble_size;
        let mut output = EnsembleOutput::default();

        let pb = ProgressBar::new(ntot as u64);
        if !self.show_progress {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }

        for index in 0..ntot {
            if self.cancel.is_cancelled() {
                output.cancelled = true;
                break;
            }

            let seed = self.config.member_seed(index);
            info!("member {}/{}: reset (seed {})", index + 1, ntot, seed);
            self.reset(model, base)?;
            ctx.reseed(seed);

            let rounds = match self.refine_member(model, trainer, ctx) {
                Ok(Some(rounds)) => rounds,
                Ok(None) => {
                    info!("member {}: cancelled, not persisted", index);
                    output.cancelled = true;
                    break;
                }
                Err(e) => {
                    let err = match e.downcast_ref::<RefineError>() {
                        Some(numeric @ RefineError::NumericInstability { .. }) => {
                            numeric.clone().in_member(index)
                        }
                        _ => return Err(e),
                    };
                    warn!("{}", err);
                    match self.config.on_numeric_failure {
                        NumericFailurePolicy::Abort => return Err(err.into()),
                        NumericFailurePolicy::Skip => {
                            output.failed.push(FailedMember {
                                index,
                                seed,
                                reason: err.to_string(),
                            });
                            pb.inc(1);
                            continue;
                        }
                    }
                }
            };

            let path = self.config.member_path(index);
            model.save(&path)?;
            let digest = digest_hex(checkpoint_digest(&path)?);
            info!("member {}: saved {:?} [{}]", index, path, digest);

            output.members.push(EnsembleMember {
                index,
                path,
                seed,
                digest,
                rounds,
            });
            pb.inc(1);
        }
        pb.finish_and_clear();

        info!(
            "{} member(s) persisted, {} failed{}",
            output.members.len(),
            output.failed.len(),
            if output.cancelled { ", cancelled" } else { "" }
        );
        Ok(output)
    }

    /// `Refining(j)` for every round; `None` when cancelled midway.
    fn refine_member<M, T>(
        &self,
        model: &mut M,
        trainer: &mut T,
        ctx: &mut ExecutionContext,
    ) -> anyhow::Result<Option<Vec<RoundReport>>>
    where
        M: RefinableModel,
        T: FineTune<M>,
    {
        let steps = self.config.auxiliary_sampling_frequency;
        let mut rounds = Vec::with_capacity(self.config.n_auxiliary_variables);

        for round in 0..self.config.n_auxiliary_variables {
            if self.cancel.is_cancelled() {
                return Ok(None);
            }

            for layer in model.layers_mut() {
                refine_layer(layer, self.ratio, ctx)?;
            }
            model.check_finite()?;

            let learning_rate = self.config.round_learning_rate(self.ratio, round);
            let fine_tune = if steps > 0 {
                let report = trainer.fine_tune(model, ctx, learning_rate, steps)?;
                model.check_finite()?;
                Some(report)
            } else {
                None
            };

            let kl_cost = model.kl_cost();
            info!(
                "round {}: lr = {:.3e}, kl cost = {:.4}{}",
                round,
                learning_rate,
                kl_cost,
                fine_tune
                    .as_ref()
                    .map(|r| format!(", loss = {:.4}", r.loss))
                    .unwrap_or_default()
            );

            rounds.push(RoundReport {
                round,
                learning_rate,
                kl_cost,
                fine_tune,
            });
        }

        // a fine-tuning pass cut short by cancellation is not persisted
        if self.cancel.is_cancelled() {
            return Ok(None);
        }
        Ok(Some(rounds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation() {
        assert!(RefinementConfig::default().validate().is_ok());

        let bad = [
            RefinementConfig {
                aux_variance_ratio: 1.5,
                ..Default::default()
            },
            RefinementConfig {
                n_auxiliary_variables: 0,
                ..Default::default()
            },
            RefinementConfig {
                ensemble_size: 0,
                ..Default::default()
            },
            RefinementConfig {
                learning_rate_for_sampling: f64::NAN,
                ..Default::default()
            },
        ];
        for config in bad {
            assert!(matches!(
                EnsembleRefinementController::new(config),
                Err(RefineError::InvalidParameter(_))
            ));
        }

        let no_fine_tune = RefinementConfig {
            auxiliary_sampling_frequency: 0,
            ..Default::default()
        };
        assert!(no_fine_tune.validate().is_ok());
    }

    #[test]
    fn test_member_seeds_and_paths() {
        let mut config = RefinementConfig {
            seed: 40,
            output_dir: PathBuf::from("out"),
            ..Default::default()
        };
        assert_eq!(
            (0..3).map(|i| config.member_seed(i)).collect::<Vec<_>>(),
            vec![40, 41, 42]
        );
        assert_eq!(
            config.member_path(2),
            PathBuf::from("out/ensemble_component_2.safetensors")
        );

        config.member_seeding = MemberSeeding::Shared;
        assert!((0..3).all(|i| config.member_seed(i) == 40));
    }

    #[test]
    fn test_round_learning_rate_decays() -> anyhow::Result<()> {
        let config = RefinementConfig {
            learning_rate_for_sampling: 1e-3,
            ..Default::default()
        };
        let ratio = AuxVarianceRatio::new(0.75)?;
        assert_eq!(config.round_learning_rate(ratio, 0), 1e-3);
        approx::assert_relative_eq!(
            config.round_learning_rate(ratio, 2),
            1e-3 * 0.25,
            max_relative = 1e-12
        );
        Ok(())
    }
}
