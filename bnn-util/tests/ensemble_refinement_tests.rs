use bnn_util::bayes_dense::MeanFieldInit;
use bnn_util::bayes_mlp::{BayesianMlp, MlpShape};
use bnn_util::candle_core::DType;
use bnn_util::checkpoint::{checkpoint_digest, load_tensors, Checkpoint};
use bnn_util::context::{CancelToken, ExecutionContext};
use bnn_util::error::RefineError;
use bnn_util::refine::gaussian_param::to_host;
use bnn_util::refine::*;
use bnn_util::trainer::{ElboTrainer, FineTune, FineTuneReport, RegressionData, TrainConfig};
use std::path::{Path, PathBuf};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn shape() -> MlpShape {
    MlpShape {
        input_dim: 3,
        hidden_units: 6,
        output_scaler: 1.0,
        init: MeanFieldInit::default(),
    }
}

fn toy_trainer(ctx: &mut ExecutionContext) -> anyhow::Result<ElboTrainer> {
    let x = ctx.randn(0.0, 1.0, (40, 3))?;
    let y = (x.sum_keepdim(1)? * 0.5)?;
    let config = TrainConfig {
        batch_size: 8,
        ..Default::default()
    };
    ElboTrainer::new(RegressionData::new(x, y)?, None, config)
}

fn base_model(dir: &Path, ctx: &mut ExecutionContext) -> anyhow::Result<(BayesianMlp, PathBuf)> {
    let model = BayesianMlp::new(shape(), ctx)?;
    let base = dir.join("base_model.safetensors");
    model.save(&base)?;
    Ok((model, base))
}

fn config(dir: &Path, ensemble_size: usize, seeding: MemberSeeding) -> RefinementConfig {
    RefinementConfig {
        aux_variance_ratio: 0.7,
        n_auxiliary_variables: 3,
        ensemble_size,
        auxiliary_sampling_frequency: 4,
        learning_rate_for_sampling: 1e-3,
        seed: 11,
        member_seeding: seeding,
        on_numeric_failure: NumericFailurePolicy::Abort,
        output_dir: dir.join("models"),
    }
}

#[test]
fn save_load_roundtrip_and_idempotent_save() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut ctx = ExecutionContext::cpu(DType::F32, 1);
    let (mut model, base) = base_model(dir.path(), &mut ctx)?;

    let again = dir.path().join("again.safetensors");
    model.save(&again)?;
    assert_eq!(std::fs::read(&base)?, std::fs::read(&again)?);

    // perturb everything the checkpoint covers, then restore
    for layer in model.layers_mut() {
        refine_layer(layer, AuxVarianceRatio::new(0.5)?, &mut ctx)?;
    }
    let refined = dir.path().join("refined.safetensors");
    model.save(&refined)?;
    assert_ne!(checkpoint_digest(&base)?, checkpoint_digest(&refined)?);

    model.load(&base)?;
    let restored = dir.path().join("restored.safetensors");
    model.save(&restored)?;
    assert_eq!(checkpoint_digest(&base)?, checkpoint_digest(&restored)?);
    assert!(model.kl_cost() == 0.0);
    Ok(())
}

#[test]
fn reset_is_idempotent() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut ctx = ExecutionContext::cpu(DType::F32, 2);
    let (mut model, base) = base_model(dir.path(), &mut ctx)?;
    let controller =
        EnsembleRefinementController::new(config(dir.path(), 1, MemberSeeding::Distinct))?;

    controller.reset(&mut model, &base)?;
    let once = model.state()?;
    controller.reset(&mut model, &base)?;
    let twice = model.state()?;

    assert_eq!(once.len(), twice.len());
    for (key, t) in once.iter() {
        assert_eq!(to_host(t)?, to_host(&twice[key])?, "{}", key);
    }
    Ok(())
}

#[test]
fn zero_ratio_rounds_leave_posterior_unchanged() -> anyhow::Result<()> {
    init_logger();
    let dir = tempfile::tempdir()?;
    let mut ctx = ExecutionContext::cpu(DType::F32, 3);
    let (mut model, base) = base_model(dir.path(), &mut ctx)?;
    let mut trainer = toy_trainer(&mut ctx)?;

    let controller = EnsembleRefinementController::new(RefinementConfig {
        aux_variance_ratio: 0.0,
        n_auxiliary_variables: 4,
        auxiliary_sampling_frequency: 0,
        ..config(dir.path(), 1, MemberSeeding::Distinct)
    })?;
    let output = controller.run(&mut model, &base, &mut trainer, &mut ctx)?;
    assert_eq!(output.members.len(), 1);
    assert_eq!(output.members[0].rounds.len(), 4);
    assert!(output.members[0].rounds.iter().all(|r| r.fine_tune.is_none()));

    let before = load_tensors(&base)?;
    let after = load_tensors(&output.members[0].path)?;
    for (key, t) in before.iter() {
        if key.contains(".posterior.loc") || key.contains(".posterior.untransformed_scale") {
            assert_eq!(to_host(t)?, to_host(&after[key])?, "{}", key);
        }
        if key.ends_with(".kl_cost") {
            assert_eq!(to_host(&after[key])?, vec![0.0]);
        }
        if key.ends_with(".prior.trainable") {
            // refinement freezes the prior even when nothing moves
            assert_eq!(to_host(&after[key])?, vec![0.0]);
        }
    }
    Ok(())
}

#[test]
fn distinct_seeds_give_distinct_members() -> anyhow::Result<()> {
    init_logger();
    let dir = tempfile::tempdir()?;
    let mut ctx = ExecutionContext::cpu(DType::F32, 4);
    let (mut model, base) = base_model(dir.path(), &mut ctx)?;
    let mut trainer = toy_trainer(&mut ctx)?;

    let controller =
        EnsembleRefinementController::new(config(dir.path(), 3, MemberSeeding::Distinct))?;
    let output = controller.run(&mut model, &base, &mut trainer, &mut ctx)?;

    assert_eq!(output.members.len(), 3);
    assert!(!output.cancelled && output.failed.is_empty());
    let digests: Vec<u64> = output
        .paths()
        .iter()
        .map(|p| checkpoint_digest(p))
        .collect::<anyhow::Result<_>>()?;
    assert_ne!(digests[0], digests[1]);
    assert_ne!(digests[1], digests[2]);
    assert_ne!(digests[0], digests[2]);

    for member in output.members.iter() {
        assert_eq!(member.rounds.len(), 3);
        assert!(member.rounds.last().map(|r| r.kl_cost.is_finite()).unwrap_or(false));
    }
    Ok(())
}

#[test]
fn shared_seed_gives_identical_members() -> anyhow::Result<()> {
    init_logger();
    let dir = tempfile::tempdir()?;
    let mut ctx = ExecutionContext::cpu(DType::F32, 5);
    let (mut model, base) = base_model(dir.path(), &mut ctx)?;
    let mut trainer = toy_trainer(&mut ctx)?;

    let controller =
        EnsembleRefinementController::new(config(dir.path(), 3, MemberSeeding::Shared))?;
    let output = controller.run(&mut model, &base, &mut trainer, &mut ctx)?;

    assert_eq!(output.members.len(), 3);
    let first = &output.members[0].digest;
    assert!(output.members.iter().all(|m| &m.digest == first));
    assert_ne!(checkpoint_digest(&output.members[0].path)?, checkpoint_digest(&base)?);
    Ok(())
}

/// Fails on the given call, trains normally otherwise.
struct FlakyTrainer {
    inner: ElboTrainer,
    calls: usize,
    fail_on: usize,
}

impl FineTune<BayesianMlp> for FlakyTrainer {
    fn fine_tune(
        &mut self,
        model: &mut BayesianMlp,
        ctx: &mut ExecutionContext,
        learning_rate: f64,
        steps: usize,
    ) -> anyhow::Result<FineTuneReport> {
        let call = self.calls;
        self.calls += 1;
        if call == self.fail_on {
            return Err(RefineError::non_finite("dense_1.kernel.posterior").into());
        }
        self.inner.fine_tune(model, ctx, learning_rate, steps)
    }
}

#[test]
fn numeric_failure_skip_and_abort() -> anyhow::Result<()> {
    init_logger();
    let dir = tempfile::tempdir()?;
    let mut ctx = ExecutionContext::cpu(DType::F32, 6);
    let (mut model, base) = base_model(dir.path(), &mut ctx)?;

    let one_round = |policy: NumericFailurePolicy| RefinementConfig {
        n_auxiliary_variables: 1,
        on_numeric_failure: policy,
        ..config(dir.path(), 3, MemberSeeding::Distinct)
    };

    let mut trainer = FlakyTrainer {
        inner: toy_trainer(&mut ctx)?,
        calls: 0,
        fail_on: 1,
    };
    let skip = EnsembleRefinementController::new(one_round(NumericFailurePolicy::Skip))?;
    let output = skip.run(&mut model, &base, &mut trainer, &mut ctx)?;
    assert_eq!(
        output.members.iter().map(|m| m.index).collect::<Vec<_>>(),
        vec![0, 2]
    );
    assert_eq!(output.failed.len(), 1);
    assert_eq!(output.failed[0].index, 1);
    assert!(!skip.config().member_path(1).exists());

    std::fs::remove_dir_all(dir.path().join("models"))?;
    trainer.calls = 0;
    let abort = EnsembleRefinementController::new(one_round(NumericFailurePolicy::Abort))?;
    let err = abort
        .run(&mut model, &base, &mut trainer, &mut ctx)
        .err()
        .ok_or_else(|| anyhow::anyhow!("expected failure"))?;
    assert_eq!(
        err.downcast_ref::<RefineError>(),
        Some(&RefineError::NumericInstability {
            tensor: "dense_1.kernel.posterior".into(),
            member: Some(1),
        })
    );
    assert!(!abort.config().member_path(1).exists());
    assert!(abort.config().member_path(0).exists());
    Ok(())
}

/// Trains normally, then writes NaN into the output kernel posterior
/// on the given call.
struct PoisoningTrainer {
    inner: ElboTrainer,
    calls: usize,
    poison_on: usize,
}

impl FineTune<BayesianMlp> for PoisoningTrainer {
    fn fine_tune(
        &mut self,
        model: &mut BayesianMlp,
        ctx: &mut ExecutionContext,
        learning_rate: f64,
        steps: usize,
    ) -> anyhow::Result<FineTuneReport> {
        let report = self.inner.fine_tune(model, ctx, learning_rate, steps)?;
        let call = self.calls;
        self.calls += 1;
        if call == self.poison_on {
            let posterior = &mut model.layers_mut()[1].kernel_mut().pair.posterior;
            let nan = (posterior.loc().ones_like()? * f64::NAN)?;
            let raw = posterior.untransformed_scale().clone();
            posterior.set(&nan, &raw)?;
        }
        Ok(report)
    }
}

#[test]
fn non_finite_weights_are_never_persisted() -> anyhow::Result<()> {
    init_logger();
    let dir = tempfile::tempdir()?;
    let mut ctx = ExecutionContext::cpu(DType::F32, 9);
    let (mut model, base) = base_model(dir.path(), &mut ctx)?;

    let one_round = |policy: NumericFailurePolicy| RefinementConfig {
        n_auxiliary_variables: 1,
        on_numeric_failure: policy,
        ..config(dir.path(), 2, MemberSeeding::Distinct)
    };
    let mut trainer = PoisoningTrainer {
        inner: toy_trainer(&mut ctx)?,
        calls: 0,
        poison_on: 0,
    };

    let skip = EnsembleRefinementController::new(one_round(NumericFailurePolicy::Skip))?;
    let output = skip.run(&mut model, &base, &mut trainer, &mut ctx)?;
    assert_eq!(output.failed.len(), 1);
    assert_eq!(output.failed[0].index, 0);
    assert!(output.failed[0].reason.contains("dense_1.kernel.posterior"));
    assert!(!skip.config().member_path(0).exists());
    // the next member starts again from the finite base checkpoint
    assert_eq!(output.members.len(), 1);
    assert_eq!(output.members[0].index, 1);

    std::fs::remove_dir_all(dir.path().join("models"))?;
    trainer.calls = 0;
    let abort = EnsembleRefinementController::new(one_round(NumericFailurePolicy::Abort))?;
    let err = abort
        .run(&mut model, &base, &mut trainer, &mut ctx)
        .err()
        .ok_or_else(|| anyhow::anyhow!("expected failure"))?;
    assert_eq!(
        err.downcast_ref::<RefineError>(),
        Some(&RefineError::NumericInstability {
            tensor: "dense_1.kernel.posterior".into(),
            member: Some(0),
        })
    );
    assert!(!abort.config().member_path(0).exists());
    Ok(())
}

/// Fires the shared cancel token before the given call.
struct InterruptedTrainer {
    inner: ElboTrainer,
    cancel: CancelToken,
    calls: usize,
    cancel_on: usize,
}

impl FineTune<BayesianMlp> for InterruptedTrainer {
    fn fine_tune(
        &mut self,
        model: &mut BayesianMlp,
        ctx: &mut ExecutionContext,
        learning_rate: f64,
        steps: usize,
    ) -> anyhow::Result<FineTuneReport> {
        if self.calls == self.cancel_on {
            self.cancel.cancel();
        }
        self.calls += 1;
        self.inner.fine_tune(model, ctx, learning_rate, steps)
    }
}

#[test]
fn interrupted_fine_tune_stops_and_drops_member() -> anyhow::Result<()> {
    init_logger();
    let dir = tempfile::tempdir()?;
    let mut ctx = ExecutionContext::cpu(DType::F32, 10);
    let (mut model, base) = base_model(dir.path(), &mut ctx)?;

    let cancel = CancelToken::new();
    let mut trainer = InterruptedTrainer {
        inner: toy_trainer(&mut ctx)?.with_cancel_token(cancel.clone()),
        cancel: cancel.clone(),
        calls: 0,
        // last round of the second member
        cancel_on: 5,
    };

    let controller =
        EnsembleRefinementController::new(config(dir.path(), 3, MemberSeeding::Distinct))?
            .with_cancel_token(cancel);
    let output = controller.run(&mut model, &base, &mut trainer, &mut ctx)?;

    assert!(output.cancelled);
    assert_eq!(output.members.len(), 1);
    assert_eq!(output.members[0].index, 0);
    assert!(output.members[0]
        .rounds
        .iter()
        .all(|r| r.fine_tune.as_ref().map(|f| f.steps) == Some(4)));
    assert!(!controller.config().member_path(1).exists());
    assert_eq!(trainer.calls, 6);
    Ok(())
}

#[test]
fn cancelled_run_persists_nothing() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut ctx = ExecutionContext::cpu(DType::F32, 7);
    let (mut model, base) = base_model(dir.path(), &mut ctx)?;
    let mut trainer = toy_trainer(&mut ctx)?;

    let token = CancelToken::new();
    token.cancel();
    let controller =
        EnsembleRefinementController::new(config(dir.path(), 2, MemberSeeding::Distinct))?
            .with_cancel_token(token);
    let output = controller.run(&mut model, &base, &mut trainer, &mut ctx)?;

    assert!(output.cancelled);
    assert!(output.members.is_empty());
    assert!(!controller.config().member_path(0).exists());
    Ok(())
}

#[test]
fn missing_base_checkpoint_is_persistence_error() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut ctx = ExecutionContext::cpu(DType::F32, 8);
    let mut model = BayesianMlp::new(shape(), &mut ctx)?;
    let mut trainer = toy_trainer(&mut ctx)?;

    let controller =
        EnsembleRefinementController::new(config(dir.path(), 1, MemberSeeding::Distinct))?;
    let err = controller
        .run(&mut model, &dir.path().join("absent.safetensors"), &mut trainer, &mut ctx)
        .err()
        .ok_or_else(|| anyhow::anyhow!("expected failure"))?;
    assert!(matches!(
        err.downcast_ref::<RefineError>(),
        Some(RefineError::Persistence { .. })
    ));
    Ok(())
}
