use candle_core::{Device, Tensor};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::Path;

use crate::error::RefineError;
use crate::refine::gaussian_param::{to_host, GaussianParam, WeightTensor};

pub type TensorMap = HashMap<String, Tensor>;

/// Keyed snapshot of a model's refinement state.
///
/// `save` followed by `load` restores every loc, scale, trainable flag
/// and KL cost exactly. Both directions report failures as
/// `RefineError::Persistence`.
pub trait Checkpoint {
    /// Every persisted tensor by key, on the CPU.
    fn state(&self) -> anyhow::Result<TensorMap>;

    /// Overwrite the live values. Implementations check every key and
    /// shape before writing anything.
    fn restore(&mut self, state: &TensorMap) -> anyhow::Result<()>;

    fn save(&self, path: &Path) -> anyhow::Result<()> {
        save_tensors(&self.state()?, path)
    }

    fn load(&mut self, path: &Path) -> anyhow::Result<()> {
        let state = load_tensors(path)?;
        self.restore(&state)
            .map_err(|e| RefineError::persistence(path, e).into())
    }
}

/// Write tensors to a safetensors file, creating parent directories.
pub fn save_tensors(tensors: &TensorMap, path: &Path) -> anyhow::Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir).map_err(|e| RefineError::persistence(path, e))?;
        }
    }
    candle_core::safetensors::save(tensors, path)
        .map_err(|e| RefineError::persistence(path, e).into())
}

pub fn load_tensors(path: &Path) -> anyhow::Result<TensorMap> {
    candle_core::safetensors::load(path, &Device::Cpu)
        .map_err(|e| RefineError::persistence(path, e).into())
}

/// Content hash of a checkpoint file: keys in sorted order, each with
/// its shape and the bit patterns of its values.
pub fn checkpoint_digest(path: &Path) -> anyhow::Result<u64> {
    let state = load_tensors(path)?;
    let mut keys: Vec<&String> = state.keys().collect();
    keys.sort();

    let mut hasher = DefaultHasher::new();
    for key in keys {
        let t = &state[key];
        key.hash(&mut hasher);
        t.dims().hash(&mut hasher);
        for v in to_host(t)? {
            v.to_bits().hash(&mut hasher);
        }
    }
    Ok(hasher.finish())
}

pub fn digest_hex(digest: u64) -> String {
    format!("{:016x}", digest)
}

//////////////////////////////////////////
// per-tensor keys                      //
//////////////////////////////////////////

fn param_keys(param: &GaussianParam) -> [String; 3] {
    [
        format!("{}.loc", param.name()),
        format!("{}.untransformed_scale", param.name()),
        format!("{}.trainable", param.name()),
    ]
}

fn kl_cost_key(weight: &WeightTensor) -> String {
    format!("{}.kl_cost", weight.name)
}

fn cpu(t: &Tensor) -> candle_core::Result<Tensor> {
    t.to_device(&Device::Cpu)
}

/// Add a weight tensor's prior, posterior and KL cost to `out`.
pub fn write_weight_state(weight: &WeightTensor, out: &mut TensorMap) -> anyhow::Result<()> {
    for param in [&weight.pair.prior, &weight.pair.posterior] {
        let [loc, raw, trainable] = param_keys(param);
        out.insert(loc, cpu(param.loc())?);
        out.insert(raw, cpu(param.untransformed_scale())?);
        out.insert(
            trainable,
            Tensor::new(param.is_trainable() as u8, &Device::Cpu)?,
        );
    }
    out.insert(
        kl_cost_key(weight),
        Tensor::new(weight.kl_cost.value(), &Device::Cpu)?,
    );
    Ok(())
}

fn lookup<'a>(state: &'a TensorMap, key: &str, dims: &[usize]) -> anyhow::Result<&'a Tensor> {
    let t = state
        .get(key)
        .ok_or_else(|| RefineError::invalid(format!("missing key `{}`", key)))?;
    if t.dims() != dims {
        return Err(RefineError::invalid(format!(
            "`{}` has shape {:?}, expected {:?}",
            key,
            t.dims(),
            dims
        ))
        .into());
    }
    Ok(t)
}

/// Check that `state` holds every key of `weight` with matching shapes.
pub fn check_weight_state(weight: &WeightTensor, state: &TensorMap) -> anyhow::Result<()> {
    for param in [&weight.pair.prior, &weight.pair.posterior] {
        let [loc, raw, trainable] = param_keys(param);
        lookup(state, &loc, param.dims())?;
        lookup(state, &raw, param.dims())?;
        lookup(state, &trainable, &[])?;
    }
    lookup(state, &kl_cost_key(weight), &[])?;
    Ok(())
}

/// Overwrite a weight tensor from `state`; call `check_weight_state` first.
pub fn read_weight_state(weight: &mut WeightTensor, state: &TensorMap) -> anyhow::Result<()> {
    let kl_cost = to_host(lookup(state, &kl_cost_key(weight), &[])?)?[0];

    for param in [&mut weight.pair.prior, &mut weight.pair.posterior] {
        let [loc, raw, trainable] = param_keys(param);
        let dims = param.dims().to_vec();
        let loc = lookup(state, &loc, &dims)?.clone();
        let raw = lookup(state, &raw, &dims)?.clone();
        let trainable = to_host(lookup(state, &trainable, &[])?)?[0] != 0.0;
        param.set(&loc, &raw)?;
        param.restore_trainable(trainable);
    }

    weight.kl_cost.restore(kl_cost);
    Ok(())
}
