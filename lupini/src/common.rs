use crate::data::Standardizer;

use bnn_util::bayes_mlp::{BayesianMlp, MlpShape};
use bnn_util::context::ExecutionContext;
use bnn_util::metrics::{ensemble_metrics, EnsembleMetrics};
use bnn_util::refine::{EnsembleOutput, RefinementConfig};
use bnn_util::trainer::ElboTrainer;
use candle_core::{DType, Device};
use clap::ValueEnum;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const MANIFEST_FILE: &str = "manifest.json";

pub fn init_logger(verbose: bool) {
    if verbose {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();
}

#[derive(ValueEnum, Clone, Debug, PartialEq)]
#[clap(rename_all = "lowercase")]
pub enum ComputeDevice {
    Cpu,
    Cuda,
    Metal,
}

/// Requested device, or the CPU when it cannot be opened
pub fn select_device(dev: &ComputeDevice) -> Device {
    let requested = match dev {
        ComputeDevice::Cpu => return Device::Cpu,
        ComputeDevice::Cuda => Device::new_cuda(0),
        ComputeDevice::Metal => Device::new_metal(0),
    };
    requested.unwrap_or_else(|e| {
        warn!("{:?} unavailable ({}), falling back to cpu", dev, e);
        Device::Cpu
    })
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[clap(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    F32,
    F64,
}

impl Precision {
    pub fn dtype(self) -> DType {
        match self {
            Precision::F32 => DType::F32,
            Precision::F64 => DType::F64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitMetrics {
    pub train: EnsembleMetrics,
    pub test: Option<EnsembleMetrics>,
}

/// Score `files` (or the live model) on the trainer's train and
/// validation data.
pub fn split_metrics(
    model: &mut BayesianMlp,
    ctx: &mut ExecutionContext,
    trainer: &ElboTrainer,
    files: &[PathBuf],
) -> anyhow::Result<SplitMetrics> {
    let data = trainer.train_data();
    let train = ensemble_metrics(model, ctx, &data.x_nd, &data.y_n1, files)?;
    let test = match trainer.validation_data() {
        Some(data) => Some(ensemble_metrics(model, ctx, &data.x_nd, &data.y_n1, files)?),
        None => None,
    };
    Ok(SplitMetrics { train, test })
}

fn log_metrics(split: &str, m: &EnsembleMetrics) {
    info!(
        "  {}: log-likelihood = {:.4}, rmse = {:.4}, member log-likelihood = {:.4} ({} member(s))",
        split, m.log_likelihood, m.rmse, m.member_log_likelihood, m.members
    );
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricGroups {
    pub base: SplitMetrics,
    pub overtrained: Option<SplitMetrics>,
    pub auxiliary: Option<SplitMetrics>,
}

impl MetricGroups {
    pub fn log(&self) {
        let groups = [
            ("Base model", Some(&self.base)),
            ("Overtrained model", self.overtrained.as_ref()),
            ("Auxiliary sampling", self.auxiliary.as_ref()),
        ];
        for (name, group) in groups {
            let Some(group) = group else { continue };
            info!("{}", name);
            log_metrics("train", &group.train);
            if let Some(test) = &group.test {
                log_metrics("test", test);
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSummary {
    pub training_steps: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub seed: u64,
    pub precision: Precision,
}

/// Everything needed to rebuild and re-score a fitted ensemble.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub training: TrainingSummary,
    pub refinement: RefinementConfig,
    pub model: MlpShape,
    pub standardizer: Standardizer,
    pub base_model: PathBuf,
    pub base_digest: String,
    pub ensemble: EnsembleOutput,
    pub metrics: MetricGroups,
}

impl Manifest {
    pub fn write(&self, path: &Path) -> anyhow::Result<()> {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(file), self)?;
        Ok(())
    }

    pub fn read(path: &Path) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path)
            .map_err(|e| anyhow::anyhow!("failed to open {:?}: {}", path, e))?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }

    /// Member checkpoints, looked up next to the manifest when the
    /// recorded path does not exist from the current directory.
    pub fn member_files(&self, manifest_dir: &Path) -> Vec<PathBuf> {
        self.ensemble
            .paths()
            .into_iter()
            .map(|p| {
                if p.exists() {
                    return p;
                }
                match p.file_name() {
                    Some(name) => manifest_dir.join("models").join(name),
                    None => p,
                }
            })
            .collect()
    }
}
