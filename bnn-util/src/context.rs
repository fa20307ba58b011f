use candle_core::{DType, Device, Shape, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Explicit execution state threaded through every stochastic call:
/// the numeric backend (device + dtype) and the pseudo-random generator.
///
/// Nothing in this crate draws from a global rng. Two contexts created
/// with the same seed produce the same sequence of draws.
pub struct ExecutionContext {
    device: Device,
    dtype: DType,
    rng: StdRng,
}

impl ExecutionContext {
    pub fn new(device: Device, dtype: DType, seed: u64) -> Self {
        Self {
            device,
            dtype,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn cpu(dtype: DType, seed: u64) -> Self {
        Self::new(Device::Cpu, dtype, seed)
    }

    /// Replace the generator; used at the start of each ensemble member.
    pub fn reseed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    /// One standard normal draw on the host.
    pub fn std_normal(&mut self) -> f64 {
        self.rng.sample(StandardNormal)
    }

    /// Standard normal draws, row-major order, on the host.
    pub fn std_normal_vec(&mut self, n: usize) -> Vec<f64> {
        (0..n).map(|_| self.rng.sample(StandardNormal)).collect()
    }

    /// `N(mean, stdev^2)` tensor in the context dtype and device.
    ///
    /// Built on the CPU first (Metal can't convert from F64 on device).
    pub fn randn<S: Into<Shape>>(
        &mut self,
        mean: f64,
        stdev: f64,
        shape: S,
    ) -> candle_core::Result<Tensor> {
        let shape: Shape = shape.into();
        let values: Vec<f64> = self
            .std_normal_vec(shape.elem_count())
            .into_iter()
            .map(|z| mean + stdev * z)
            .collect();
        self.host_tensor(values, shape)
    }

    /// Move host values into a tensor of the context dtype and device.
    pub fn host_tensor<S: Into<Shape>>(
        &self,
        values: Vec<f64>,
        shape: S,
    ) -> candle_core::Result<Tensor> {
        Tensor::from_vec(values, shape, &Device::Cpu)?
            .to_dtype(self.dtype)?
            .to_device(&self.device)
    }

    /// `n` row indices drawn uniformly with replacement from `0..ntot`
    pub fn sample_indices(&mut self, ntot: usize, n: usize) -> Vec<u32> {
        (0..n)
            .map(|_| self.rng.random_range(0..ntot) as u32)
            .collect()
    }
}

/// Machine epsilon of a tensor dtype, added to every softplus scale.
pub fn dtype_epsilon(dtype: DType) -> f64 {
    match dtype {
        DType::F64 => f64::EPSILON,
        DType::F16 => 9.765_625e-4,
        DType::BF16 => 7.812_5e-3,
        _ => f32::EPSILON as f64,
    }
}

/// Cooperative cancellation for long ensemble runs.
///
/// Checked by the controller at the top of every member and every
/// refinement round; an optional deadline turns into cancellation once
/// it has passed.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel once `limit` has elapsed. A limit past the end of the
    /// clock's range means no deadline.
    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.deadline = Instant::now().checked_add(limit);
        self
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.flag.load(Ordering::SeqCst) {
            return true;
        }
        matches!(self.deadline, Some(d) if Instant::now() >= d)
    }

    /// Shared flag, e.g. for a signal handler.
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.flag)
    }
}
