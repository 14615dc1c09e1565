//! Reverse diffusion with online system identification.
//!
//! Instead of denoising a free tensor, the sampler denoises the output of a
//! parametric [`DynamicalSystem`]. At every sub-sampled reverse step the
//! denoiser's clean estimate becomes a regression target, the system's two
//! control coefficients take one Adam step towards it, and the re-evaluated
//! system becomes the next trajectory:
//!
//! ```text
//! traj  = normalize(f(aux₀; φ))
//! for i = S-1 ..= 0:
//!     ε̂     = ε̂(traj, tᵢ)                         (no gradient)
//!     x̂₀    = clamp((traj − sqrt(1 − ᾱᵢ)·ε̂) / sqrt(ᾱᵢ), −1, 1)
//!     loss  = mse(traj[:, :2], x̂₀[:, :2])
//!     φ     ← adam(φ, ∇φ loss)
//!     traj  = normalize(f(x̂₀[0, 2]; φ))
//! field = f(aux; φ)
//! ```
//!
//! Only the first two channels are rescaled by [`normalize_dynamics`]; the
//! auxiliary channel is carried as is.

use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;

use crate::config::SamplerConfig;
use crate::denoiser::Denoiser;
use crate::diffusion::{GaussianDiffusion, SamplingSchedule, standard_normal, x0_from_xt_eps};
use crate::logger::LossLogger;
use crate::system::{CoefficientValues, Coefficients, DynamicalSystem, Grid};
use crate::{Error, Result};

/// Lower bound on the normalization divisor.
pub const NORM_FLOOR: f32 = 1e-8;

/// Number of leading channels that carry dynamics.
pub const DYNAMICS_CHANNELS: usize = 2;

/// One reverse step of the fitting loop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StepRecord {
    /// Position in the sub-sampled schedule.
    pub sub_index: usize,
    /// Timestep of the full schedule passed to the denoiser.
    pub timestep: usize,
    pub loss: f32,
    /// Coefficients after this step's update.
    pub coefficients: CoefficientValues,
}

#[derive(Debug)]
pub struct SampleOutput {
    /// Final `(3, n, n)` field, not normalized.
    pub field: Tensor,
    pub coefficients: CoefficientValues,
    pub trace: Vec<StepRecord>,
    pub logger: LossLogger,
}

/// Runs the fitting loop over a fixed sub-sampled schedule.
#[derive(Debug, Clone)]
pub struct SystemIdSampler {
    config: SamplerConfig,
    sampling: SamplingSchedule,
}

impl SystemIdSampler {
    pub fn new(diffusion: &GaussianDiffusion, config: SamplerConfig) -> Result<Self> {
        config.validate()?;
        let sampling = diffusion.sampling_schedule(config.sampling_steps)?;
        Ok(Self { config, sampling })
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    pub fn sampling_schedule(&self) -> &SamplingSchedule {
        &self.sampling
    }

    /// Build the configured system on a fresh grid and sample once.
    pub fn sample<D>(&self, model: &D, device: &Device) -> Result<SampleOutput>
    where
        D: Denoiser + ?Sized,
    {
        let seed = self.seed();
        tracing::info!("Sampling {} with seed {}", self.config.system, seed);
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        self.sample_seeded(model, device, &mut rng)
    }

    /// Independent runs stacked into `(count, 3, n, n)`. Run `k` uses seed `seed + k`.
    pub fn sample_runs<D>(&self, model: &D, device: &Device, count: usize) -> Result<Tensor>
    where
        D: Denoiser + ?Sized,
    {
        if count == 0 {
            return Err(Error::config("run count must be positive"));
        }
        let base = self.seed();
        let mut fields = Vec::with_capacity(count);
        for run in 0..count {
            let seed = base.wrapping_add(run as u64);
            tracing::info!("Run {}/{} ({}, seed {})", run + 1, count, self.config.system, seed);
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let output = self.sample_seeded(model, device, &mut rng)?;
            fields.push(output.field);
        }
        Ok(Tensor::stack(&fields, 0)?)
    }

    /// Run the loop on an existing system. Its coefficients are updated in place.
    pub fn sample_with<D, S, R>(&self, model: &D, system: &mut S, rng: &mut R) -> Result<SampleOutput>
    where
        D: Denoiser + ?Sized,
        S: DynamicalSystem + ?Sized,
        R: Rng,
    {
        let n = system.grid().size();
        let device = system.grid().device().clone();
        let coefficients = system.coefficients().clone();
        let steps = self.sampling.timesteps.len();

        let params = ParamsAdamW {
            lr: self.config.learning_rate,
            weight_decay: 0.0,
            ..Default::default()
        };
        let mut optimizer = AdamW::new(coefficients.vars(), params)?;
        let mut logger = LossLogger::new(steps);
        let mut trace = Vec::with_capacity(steps);

        tracing::debug!(
            "{}: {} reverse steps on a {}x{} grid, lr {}",
            system.name(),
            steps,
            n,
            n,
            self.config.learning_rate
        );

        let mut auxiliary = standard_normal((n, n), &device, rng)?;
        let mut trajectory = normalize_dynamics(&system.evaluate(&auxiliary)?.unsqueeze(0)?)?;

        for (step, (sub_index, &timestep)) in self.sampling.timesteps.iter().enumerate().rev().enumerate() {
            let (loss, next_auxiliary) =
                self.fit_step(model, &mut optimizer, &coefficients, &trajectory, sub_index, timestep)?;
            let values = coefficients.values()?;

            let display = self.config.log_every > 0 && (step + 1) % self.config.log_every == 0;
            logger.log(loss as f64, display);
            tracing::debug!(
                "t={} loss={:.6} phi1={:.5} phi2={:.5}",
                timestep,
                loss,
                values.phi1,
                values.phi2
            );
            trace.push(StepRecord {
                sub_index,
                timestep,
                loss,
                coefficients: values,
            });

            auxiliary = next_auxiliary;
            trajectory = normalize_dynamics(&system.evaluate(&auxiliary)?.unsqueeze(0)?)?;
        }

        let field = system.evaluate(&auxiliary)?.detach();
        let coefficients = coefficients.values()?;
        tracing::info!(
            "Finished {}: phi1={:.5} phi2={:.5}, loss (ema) {:.4}",
            system.name(),
            coefficients.phi1,
            coefficients.phi2,
            logger.ema().unwrap_or(f64::NAN)
        );

        Ok(SampleOutput {
            field,
            coefficients,
            trace,
            logger,
        })
    }

    /// One denoise/regress/update round. Returns the loss and the next auxiliary channel.
    fn fit_step<D>(
        &self,
        model: &D,
        optimizer: &mut AdamW,
        coefficients: &Coefficients,
        trajectory: &Tensor,
        sub_index: usize,
        timestep: usize,
    ) -> Result<(f32, Tensor)>
    where
        D: Denoiser + ?Sized,
    {
        let batch = trajectory.dim(0)?;
        let t = Tensor::full(timestep as u32, (batch,), trajectory.device())?;

        let eps = model
            .predict_noise(&trajectory.detach(), &t)?
            .detach()
            .to_dtype(DType::F32)?;
        // x̂₀ stays on the graph; the clamp cuts its gradient where it saturates.
        let x0_hat = x0_from_xt_eps(trajectory, &eps, &vec![sub_index; batch], &self.sampling.schedule)?;
        let target = x0_hat.narrow(1, 0, DYNAMICS_CHANNELS)?;
        let auxiliary = x0_hat.get(0)?.get(DYNAMICS_CHANNELS)?.detach();

        let loss = (trajectory.narrow(1, 0, DYNAMICS_CHANNELS)? - target)?
            .sqr()?
            .mean_all()?;
        let value = loss.to_dtype(DType::F32)?.to_scalar::<f32>()?;

        let mut grads = loss.backward()?;
        // A coefficient whose gradient vanishes is left untouched, moments included.
        for var in [coefficients.phi1(), coefficients.phi2()] {
            let vanishing = match grads.get(var) {
                Some(grad) => grad.abs()?.sum_all()?.to_dtype(DType::F32)?.to_scalar::<f32>()? == 0.0,
                None => true,
            };
            if vanishing {
                grads.remove(var);
            }
        }
        optimizer.step(&grads)?;

        Ok((value, auxiliary))
    }

    fn seed(&self) -> u64 {
        self.config.seed.unwrap_or_else(|| rand::rng().random())
    }

    fn sample_seeded<D>(&self, model: &D, device: &Device, rng: &mut ChaCha8Rng) -> Result<SampleOutput>
    where
        D: Denoiser + ?Sized,
    {
        let grid = Grid::new(self.config.grid_size, device)?;
        let mut system = self.config.system.build(grid, rng)?;
        self.sample_with(model, system.as_mut(), rng)
    }
}

/// Divide the dynamics channels of a `(B, C, H, W)` field by their peak magnitude.
///
/// The peak is taken over the whole batch and floored at [`NORM_FLOOR`]. It is
/// a constant of the graph, so gradients flow through the division only.
pub fn normalize_dynamics(field: &Tensor) -> Result<Tensor> {
    let channels = field.dim(1)?;
    if channels <= DYNAMICS_CHANNELS {
        return Err(Error::shape(format!(
            "expected more than {DYNAMICS_CHANNELS} channels, got {channels}"
        )));
    }
    let dynamics = field.narrow(1, 0, DYNAMICS_CHANNELS)?;
    let auxiliary = field.narrow(1, DYNAMICS_CHANNELS, channels - DYNAMICS_CHANNELS)?;

    let peak = dynamics
        .detach()
        .abs()?
        .flatten_all()?
        .max(0)?
        .to_dtype(DType::F32)?
        .to_scalar::<f32>()?;
    let norm = peak.max(NORM_FLOOR) as f64;

    Ok(Tensor::cat(&[(dynamics / norm)?, auxiliary], 1)?)
}
