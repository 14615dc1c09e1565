//! Gaussian diffusion process over a [`Schedule`].
//!
//! Cosine schedule for betas (Nichol & Dhariwal, arXiv:2102.09672) and the
//! epsilon parameterization of Ho et al. (arXiv:2006.11239):
//!
//! ```text
//! x_t    = sqrt(ᾱ_t)·x_0 + sqrt(1 − ᾱ_t)·ε
//! x̂_0    = clamp((x_t − sqrt(1 − ᾱ_t)·ε̂) / sqrt(ᾱ_t), −1, 1)
//! μ̃_t    = sqrt(ᾱ_t)·β_t / ((1 − ᾱ_t)·sqrt(α_t)) · x_0
//!        + (α_t − ᾱ_t) / ((1 − ᾱ_t)·sqrt(α_t)) · x_t
//! ```
//!
//! Every function takes one timestep per batch element and broadcasts the
//! per-example scalar across the remaining dimensions.

pub mod forward;

use candle_core::{Device, Shape, Tensor};
use rand::Rng;
use rand_distr::StandardNormal;

pub use forward::{add_noise, add_noise_with};

use crate::config::DiffusionConfig;
use crate::schedule::{Schedule, VarianceSchedule, spaced_timesteps};
use crate::{Error, Result};

/// A full-length schedule plus the operations defined on it.
#[derive(Debug, Clone)]
pub struct GaussianDiffusion {
    schedule: Schedule,
}

/// Sub-sampled timesteps and the schedule rebuilt over them.
#[derive(Debug, Clone)]
pub struct SamplingSchedule {
    /// Strictly increasing timesteps of the full schedule, ending at `T-1`.
    pub timesteps: Vec<usize>,
    /// Schedule indexed by position in `timesteps`.
    pub schedule: Schedule,
}

impl GaussianDiffusion {
    pub fn new(config: &DiffusionConfig) -> Result<Self> {
        let schedule = config.schedule.build(config.num_train_timesteps)?;
        Ok(Self { schedule })
    }

    /// Build with an arbitrary retention function.
    pub fn with_variance<V>(num_steps: usize, variance: &V) -> Result<Self>
    where
        V: VarianceSchedule + ?Sized,
    {
        Ok(Self {
            schedule: Schedule::build(num_steps, variance)?,
        })
    }

    pub fn from_schedule(schedule: Schedule) -> Self {
        Self { schedule }
    }

    pub fn num_timesteps(&self) -> usize {
        self.schedule.len()
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    /// Evenly spaced sub-schedule for accelerated sampling.
    pub fn sampling_schedule(&self, sampling_steps: usize) -> Result<SamplingSchedule> {
        let timesteps = spaced_timesteps(self.num_timesteps(), sampling_steps)?;
        let schedule = self.schedule.resample(&timesteps)?;
        Ok(SamplingSchedule {
            timesteps,
            schedule,
        })
    }

    /// One forward (noising) step; returns `(x_t, ε)`.
    pub fn sample_from_forward_process<R: Rng>(
        &self,
        x0: &Tensor,
        t: &[usize],
        rng: &mut R,
    ) -> Result<(Tensor, Tensor)> {
        add_noise(x0, t, &self.schedule, rng)
    }
}

/// Reconstruct the clean sample from `x_t` and predicted noise, clamped to [-1, 1].
pub fn x0_from_xt_eps(xt: &Tensor, eps: &Tensor, t: &[usize], schedule: &Schedule) -> Result<Tensor> {
    ensure_same_shape(xt, eps, "predicted noise")?;
    schedule.check_timesteps(t)?;

    let alpha_bar = schedule.alpha_bar();
    let inv_signal = per_example(t, xt, |s| 1.0 / (alpha_bar[s] as f64).sqrt())?;
    let noise = per_example(t, xt, |s| (1.0 - alpha_bar[s] as f64).sqrt())?;

    let x0 = (xt - eps.broadcast_mul(&noise)?)?.broadcast_mul(&inv_signal)?;
    Ok(x0.clamp(-1f32, 1f32)?)
}

/// Mean of the posterior `q(x_{t-1} | x_t, x_0)`.
pub fn posterior_mean(xt: &Tensor, x0: &Tensor, t: &[usize], schedule: &Schedule) -> Result<Tensor> {
    ensure_same_shape(xt, x0, "clean estimate")?;
    schedule.check_timesteps(t)?;

    let alpha_bar = schedule.alpha_bar();
    let alpha = schedule.alpha();
    let beta = schedule.beta();
    let denom = |s: usize| (1.0 - alpha_bar[s] as f64) * (alpha[s] as f64).sqrt();

    let x0_coef = per_example(t, xt, |s| {
        (alpha_bar[s] as f64).sqrt() * beta[s] as f64 / denom(s)
    })?;
    let xt_coef = per_example(t, xt, |s| (alpha[s] as f64 - alpha_bar[s] as f64) / denom(s))?;

    Ok((x0.broadcast_mul(&x0_coef)? + xt.broadcast_mul(&xt_coef)?)?)
}

/// `(B, 1, ..., 1)` tensor of one scalar per batch element, in `like`'s dtype.
pub(crate) fn per_example(t: &[usize], like: &Tensor, f: impl Fn(usize) -> f64) -> Result<Tensor> {
    let batch = like.dim(0)?;
    if t.len() != batch {
        return Err(Error::shape(format!(
            "expected one timestep per batch element ({batch}), got {}",
            t.len()
        )));
    }
    let mut dims = vec![1usize; like.rank()];
    dims[0] = batch;
    let values: Vec<f32> = t.iter().map(|&s| f(s) as f32).collect();
    Ok(Tensor::from_vec(values, dims, like.device())?.to_dtype(like.dtype())?)
}

/// Standard-normal `f32` tensor drawn from `rng`.
pub(crate) fn standard_normal<R: Rng>(
    shape: impl Into<Shape>,
    device: &Device,
    rng: &mut R,
) -> Result<Tensor> {
    let shape = shape.into();
    let values: Vec<f32> = (0..shape.elem_count())
        .map(|_| rng.sample(StandardNormal))
        .collect();
    Ok(Tensor::from_vec(values, shape, device)?)
}

fn ensure_same_shape(expected: &Tensor, got: &Tensor, what: &str) -> Result<()> {
    if expected.dims() != got.dims() {
        return Err(Error::shape(format!(
            "{what} has shape {:?}, expected {:?}",
            got.dims(),
            expected.dims()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn synthetic(alpha_bar: f64) -> Schedule {
        Schedule::from_betas(&[1.0 - alpha_bar]).unwrap()
    }

    #[test]
    fn zero_noise_reconstruction_divides_by_sqrt_alpha_bar() {
        let schedule = synthetic(0.25);
        let xt = Tensor::full(0.4f32, (1, 3, 4, 4), &Device::Cpu).unwrap();
        let eps = xt.zeros_like().unwrap();
        let x0 = x0_from_xt_eps(&xt, &eps, &[0], &schedule).unwrap();
        for v in x0.flatten_all().unwrap().to_vec1::<f32>().unwrap() {
            assert!((v - 0.8).abs() < 1e-6, "x0 = {v}");
        }
    }

    #[test]
    fn reconstruction_is_clamped() {
        let schedule = synthetic(0.25);
        let xt = Tensor::new(&[[0.6f32, -0.7, 0.1]], &Device::Cpu).unwrap();
        let eps = xt.zeros_like().unwrap();
        let x0 = x0_from_xt_eps(&xt, &eps, &[0], &schedule)
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();
        assert_eq!(x0[0][0], 1.0);
        assert_eq!(x0[0][1], -1.0);
        assert!((x0[0][2] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn reconstruction_inverts_forward_process() {
        let schedule = Schedule::build(100, &crate::schedule::CosineSchedule).unwrap();
        let x0 = Tensor::new(&[[0.5f32, -0.25], [0.1, 0.9]], &Device::Cpu).unwrap();
        let eps = Tensor::new(&[[1.0f32, -0.5], [0.3, 2.0]], &Device::Cpu).unwrap();
        let t = [10, 40];
        let xt = add_noise_with(&x0, &eps, &t, &schedule).unwrap();
        let back = x0_from_xt_eps(&xt, &eps, &t, &schedule).unwrap();
        let diff = (back - &x0)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-4, "max diff {diff}");
    }

    #[test]
    fn reconstruction_rejects_mismatched_noise() {
        let schedule = synthetic(0.5);
        let xt = Tensor::zeros((1, 3, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let eps = Tensor::zeros((1, 2, 4, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            x0_from_xt_eps(&xt, &eps, &[0], &schedule),
            Err(Error::Shape(_))
        ));
    }

    #[test]
    fn out_of_range_timestep_is_rejected() {
        let schedule = synthetic(0.5);
        let xt = Tensor::zeros((1, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            x0_from_xt_eps(&xt, &xt, &[1], &schedule),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn posterior_mean_matches_closed_form() {
        let schedule = Schedule::from_betas(&[0.1, 0.2, 0.3]).unwrap();
        let xt = Tensor::full(0.5f32, (1, 2), &Device::Cpu).unwrap();
        let x0 = Tensor::full(-0.25f32, (1, 2), &Device::Cpu).unwrap();
        let mean = posterior_mean(&xt, &x0, &[2], &schedule)
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();

        let (alpha, beta) = (0.7f64, 0.3f64);
        let alpha_bar = 0.9 * 0.8 * 0.7;
        let denom = (1.0 - alpha_bar) * alpha.sqrt();
        let expected =
            alpha_bar.sqrt() * beta / denom * -0.25 + (alpha - alpha_bar) / denom * 0.5;
        assert!((mean[0][0] as f64 - expected).abs() < 1e-5, "{} vs {expected}", mean[0][0]);
    }

    #[test]
    fn posterior_mean_at_clean_estimate_is_consistent() {
        // With x_t = sqrt(ᾱ)·x_0 exactly, the posterior mean equals sqrt(ᾱ_{t-1})·x_0.
        let schedule = Schedule::from_betas(&[0.1, 0.2]).unwrap();
        let x0 = Tensor::full(0.5f32, (1, 1), &Device::Cpu).unwrap();
        let alpha_bar = schedule.alpha_bar();
        let xt = (&x0 * (alpha_bar[1] as f64).sqrt()).unwrap();
        let mean = posterior_mean(&xt, &x0, &[1], &schedule)
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();
        let expected = 0.5 * (alpha_bar[0] as f64).sqrt();
        assert!((mean[0][0] as f64 - expected).abs() < 1e-5);
    }

    #[test]
    fn sampling_schedule_is_consistent() {
        let diffusion = GaussianDiffusion::new(&DiffusionConfig::default()).unwrap();
        let sampling = diffusion.sampling_schedule(250).unwrap();
        assert_eq!(sampling.timesteps.len(), 250);
        assert_eq!(sampling.schedule.len(), 250);
        assert_eq!(*sampling.timesteps.last().unwrap(), 999);
        // First gathered alpha_bar is preserved exactly up to f32 rounding.
        let full = diffusion.schedule().alpha_bar()[sampling.timesteps[10]];
        assert!((sampling.schedule.alpha_bar()[10] - full).abs() < 1e-5);
        assert!(diffusion.sampling_schedule(1001).is_err());
    }

    #[test]
    fn standard_normal_is_reproducible() {
        use rand::SeedableRng;
        use rand_chacha::ChaCha8Rng;

        let a = standard_normal((4, 4), &Device::Cpu, &mut ChaCha8Rng::seed_from_u64(1))
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();
        let b = standard_normal((4, 4), &Device::Cpu, &mut ChaCha8Rng::seed_from_u64(1))
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();
        assert_eq!(a, b);
    }
}
