//! Forward (noising) process.
//!
//! `x_t = sqrt(ᾱ_t)·x_0 + sqrt(1 − ᾱ_t)·ε` with one timestep per batch
//! element. The noise realization is returned alongside `x_t` because the
//! training objective regresses the denoiser onto it.

use candle_core::Tensor;
use rand::Rng;

use super::{ensure_same_shape, per_example, standard_normal};
use crate::Result;
use crate::schedule::Schedule;

/// Noise `x0` to the per-example timesteps `t`; returns `(x_t, ε)`.
pub fn add_noise<R: Rng>(
    x0: &Tensor,
    t: &[usize],
    schedule: &Schedule,
    rng: &mut R,
) -> Result<(Tensor, Tensor)> {
    let eps = standard_normal(x0.dims(), x0.device(), rng)?.to_dtype(x0.dtype())?;
    let xt = add_noise_with(x0, &eps, t, schedule)?;
    Ok((xt, eps))
}

/// Noise `x0` with a given noise realization.
pub fn add_noise_with(x0: &Tensor, eps: &Tensor, t: &[usize], schedule: &Schedule) -> Result<Tensor> {
    ensure_same_shape(x0, eps, "noise")?;
    schedule.check_timesteps(t)?;

    let alpha_bar = schedule.alpha_bar();
    let signal = per_example(t, x0, |s| (alpha_bar[s] as f64).sqrt())?;
    let noise = per_example(t, x0, |s| (1.0 - alpha_bar[s] as f64).sqrt())?;

    Ok((x0.broadcast_mul(&signal)? + eps.broadcast_mul(&noise)?)?)
}
