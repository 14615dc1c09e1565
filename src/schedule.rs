//! Noise-schedule algebra.
//!
//! A [`Schedule`] tabulates every per-timestep scalar the diffusion recurrences
//! need, derived from a cumulative-retention function `f(t)`:
//!
//! ```text
//! beta[t]       = min(1 - f(t+1) / f(t), 0.999)
//! alpha[t]      = 1 - beta[t]
//! alpha_bar[t]  = prod(alpha[0..=t])
//! beta_tilde[t] = beta[t] * (1 - alpha_bar[t-1]) / (1 - alpha_bar[t])    (t > 0)
//! beta_tilde[0] = beta_tilde[1]
//! ```
//!
//! Values are computed in `f64` and stored as `f32`, the working precision of
//! every trajectory tensor.
//!
//! Accelerated sampling runs on a sub-sampled schedule built by
//! [`Schedule::resample`] from a strictly increasing subset of timesteps.

use std::f64::consts::FRAC_PI_2;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Upper bound applied to every beta.
pub const MAX_BETA: f64 = 0.999;

/// A cumulative signal-retention function over normalized time.
///
/// `retention(t, num_steps)` must lie in (0, 1] for `t < num_steps` and in
/// [0, 1] at `t == num_steps`.
pub trait VarianceSchedule {
    fn retention(&self, t: usize, num_steps: usize) -> f64;
}

impl<F> VarianceSchedule for F
where
    F: Fn(usize, usize) -> f64,
{
    fn retention(&self, t: usize, num_steps: usize) -> f64 {
        self(t, num_steps)
    }
}

/// Squared-cosine schedule (Nichol & Dhariwal, 2021).
///
/// `f(t) = cos((t/T + 0.008) / 1.008 * π/2)^2`
#[derive(Debug, Clone, Copy, Default)]
pub struct CosineSchedule;

impl VarianceSchedule for CosineSchedule {
    fn retention(&self, t: usize, num_steps: usize) -> f64 {
        let offset = 0.008;
        let x = (t as f64 / num_steps as f64 + offset) / (1.0 + offset) * FRAC_PI_2;
        x.cos().powi(2)
    }
}

/// Linearly spaced betas, expressed as a retention function.
#[derive(Debug, Clone, Copy)]
pub struct LinearSchedule {
    pub beta_start: f64,
    pub beta_end: f64,
}

impl LinearSchedule {
    fn beta_at(&self, i: usize, num_steps: usize) -> f64 {
        let span = (num_steps - 1).max(1) as f64;
        self.beta_start + (self.beta_end - self.beta_start) * i as f64 / span
    }
}

impl VarianceSchedule for LinearSchedule {
    fn retention(&self, t: usize, num_steps: usize) -> f64 {
        (0..t.min(num_steps))
            .map(|i| 1.0 - self.beta_at(i, num_steps))
            .product()
    }
}

/// Serializable schedule selector.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleKind {
    #[default]
    Cosine,
    Linear { beta_start: f64, beta_end: f64 },
}

impl ScheduleKind {
    /// Build the full schedule for `num_steps` timesteps.
    pub fn build(&self, num_steps: usize) -> Result<Schedule> {
        match *self {
            ScheduleKind::Cosine => Schedule::build(num_steps, &CosineSchedule),
            ScheduleKind::Linear {
                beta_start,
                beta_end,
            } => Schedule::build(
                num_steps,
                &LinearSchedule {
                    beta_start,
                    beta_end,
                },
            ),
        }
    }
}

/// Per-timestep diffusion scalars. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    beta: Vec<f32>,
    beta_log: Vec<f32>,
    alpha: Vec<f32>,
    alpha_bar: Vec<f32>,
    beta_tilde: Vec<f32>,
    beta_tilde_log: Vec<f32>,
}

impl Schedule {
    /// Derive a schedule of `num_steps` timesteps from a retention function.
    pub fn build<V>(num_steps: usize, variance: &V) -> Result<Self>
    where
        V: VarianceSchedule + ?Sized,
    {
        if num_steps == 0 {
            return Err(Error::config("schedule needs at least one timestep"));
        }

        let retention: Vec<f64> = (0..=num_steps)
            .map(|t| variance.retention(t, num_steps))
            .collect();
        for (t, &r) in retention.iter().enumerate() {
            let lower_ok = if t < num_steps { r > 0.0 } else { r >= 0.0 };
            if !r.is_finite() || !lower_ok || r > 1.0 {
                return Err(Error::config(format!(
                    "variance schedule returned {r} at t={t}, expected a value in (0, 1]"
                )));
            }
        }

        let betas: Vec<f64> = retention
            .windows(2)
            .map(|w| (1.0 - w[1] / w[0]).min(MAX_BETA))
            .collect();
        Self::from_betas(&betas)
    }

    /// Derive all scalars from an explicit beta sequence.
    ///
    /// Every beta must lie strictly inside (0, 1).
    pub fn from_betas(betas: &[f64]) -> Result<Self> {
        if betas.is_empty() {
            return Err(Error::config("schedule needs at least one beta"));
        }
        if let Some((t, b)) = betas
            .iter()
            .enumerate()
            .find(|&(_, &b)| !(b > 0.0 && b < 1.0))
        {
            return Err(Error::config(format!(
                "beta[{t}] = {b} is outside (0, 1)"
            )));
        }

        let alpha: Vec<f64> = betas.iter().map(|b| 1.0 - b).collect();
        let alpha_bar: Vec<f64> = alpha
            .iter()
            .scan(1.0, |acc, a| {
                *acc *= a;
                Some(*acc)
            })
            .collect();

        let mut beta_tilde: Vec<f64> = (1..betas.len())
            .map(|t| betas[t] * (1.0 - alpha_bar[t - 1]) / (1.0 - alpha_bar[t]))
            .collect();
        // Boundary convention: the first entry duplicates the second. A
        // single-step schedule has no second entry and falls back to beta[0].
        let first = beta_tilde.first().copied().unwrap_or(betas[0]);
        beta_tilde.insert(0, first);

        let to_f32 = |v: &[f64]| v.iter().map(|&x| x as f32).collect::<Vec<f32>>();
        let log_f32 = |v: &[f64]| v.iter().map(|&x| x.ln() as f32).collect::<Vec<f32>>();

        Ok(Self {
            beta: to_f32(betas),
            beta_log: log_f32(betas),
            alpha: to_f32(&alpha),
            alpha_bar: to_f32(&alpha_bar),
            beta_tilde: to_f32(&beta_tilde),
            beta_tilde_log: log_f32(&beta_tilde),
        })
    }

    /// Build a reduced schedule over a strictly increasing subset of timesteps.
    ///
    /// `step_indices` must end at the final timestep. Betas are recomputed from
    /// the ratios of consecutive gathered `alpha_bar` values, the first ratio
    /// taken against `alpha_bar = 1.0`.
    pub fn resample(&self, step_indices: &[usize]) -> Result<Self> {
        validate_step_indices(step_indices, self.len())?;

        let mut prev = 1.0_f64;
        let betas: Vec<f64> = step_indices
            .iter()
            .map(|&t| {
                let alpha_bar = self.alpha_bar[t] as f64;
                let beta = (1.0 - alpha_bar / prev).min(MAX_BETA);
                prev = alpha_bar;
                beta
            })
            .collect();
        Self::from_betas(&betas)
    }

    pub fn len(&self) -> usize {
        self.beta.len()
    }

    pub fn is_empty(&self) -> bool {
        self.beta.is_empty()
    }

    pub fn beta(&self) -> &[f32] {
        &self.beta
    }

    pub fn beta_log(&self) -> &[f32] {
        &self.beta_log
    }

    pub fn alpha(&self) -> &[f32] {
        &self.alpha
    }

    pub fn alpha_bar(&self) -> &[f32] {
        &self.alpha_bar
    }

    pub fn beta_tilde(&self) -> &[f32] {
        &self.beta_tilde
    }

    pub fn beta_tilde_log(&self) -> &[f32] {
        &self.beta_tilde_log
    }

    /// Check that every index in `t` addresses a timestep of this schedule.
    pub(crate) fn check_timesteps(&self, t: &[usize]) -> Result<()> {
        match t.iter().find(|&&step| step >= self.len()) {
            Some(step) => Err(Error::config(format!(
                "timestep {step} out of range for a {}-step schedule",
                self.len()
            ))),
            None => Ok(()),
        }
    }
}

/// Evenly spaced sampling timesteps, `floor(linspace(0, T-1, S))`.
///
/// A single sampling step maps to the final timestep so that the set still
/// ends at `T-1`.
pub fn spaced_timesteps(num_steps: usize, sampling_steps: usize) -> Result<Vec<usize>> {
    if num_steps == 0 {
        return Err(Error::config("schedule needs at least one timestep"));
    }
    if sampling_steps == 0 || sampling_steps > num_steps {
        return Err(Error::config(format!(
            "sampling_steps must be in 1..={num_steps}, got {sampling_steps}"
        )));
    }
    if sampling_steps == 1 {
        return Ok(vec![num_steps - 1]);
    }

    let last = (num_steps - 1) as f64;
    let step = last / (sampling_steps - 1) as f64;
    let mut indices: Vec<usize> = (0..sampling_steps)
        .map(|i| (i as f64 * step) as usize)
        .collect();
    indices[sampling_steps - 1] = num_steps - 1;
    Ok(indices)
}

fn validate_step_indices(step_indices: &[usize], num_steps: usize) -> Result<()> {
    let Some(&last) = step_indices.last() else {
        return Err(Error::config("step index set is empty"));
    };
    if let Some(w) = step_indices.windows(2).find(|w| w[1] <= w[0]) {
        return Err(Error::config(format!(
            "step indices must be strictly increasing, got {} then {}",
            w[0], w[1]
        )));
    }
    if last != num_steps - 1 {
        return Err(Error::config(format!(
            "step indices must end at the final timestep {}, got {last}",
            num_steps - 1
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(num_steps: usize) -> Schedule {
        Schedule::build(num_steps, &CosineSchedule).unwrap()
    }

    #[test]
    fn alpha_bar_non_increasing_and_bounded() {
        for kind in [
            ScheduleKind::Cosine,
            ScheduleKind::Linear {
                beta_start: 1e-4,
                beta_end: 0.02,
            },
        ] {
            let s = kind.build(1000).unwrap();
            assert_eq!(s.len(), 1000);
            for (t, &ab) in s.alpha_bar().iter().enumerate() {
                assert!(ab > 0.0 && ab <= 1.0, "{kind:?}: alpha_bar[{t}] = {ab}");
            }
            for w in s.alpha_bar().windows(2) {
                assert!(w[1] <= w[0], "{kind:?}: alpha_bar increased: {w:?}");
            }
            for &b in s.beta() {
                assert!(b <= MAX_BETA as f32, "{kind:?}: beta = {b}");
            }
        }
    }

    #[test]
    fn cosine_final_beta_is_capped() {
        let s = cosine(1000);
        assert!((s.beta()[999] - 0.999).abs() < 1e-6, "beta = {}", s.beta()[999]);
    }

    #[test]
    fn alpha_is_one_minus_beta() {
        let s = cosine(50);
        for (a, b) in s.alpha().iter().zip(s.beta()) {
            assert!((a + b - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn beta_tilde_boundary_duplicates_second_entry() {
        let s = cosine(100);
        assert_eq!(s.beta_tilde()[0], s.beta_tilde()[1]);
        assert_eq!(s.beta_tilde_log()[0], s.beta_tilde_log()[1]);
        assert_eq!(s.beta_tilde().len(), 100);
    }

    #[test]
    fn beta_tilde_matches_formula() {
        let s = cosine(20);
        let ab = s.alpha_bar();
        for t in 1..20 {
            let expected = s.beta()[t] * (1.0 - ab[t - 1]) / (1.0 - ab[t]);
            assert!(
                (s.beta_tilde()[t] - expected).abs() < 1e-5,
                "t={t}: {} vs {expected}",
                s.beta_tilde()[t]
            );
        }
    }

    #[test]
    fn logs_match_values() {
        let s = cosine(30);
        for (b, lb) in s.beta().iter().zip(s.beta_log()) {
            assert!((b.ln() - lb).abs() < 1e-4);
        }
    }

    #[test]
    fn zero_steps_is_config_error() {
        let err = Schedule::build(0, &CosineSchedule).unwrap_err();
        assert!(matches!(err, Error::Config(_)), "{err}");
    }

    #[test]
    fn single_step_schedule() {
        let s = cosine(1);
        assert_eq!(s.len(), 1);
        assert_eq!(s.beta_tilde()[0], s.beta()[0]);
    }

    #[test]
    fn closure_schedule_is_pluggable() {
        let linear_retention = |t: usize, n: usize| 1.0 - 0.5 * t as f64 / n as f64;
        let s = Schedule::build(10, &linear_retention).unwrap();
        // beta[0] = 1 - 0.95 / 1.0
        assert!((s.beta()[0] - 0.05).abs() < 1e-6);
        assert!((s.alpha_bar()[9] - 0.5).abs() < 1e-5);
    }

    #[test]
    fn out_of_range_retention_is_rejected() {
        let bad = |t: usize, _n: usize| if t == 3 { 1.5 } else { 0.5 };
        assert!(matches!(
            Schedule::build(5, &bad),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn resample_identity_reproduces_schedule() {
        let s = cosine(1000);
        let identity: Vec<usize> = (0..1000).collect();
        let r = s.resample(&identity).unwrap();
        assert_eq!(r.len(), s.len());
        for t in 0..1000 {
            assert!(
                (r.beta()[t] - s.beta()[t]).abs() < 1e-5,
                "beta[{t}]: {} vs {}",
                r.beta()[t],
                s.beta()[t]
            );
            assert!(
                (r.alpha_bar()[t] - s.alpha_bar()[t]).abs() < 1e-5,
                "alpha_bar[{t}]: {} vs {}",
                r.alpha_bar()[t],
                s.alpha_bar()[t]
            );
        }
    }

    #[test]
    fn resample_non_uniform_subset() {
        let s = cosine(100);
        let indices = [0, 3, 10, 40, 41, 99];
        let r = s.resample(&indices).unwrap();
        assert_eq!(r.len(), indices.len());
        // alpha_bar at gathered indices is preserved until the cap bites.
        for (i, &t) in indices.iter().enumerate().take(5) {
            assert!(
                (r.alpha_bar()[i] - s.alpha_bar()[t]).abs() < 1e-5,
                "i={i}: {} vs {}",
                r.alpha_bar()[i],
                s.alpha_bar()[t]
            );
        }
        for &b in r.beta() {
            assert!(b > 0.0 && b <= MAX_BETA as f32);
        }
        for w in r.alpha_bar().windows(2) {
            assert!(w[1] <= w[0]);
        }
    }

    #[test]
    fn resample_rejects_bad_index_sets() {
        let s = cosine(10);
        assert!(s.resample(&[]).is_err());
        assert!(s.resample(&[0, 5, 5, 9]).is_err());
        assert!(s.resample(&[0, 6, 3, 9]).is_err());
        assert!(s.resample(&[0, 4, 8]).is_err());
        assert!(s.resample(&[0, 4, 10]).is_err());
    }

    #[test]
    fn spaced_timesteps_match_floor_linspace() {
        let idx = spaced_timesteps(1000, 250).unwrap();
        assert_eq!(idx.len(), 250);
        assert_eq!(idx[0], 0);
        assert_eq!(idx[1], 4); // 999 / 249 ≈ 4.012
        assert_eq!(idx[249], 999);
        for w in idx.windows(2) {
            assert!(w[1] > w[0]);
        }
    }

    #[test]
    fn spaced_timesteps_edge_cases() {
        assert_eq!(spaced_timesteps(10, 10).unwrap(), (0..10).collect::<Vec<_>>());
        assert_eq!(spaced_timesteps(10, 1).unwrap(), vec![9]);
        assert_eq!(spaced_timesteps(10, 2).unwrap(), vec![0, 9]);
        assert!(spaced_timesteps(10, 0).is_err());
        assert!(spaced_timesteps(10, 11).is_err());
        assert!(spaced_timesteps(0, 1).is_err());
    }

    #[test]
    fn schedule_kind_serde_roundtrip_names() {
        let json = r#"{"kind":"linear","beta_start":0.0001,"beta_end":0.02}"#;
        let kind: ScheduleKind = serde_json::from_str(json).unwrap();
        assert_eq!(
            kind,
            ScheduleKind::Linear {
                beta_start: 0.0001,
                beta_end: 0.02
            }
        );
        let cosine: ScheduleKind = serde_json::from_str(r#"{"kind":"cosine"}"#).unwrap();
        assert_eq!(cosine, ScheduleKind::Cosine);
    }
}
