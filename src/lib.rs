//! Reverse-diffusion sampling with online system identification.
//!
//! A pretrained denoiser is run backwards over a sub-sampled schedule, but the
//! sample it denoises is the vector field of a small controlled dynamical
//! system. Each reverse step regresses the field onto the denoiser's clean
//! estimate and takes one optimizer step on the system's two control
//! coefficients, so the final field is a system the prior finds plausible.
//!
//! ## Architecture
//!
//! ```text
//! ScheduleKind ─→ Schedule ─→ GaussianDiffusion ─→ SamplingSchedule
//!                                                      │
//!  DynamicalSystem ──evaluate──→ normalize ──→ Denoiser ─→ x̂₀
//!        ▲                                              │
//!        └──────────── Adam on (phi1, phi2) ←── mse ────┘
//! ```
//!
//! ## Modules
//!
//! - [`schedule`]: variance schedules, cumulative products, resampling
//! - [`diffusion`]: forward process, clean-sample reconstruction, posterior mean
//! - [`system`]: pendulum, noisy pendulum, Duffing and Van der Pol fields
//! - [`sampler`]: the reverse fitting loop
//! - [`logger`]: EMA loss tracking
//! - [`denoiser`]: the denoiser contract
//! - [`config`]: serde configuration

pub mod config;
pub mod denoiser;
pub mod diffusion;
pub mod logger;
pub mod sampler;
pub mod schedule;
pub mod system;

mod error;

pub use error::{Error, Result};
