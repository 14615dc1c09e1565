//! Parametric dynamical systems identified during sampling.
//!
//! Each variant evaluates the right-hand side of a planar ODE over a fixed
//! square grid of `(x, y)` states and adds a saturating control law
//!
//! ```text
//! u(x, y) = gain * tanh(phi1 * x) + gain * tanh(phi2 * y)
//! ```
//!
//! whose two coefficients are the only trainable quantities. Evaluation
//! returns a 3-channel field `[f1, f2, aux]` where `aux` is passed through
//! unchanged.
//!
//! - [`pendulum`]: damped pendulum, plus a variant with per-call parameter noise
//! - [`duffing`]: damped Duffing oscillator
//! - [`van_der_pol`]: Van der Pol-style oscillator

pub mod duffing;
pub mod pendulum;
pub mod van_der_pol;

use std::fmt;
use std::str::FromStr;

use candle_core::{DType, Device, Tensor, Var};
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

pub use duffing::Duffing;
pub use pendulum::{NoisyPendulum, Pendulum, PendulumParams, Perturbation};
pub use van_der_pol::VanDerPol;

use crate::{Error, Result};

/// Common interface for all system variants.
pub trait DynamicalSystem {
    /// Variant name, as used in logs.
    fn name(&self) -> &'static str;

    /// The fixed coordinate grid the field is evaluated on.
    fn grid(&self) -> &Grid;

    /// The two trainable control-law coefficients.
    fn coefficients(&self) -> &Coefficients;

    /// Evaluate the controlled vector field.
    ///
    /// `auxiliary` must be `(n, n)` for an `n×n` grid. Returns `(3, n, n)`.
    fn evaluate(&mut self, auxiliary: &Tensor) -> Result<Tensor>;
}

/// Registry of system variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemKind {
    Pendulum,
    NoisyPendulum,
    Duffing,
    VanDerPol,
}

impl SystemKind {
    pub const ALL: [SystemKind; 4] = [
        SystemKind::Pendulum,
        SystemKind::NoisyPendulum,
        SystemKind::Duffing,
        SystemKind::VanDerPol,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SystemKind::Pendulum => "pendulum",
            SystemKind::NoisyPendulum => "noisy_pendulum",
            SystemKind::Duffing => "duffing",
            SystemKind::VanDerPol => "van_der_pol",
        }
    }

    /// Instantiate the variant with standard-normal coefficients.
    pub fn build<R: Rng>(self, grid: Grid, rng: &mut R) -> Result<Box<dyn DynamicalSystem>> {
        Ok(match self {
            SystemKind::Pendulum => Box::new(Pendulum::new(grid, rng)?),
            SystemKind::NoisyPendulum => Box::new(NoisyPendulum::new(grid, rng)?),
            SystemKind::Duffing => Box::new(Duffing::new(grid, rng)?),
            SystemKind::VanDerPol => Box::new(VanDerPol::new(grid, rng)?),
        })
    }
}

impl fmt::Display for SystemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SystemKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        SystemKind::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| {
                let known: Vec<&str> = SystemKind::ALL.iter().map(|k| k.name()).collect();
                Error::config(format!(
                    "unknown system '{s}', expected one of: {}",
                    known.join(", ")
                ))
            })
    }
}

/// Square `linspace(-1, 1, n)` meshgrid. `xx` varies along columns, `yy` along rows.
#[derive(Debug, Clone)]
pub struct Grid {
    size: usize,
    xx: Tensor,
    yy: Tensor,
}

impl Grid {
    pub fn new(size: usize, device: &Device) -> Result<Self> {
        if size < 2 {
            return Err(Error::config(format!(
                "grid needs at least 2 points per axis, got {size}"
            )));
        }
        let axis: Vec<f32> = (0..size)
            .map(|i| (-1.0 + 2.0 * i as f64 / (size - 1) as f64) as f32)
            .collect();
        let xx: Vec<f32> = (0..size).flat_map(|_| axis.iter().copied()).collect();
        let yy: Vec<f32> = axis
            .iter()
            .flat_map(|&y| std::iter::repeat_n(y, size))
            .collect();

        Ok(Self {
            size,
            xx: Tensor::from_vec(xx, (size, size), device)?,
            yy: Tensor::from_vec(yy, (size, size), device)?,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn xx(&self) -> &Tensor {
        &self.xx
    }

    pub fn yy(&self) -> &Tensor {
        &self.yy
    }

    pub fn device(&self) -> &Device {
        self.xx.device()
    }
}

/// Plain snapshot of the two coefficients.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoefficientValues {
    pub phi1: f32,
    pub phi2: f32,
}

/// The two trainable scalars of a control law.
#[derive(Debug, Clone)]
pub struct Coefficients {
    phi1: Var,
    phi2: Var,
}

impl Coefficients {
    pub fn new(values: CoefficientValues, device: &Device) -> Result<Self> {
        Ok(Self {
            phi1: Var::new(values.phi1, device)?,
            phi2: Var::new(values.phi2, device)?,
        })
    }

    /// Draw both coefficients from a standard normal distribution.
    pub fn standard_normal<R: Rng>(rng: &mut R, device: &Device) -> Result<Self> {
        let values = CoefficientValues {
            phi1: rng.sample(StandardNormal),
            phi2: rng.sample(StandardNormal),
        };
        Self::new(values, device)
    }

    pub fn phi1(&self) -> &Var {
        &self.phi1
    }

    pub fn phi2(&self) -> &Var {
        &self.phi2
    }

    pub fn values(&self) -> Result<CoefficientValues> {
        Ok(CoefficientValues {
            phi1: self.phi1.to_dtype(DType::F32)?.to_scalar::<f32>()?,
            phi2: self.phi2.to_dtype(DType::F32)?.to_scalar::<f32>()?,
        })
    }

    /// Handles for an optimizer. They share storage with `self`.
    pub fn vars(&self) -> Vec<Var> {
        vec![self.phi1.clone(), self.phi2.clone()]
    }

    pub fn set(&self, values: CoefficientValues) -> Result<()> {
        let device = self.phi1.device();
        self.phi1.set(&Tensor::new(values.phi1, device)?)?;
        self.phi2.set(&Tensor::new(values.phi2, device)?)?;
        Ok(())
    }

    /// `gain * tanh(phi1 * xx) + gain * tanh(phi2 * yy)`, bounded by `2 * gain`.
    pub fn control(&self, grid: &Grid, gain: f64) -> Result<Tensor> {
        let u1 = grid.xx().broadcast_mul(self.phi1.as_tensor())?.tanh()?;
        let u2 = grid.yy().broadcast_mul(self.phi2.as_tensor())?.tanh()?;
        Ok(((u1 + u2)? * gain)?)
    }
}

/// Stack two dynamics channels with the pass-through auxiliary channel.
pub(crate) fn stack_field(grid: &Grid, f1: Tensor, f2: Tensor, auxiliary: &Tensor) -> Result<Tensor> {
    let n = grid.size();
    if auxiliary.dims() != [n, n] {
        return Err(Error::shape(format!(
            "auxiliary channel must be ({n}, {n}), got {:?}",
            auxiliary.dims()
        )));
    }
    let auxiliary = auxiliary
        .to_device(grid.device())?
        .to_dtype(DType::F32)?;
    Ok(Tensor::stack(&[f1, f2, auxiliary], 0)?)
}
