//! Damped pendulum with a saturating torque controller.
//!
//! ```text
//! f1 = y
//! f2 = g·sin(x)/l + (u − 0.1·y) / (m·l²)
//! ```
//!
//! [`NoisyPendulum`] perturbs `m`, `g`, `l` and the control gain on every
//! evaluation to model parameter and actuation noise.

use candle_core::Tensor;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use super::{Coefficients, DynamicalSystem, Grid, SystemKind, stack_field};
use crate::Result;

/// Control gain of both pendulum variants.
pub const PENDULUM_GAIN: f64 = 5.0;

/// Half-width of every uniform perturbation drawn by [`NoisyPendulum`].
pub const PERTURBATION_BOUND: f64 = 0.05;

const DAMPING: f64 = 0.1;

/// Physical constants.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PendulumParams {
    pub mass: f64,
    pub gravity: f64,
    pub length: f64,
}

impl Default for PendulumParams {
    fn default() -> Self {
        Self {
            mass: 0.15,
            gravity: 9.81,
            length: 0.5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Pendulum {
    grid: Grid,
    coefficients: Coefficients,
    params: PendulumParams,
}

impl Pendulum {
    pub fn new<R: Rng>(grid: Grid, rng: &mut R) -> Result<Self> {
        let coefficients = Coefficients::standard_normal(rng, grid.device())?;
        Ok(Self::with_coefficients(grid, coefficients))
    }

    pub fn with_coefficients(grid: Grid, coefficients: Coefficients) -> Self {
        Self {
            grid,
            coefficients,
            params: PendulumParams::default(),
        }
    }

    pub fn params(&self) -> PendulumParams {
        self.params
    }

    fn field(&self, params: PendulumParams, control_scale: f64, auxiliary: &Tensor) -> Result<Tensor> {
        let xx = self.grid.xx();
        let yy = self.grid.yy();
        let control = (self.coefficients.control(&self.grid, PENDULUM_GAIN)? * control_scale)?;

        let inertia = params.mass * params.length * params.length;
        let gravity = (xx.sin()? * (params.gravity / params.length))?;
        let torque = ((control - (yy * DAMPING)?)? / inertia)?;
        let f2 = (gravity + torque)?;

        stack_field(&self.grid, yy.clone(), f2, auxiliary)
    }
}

impl DynamicalSystem for Pendulum {
    fn name(&self) -> &'static str {
        SystemKind::Pendulum.name()
    }

    fn grid(&self) -> &Grid {
        &self.grid
    }

    fn coefficients(&self) -> &Coefficients {
        &self.coefficients
    }

    fn evaluate(&mut self, auxiliary: &Tensor) -> Result<Tensor> {
        self.field(self.params, 1.0, auxiliary)
    }
}

/// One draw of the noisy pendulum's offsets.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Perturbation {
    pub mass: f64,
    pub gravity: f64,
    pub length: f64,
    /// Relative control gain offset; the control is scaled by `1 + control`.
    pub control: f64,
}

impl Perturbation {
    fn draw<R: Rng>(rng: &mut R) -> Self {
        let bound = PERTURBATION_BOUND;
        Self {
            mass: rng.random_range(-bound..bound),
            gravity: rng.random_range(-bound..bound),
            length: rng.random_range(-bound..bound),
            control: rng.random_range(-bound..bound),
        }
    }
}

/// Pendulum whose constants and control gain are redrawn on every evaluation.
#[derive(Debug, Clone)]
pub struct NoisyPendulum {
    inner: Pendulum,
    rng: ChaCha8Rng,
    last: Option<Perturbation>,
}

impl NoisyPendulum {
    /// Coefficients come from `rng`; the perturbation stream is seeded from it too.
    pub fn new<R: Rng>(grid: Grid, rng: &mut R) -> Result<Self> {
        let inner = Pendulum::new(grid, rng)?;
        let stream = ChaCha8Rng::seed_from_u64(rng.random());
        Ok(Self::from_parts(inner, stream))
    }

    pub fn from_parts(inner: Pendulum, rng: ChaCha8Rng) -> Self {
        Self {
            inner,
            rng,
            last: None,
        }
    }

    /// The perturbation applied by the most recent evaluation.
    pub fn last_perturbation(&self) -> Option<Perturbation> {
        self.last
    }
}

impl DynamicalSystem for NoisyPendulum {
    fn name(&self) -> &'static str {
        SystemKind::NoisyPendulum.name()
    }

    fn grid(&self) -> &Grid {
        self.inner.grid()
    }

    fn coefficients(&self) -> &Coefficients {
        self.inner.coefficients()
    }

    fn evaluate(&mut self, auxiliary: &Tensor) -> Result<Tensor> {
        let p = Perturbation::draw(&mut self.rng);
        self.last = Some(p);

        let base = self.inner.params;
        let params = PendulumParams {
            mass: base.mass + p.mass,
            gravity: base.gravity + p.gravity,
            length: base.length + p.length,
        };
        self.inner.field(params, 1.0 + p.control, auxiliary)
    }
}
