//! Damped Duffing oscillator with a double-well potential.
//!
//! ```text
//! f1 = y
//! f2 = −0.5·y − x·(4x² − 1) + 0.5·u
//! ```

use candle_core::Tensor;
use rand::Rng;

use super::{Coefficients, DynamicalSystem, Grid, SystemKind, stack_field};
use crate::Result;

pub const DUFFING_GAIN: f64 = 20.0;

#[derive(Debug, Clone)]
pub struct Duffing {
    grid: Grid,
    coefficients: Coefficients,
}

impl Duffing {
    pub fn new<R: Rng>(grid: Grid, rng: &mut R) -> Result<Self> {
        let coefficients = Coefficients::standard_normal(rng, grid.device())?;
        Ok(Self::with_coefficients(grid, coefficients))
    }

    pub fn with_coefficients(grid: Grid, coefficients: Coefficients) -> Self {
        Self { grid, coefficients }
    }
}

impl DynamicalSystem for Duffing {
    fn name(&self) -> &'static str {
        SystemKind::Duffing.name()
    }

    fn grid(&self) -> &Grid {
        &self.grid
    }

    fn coefficients(&self) -> &Coefficients {
        &self.coefficients
    }

    fn evaluate(&mut self, auxiliary: &Tensor) -> Result<Tensor> {
        let xx = self.grid.xx();
        let yy = self.grid.yy();
        let control = self.coefficients.control(&self.grid, DUFFING_GAIN)?;

        let stiffness = ((xx.sqr()? * 4.0)? - 1.0)?;
        let restoring = (xx * stiffness)?;
        let f2 = (((yy * -0.5)? - restoring)? + (control * 0.5)?)?;

        stack_field(&self.grid, yy.clone(), f2, auxiliary)
    }
}
