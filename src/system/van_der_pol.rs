//! Van der Pol-style oscillator with cubic damping.
//!
//! ```text
//! f1 = 2·y
//! f2 = −0.8·x + 2·y − 10·x²·y + u
//! ```

use candle_core::Tensor;
use rand::Rng;

use super::{Coefficients, DynamicalSystem, Grid, SystemKind, stack_field};
use crate::Result;

pub const VAN_DER_POL_GAIN: f64 = 20.0;

#[derive(Debug, Clone)]
pub struct VanDerPol {
    grid: Grid,
    coefficients: Coefficients,
}

impl VanDerPol {
    pub fn new<R: Rng>(grid: Grid, rng: &mut R) -> Result<Self> {
        let coefficients = Coefficients::standard_normal(rng, grid.device())?;
        Ok(Self::with_coefficients(grid, coefficients))
    }

    pub fn with_coefficients(grid: Grid, coefficients: Coefficients) -> Self {
        Self { grid, coefficients }
    }
}

impl DynamicalSystem for VanDerPol {
    fn name(&self) -> &'static str {
        SystemKind::VanDerPol.name()
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
        let control = self.coefficients.control(&self.grid, VAN_DER_POL_GAIN)?;

        let f1 = (yy * 2.0)?;
        let damping = ((xx.sqr()? * yy)? * 10.0)?;
        let f2 = ((((xx * -0.8)? + &f1)? - damping)? + control)?;

        stack_field(&self.grid, f1, f2, auxiliary)
    }
}
