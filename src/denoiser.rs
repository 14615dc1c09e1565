//! The denoiser contract.
//!
//! The sampler treats the denoiser as a black box: it receives the current
//! trajectory `(B, C, H, W)` and one timestep per batch element as a `(B,)`
//! `u32` tensor, and returns predicted noise of the same shape as the
//! trajectory. Gradients never flow back into it.

use candle_core::{DType, Tensor};

use crate::Result;

pub trait Denoiser {
    fn predict_noise(&self, x: &Tensor, t: &Tensor) -> Result<Tensor>;
}

impl<F> Denoiser for F
where
    F: Fn(&Tensor, &Tensor) -> Result<Tensor>,
{
    fn predict_noise(&self, x: &Tensor, t: &Tensor) -> Result<Tensor> {
        self(x, t)
    }
}

/// Predicts zero noise, so every clean estimate is `x_t / sqrt(ᾱ_t)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZeroNoise;

impl Denoiser for ZeroNoise {
    fn predict_noise(&self, x: &Tensor, _t: &Tensor) -> Result<Tensor> {
        Ok(x.zeros_like()?.to_dtype(DType::F32)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn zero_noise_matches_input_shape() {
        let x = Tensor::ones((1, 3, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let t = Tensor::new(&[7u32], &Device::Cpu).unwrap();
        let eps = ZeroNoise.predict_noise(&x, &t).unwrap();
        assert_eq!(eps.dims(), x.dims());
        assert_eq!(eps.sum_all().unwrap().to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn closures_are_denoisers() {
        let half = |x: &Tensor, _t: &Tensor| -> Result<Tensor> { Ok((x * 0.5)?) };
        let x = Tensor::ones((1, 3, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let t = Tensor::new(&[0u32], &Device::Cpu).unwrap();
        let eps = half.predict_noise(&x, &t).unwrap();
        assert_eq!(eps.mean_all().unwrap().to_scalar::<f32>().unwrap(), 0.5);
    }
}
