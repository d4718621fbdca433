use burn::prelude::*;

/// Softplus activation: ln(1 + e^x)
///
/// Evaluated as `max(x, 0) + ln(1 + e^-|x|)` so neither tail overflows.
pub fn softplus<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    x.clone().clamp_min(0.0) + x.abs().neg().exp().log1p()
}

/// Mish activation: x * tanh(softplus(x))
pub fn mish<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    x.clone() * softplus(x).tanh()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_softplus_is_stable_in_the_tails() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 1>::from_floats([-200.0, -1.0, 0.0, 1.0, 200.0], &device);
        let y: Vec<f32> = softplus(x).into_data().to_vec().unwrap();

        assert!(y.iter().all(|v| v.is_finite()));
        assert!(y[0] >= 0.0 && y[0] < 1e-30);
        assert!((y[1] - 0.313_261_7).abs() < 1e-5);
        assert!((y[2] - std::f32::consts::LN_2).abs() < 1e-6);
        assert!((y[3] - 1.313_261_7).abs() < 1e-5);
        assert_eq!(y[4], 200.0);
    }

    #[test]
    fn test_mish_values() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 1>::from_floats([-100.0, 0.0, 1.0, 100.0], &device);
        let y: Vec<f32> = mish(x).into_data().to_vec().unwrap();

        assert!(y[0].abs() < 1e-6);
        assert_eq!(y[1], 0.0);
        // 1 * tanh(ln(1 + e))
        assert!((y[2] - 0.865_098_4).abs() < 1e-5);
        assert_eq!(y[3], 100.0);
    }
}
