//! Loss of the value network

use std::collections::BTreeMap;

use burn::prelude::*;
use burn::tensor::ElementConversion;

use diffuser_core::error::ShapeError;

use crate::loss::{ElementwiseLoss, LossResult, LossType};

/// Denominator below which the correlation is reported as NaN
const CORR_EPS: f32 = 1e-8;

/// Unweighted value regression loss with prediction statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct ValueLoss {
    /// Elementwise loss
    pub loss_type: LossType,
}

impl ValueLoss {
    /// Creates a value loss
    pub fn new(loss_type: LossType) -> Self {
        Self { loss_type }
    }

    /// Scores `[batch, out_dim]` predictions against their targets
    ///
    /// Besides the mean loss, `info` reports the mean, min and max of both
    /// sides and their Pearson correlation `corr`, which is NaN for a single
    /// element or for a constant side.
    pub fn forward<B: Backend>(&self, pred: Tensor<B, 2>, target: Tensor<B, 2>) -> Result<LossResult<B>, ShapeError> {
        if pred.dims() != target.dims() {
            return Err(ShapeError::Mismatch {
                pred: pred.dims().to_vec(),
                target: target.dims().to_vec(),
            });
        }

        let loss = self.loss_type.compute(pred.clone(), target.clone()).mean();

        let pred = pred.detach().flatten::<1>(0, 1);
        let target = target.detach().flatten::<1>(0, 1);
        let scalar = |x: Tensor<B, 1>| x.into_scalar().elem::<f32>();

        let mut info = BTreeMap::new();
        info.insert("mean_pred".to_string(), scalar(pred.clone().mean()));
        info.insert("mean_targ".to_string(), scalar(target.clone().mean()));
        info.insert("min_pred".to_string(), scalar(pred.clone().min()));
        info.insert("min_targ".to_string(), scalar(target.clone().min()));
        info.insert("max_pred".to_string(), scalar(pred.clone().max()));
        info.insert("max_targ".to_string(), scalar(target.clone().max()));

        let corr = if pred.dims()[0] > 1 {
            pearson(pred, target)
        } else {
            f32::NAN
        };
        info.insert("corr".to_string(), corr);

        Ok(LossResult { loss, info })
    }
}

fn pearson<B: Backend>(x: Tensor<B, 1>, y: Tensor<B, 1>) -> f32 {
    let x = x.clone() - x.mean();
    let y = y.clone() - y.mean();

    let numerator = (x.clone() * y.clone()).sum().into_scalar().elem::<f32>();
    let denom_x = (x.clone() * x).sum().sqrt().into_scalar().elem::<f32>();
    let denom_y = (y.clone() * y).sum().sqrt().into_scalar().elem::<f32>();

    let denom = denom_x * denom_y;
    if denom < CORR_EPS {
        return f32::NAN;
    }
    numerator / denom
}
