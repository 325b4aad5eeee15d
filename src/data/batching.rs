//! Batch collation

use candle_core::Tensor;

use super::Sample;
use crate::error::{Error, Result};

/// A collated mini-batch
#[derive(Debug, Clone)]
pub struct Batch {
    /// Inputs with a leading batch dimension, `(N, C, H, W)`
    pub inputs: Tensor,
    /// Targets with a leading batch dimension, `(N, num_classes)`
    pub targets: Tensor,
}

impl Batch {
    /// Number of samples in the batch
    pub fn len(&self) -> usize {
        self.inputs.dims().first().copied().unwrap_or(0)
    }

    /// Whether the batch holds no samples
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Stack samples into a batch. All samples must share input and target shapes.
pub fn collate(samples: Vec<Sample>) -> Result<Batch> {
    let first = samples
        .first()
        .ok_or_else(|| Error::internal("Cannot collate an empty batch"))?;
    let input_dims = first.input.dims().to_vec();
    let target_dims = first.target.dims().to_vec();

    for sample in &samples[1..] {
        if sample.input.dims() != input_dims.as_slice() {
            return Err(Error::shape_mismatch(&input_dims, sample.input.dims()));
        }
        if sample.target.dims() != target_dims.as_slice() {
            return Err(Error::shape_mismatch(&target_dims, sample.target.dims()));
        }
    }

    let (inputs, targets): (Vec<Tensor>, Vec<Tensor>) = samples
        .into_iter()
        .map(|sample| (sample.input, sample.target))
        .unzip();

    Ok(Batch {
        inputs: Tensor::stack(&inputs, 0)?,
        targets: Tensor::stack(&targets, 0)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn sample(c: usize, h: usize, w: usize, k: usize) -> Sample {
        Sample {
            input: Tensor::zeros((c, h, w), DType::F32, &Device::Cpu).unwrap(),
            target: Tensor::zeros(k, DType::F32, &Device::Cpu).unwrap(),
        }
    }

    #[test]
    fn test_collate_stacks_leading_dimension() {
        let batch = collate(vec![sample(3, 8, 8, 5); 4]).unwrap();
        assert_eq!(batch.inputs.dims(), &[4, 3, 8, 8]);
        assert_eq!(batch.targets.dims(), &[4, 5]);
        assert_eq!(batch.len(), 4);
    }

    #[test]
    fn test_collate_rejects_ragged_inputs() {
        let result = collate(vec![sample(3, 8, 8, 5), sample(3, 8, 9, 5)]);
        assert!(matches!(result, Err(Error::ShapeMismatch { .. })));

        let result = collate(vec![sample(3, 8, 8, 5), sample(3, 8, 8, 4)]);
        assert!(matches!(result, Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn test_collate_rejects_empty() {
        assert!(collate(Vec::new()).is_err());
    }
}
