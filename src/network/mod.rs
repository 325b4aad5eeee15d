//! Multi-branch convolutional network
//!
//! The network runs `B` convolutional branches side by side over the same
//! input. Each branch has its own kernel size, output width and pooling size;
//! their flattened outputs are concatenated and fed to a single linear head.

use serde::{Deserialize, Serialize};

use crate::config::ModelConfig;
use crate::error::{Error, Result};

pub mod model;

pub use model::FracNet;

/// One parallel convolutional branch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchConfig {
    /// Output channels of the branch convolution
    pub width: usize,
    /// Square convolution kernel size
    pub kernel_size: usize,
    /// Square max-pooling window (and stride)
    pub pool_size: usize,
}

impl BranchConfig {
    pub(crate) fn validate(&self, index: usize) -> Result<()> {
        if self.width == 0 || self.kernel_size == 0 || self.pool_size == 0 {
            return Err(Error::config(format!(
                "branch {index}: width, kernel_size and pool_size must all be > 0, got {self:?}"
            )));
        }
        Ok(())
    }

    /// Zero padding applied on each side so odd kernels keep the spatial size
    pub fn padding(&self) -> usize {
        self.kernel_size / 2
    }

    /// Spatial size after convolution and pooling, `None` if the pooling
    /// window does not fit
    pub fn output_hw(&self, height: usize, width: usize) -> Option<(usize, usize)> {
        let conv = |x: usize| x + 2 * self.padding() + 1 - self.kernel_size;
        let pool = |x: usize| (x >= self.pool_size).then(|| x / self.pool_size);
        Some((pool(conv(height))?, pool(conv(width))?))
    }
}

/// Input layout, `(channels, height, width)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputShape {
    /// Channels
    pub channels: usize,
    /// Height in pixels
    pub height: usize,
    /// Width in pixels
    pub width: usize,
}

impl InputShape {
    /// Create from a `(channels, height, width)` tuple
    pub fn new(channels: usize, height: usize, width: usize) -> Self {
        Self {
            channels,
            height,
            width,
        }
    }

    /// As a `(channels, height, width)` tuple
    pub fn dims(&self) -> (usize, usize, usize) {
        (self.channels, self.height, self.width)
    }
}

impl From<(usize, usize, usize)> for InputShape {
    fn from((channels, height, width): (usize, usize, usize)) -> Self {
        Self::new(channels, height, width)
    }
}

/// Everything needed to build a [`FracNet`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Output dimensionality
    pub num_classes: usize,
    /// Dropout rate on the concatenated features, training mode only
    pub dropout: f32,
    /// Expected input layout
    pub input_shape: InputShape,
    /// Branches, in order
    pub branches: Vec<BranchConfig>,
}

impl NetworkConfig {
    /// Create and validate a configuration
    pub fn new(
        num_classes: usize,
        dropout: f32,
        input_shape: impl Into<InputShape>,
        branches: Vec<BranchConfig>,
    ) -> Result<Self> {
        let config = Self {
            num_classes,
            dropout,
            input_shape: input_shape.into(),
            branches,
        };
        config.validate()?;
        Ok(config)
    }

    /// Build from three per-branch lists, which must have equal lengths
    pub fn from_parallel_lists(
        num_classes: usize,
        dropout: f32,
        input_shape: impl Into<InputShape>,
        widths: &[usize],
        kernel_sizes: &[usize],
        pool_sizes: &[usize],
    ) -> Result<Self> {
        if widths.len() != kernel_sizes.len() || widths.len() != pool_sizes.len() {
            return Err(Error::config(format!(
                "per-branch lists differ in length: {} widths, {} kernel sizes, {} pool sizes",
                widths.len(),
                kernel_sizes.len(),
                pool_sizes.len()
            )));
        }

        let branches = widths
            .iter()
            .zip(kernel_sizes)
            .zip(pool_sizes)
            .map(|((&width, &kernel_size), &pool_size)| BranchConfig {
                width,
                kernel_size,
                pool_size,
            })
            .collect();
        Self::new(num_classes, dropout, input_shape, branches)
    }

    /// Combine the run's model section with the shape discovered from data
    pub fn from_model_config(
        model: &ModelConfig,
        num_classes: usize,
        input_shape: impl Into<InputShape>,
    ) -> Result<Self> {
        Self::new(num_classes, model.dropout, input_shape, model.branches.clone())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.num_classes == 0 {
            return Err(Error::config("num_classes must be > 0"));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::config(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        let InputShape {
            channels,
            height,
            width,
        } = self.input_shape;
        if channels == 0 || height == 0 || width == 0 {
            return Err(Error::config(format!(
                "input shape must be non-empty, got {:?}",
                self.input_shape.dims()
            )));
        }
        if self.branches.is_empty() {
            return Err(Error::config("At least one branch is required"));
        }
        for (i, branch) in self.branches.iter().enumerate() {
            branch.validate(i)?;
        }
        self.feature_dims().map(|_| ())
    }

    /// Flattened feature count produced by each branch
    pub fn feature_dims(&self) -> Result<Vec<usize>> {
        let InputShape { height, width, .. } = self.input_shape;
        self.branches
            .iter()
            .enumerate()
            .map(|(i, branch)| {
                let (h, w) = branch.output_hw(height, width).ok_or_else(|| {
                    Error::config(format!(
                        "branch {i}: pooling window {} does not fit a {height}x{width} input",
                        branch.pool_size
                    ))
                })?;
                Ok(branch.width * h * w)
            })
            .collect()
    }

    /// Length of the concatenated feature vector fed to the classifier
    pub fn feature_size(&self) -> Result<usize> {
        Ok(self.feature_dims()?.iter().sum())
    }

    /// Whether parameters of a network built from `other` have the same names
    /// and shapes as one built from `self`
    pub fn is_compatible_with(&self, other: &NetworkConfig) -> bool {
        self.num_classes == other.num_classes
            && self.input_shape.channels == other.input_shape.channels
            && self.branches.len() == other.branches.len()
            && self
                .branches
                .iter()
                .zip(&other.branches)
                .all(|(a, b)| a.width == b.width && a.kernel_size == b.kernel_size)
            && self.feature_size().ok() == other.feature_size().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(&[3, 5], &[3], &[2, 2] ; "short kernels")]
    #[test_case(&[3], &[3, 3], &[2, 2] ; "short widths")]
    #[test_case(&[3, 5], &[3, 3], &[2] ; "short pools")]
    #[test_case(&[3, 5, 7], &[3, 3], &[2] ; "all different")]
    #[test_case(&[], &[3], &[] ; "empty widths and pools")]
    fn test_unequal_lists_rejected(widths: &[usize], kernels: &[usize], pools: &[usize]) {
        let result = NetworkConfig::from_parallel_lists(5, 0.0, (3, 32, 32), widths, kernels, pools);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_feature_size() {
        let config = NetworkConfig::from_parallel_lists(
            5,
            0.0,
            (3, 32, 32),
            &[3, 5],
            &[3, 4],
            &[4, 3],
        )
        .unwrap();
        // 3x3 kernel keeps 32 -> pool 4 -> 8x8; 4x4 kernel grows to 33 -> pool 3 -> 11x11
        assert_eq!(config.feature_dims().unwrap(), vec![3 * 8 * 8, 5 * 11 * 11]);
        assert_eq!(config.feature_size().unwrap(), 192 + 605);
    }

    #[test]
    fn test_pool_larger_than_input_rejected() {
        let result =
            NetworkConfig::from_parallel_lists(5, 0.0, (3, 8, 8), &[3], &[3], &[10]);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_empty_and_zero_branches_rejected() {
        assert!(NetworkConfig::from_parallel_lists(5, 0.0, (3, 8, 8), &[], &[], &[]).is_err());
        assert!(NetworkConfig::from_parallel_lists(5, 0.0, (3, 8, 8), &[0], &[3], &[2]).is_err());
        assert!(NetworkConfig::from_parallel_lists(0, 0.0, (3, 8, 8), &[1], &[3], &[2]).is_err());
    }

    #[test]
    fn test_compatibility() {
        let a = NetworkConfig::from_parallel_lists(5, 0.0, (3, 32, 32), &[3, 5], &[3, 3], &[4, 4]).unwrap();
        let mut b = a.clone();
        b.dropout = 0.5;
        assert!(a.is_compatible_with(&b));

        let c = NetworkConfig::from_parallel_lists(5, 0.0, (3, 32, 32), &[3, 6], &[3, 3], &[4, 4]).unwrap();
        assert!(!a.is_compatible_with(&c));
    }
}
