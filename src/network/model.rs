//! The multi-branch fractal classifier

use std::collections::{BTreeMap, HashMap};

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Conv2d, Conv2dConfig, Linear, Module, VarBuilder, VarMap};
use tracing::debug;

use super::NetworkConfig;
use crate::error::{Error, Result};

/// Parallel convolutional branches feeding a shared linear head.
///
/// Parameters live in a [`VarMap`] owned by the network and are exposed as a
/// flat `name -> tensor` mapping (`branch<i>.conv.weight`, `classifier.bias`,
/// ...) for checkpointing and replication.
pub struct FracNet {
    config: NetworkConfig,
    branches: Vec<Branch>,
    classifier: Linear,
    varmap: VarMap,
    device: Device,
}

struct Branch {
    conv: Conv2d,
    pool_size: usize,
}

impl Branch {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = self.conv.forward(xs)?.relu()?;
        let xs = xs.max_pool2d(self.pool_size)?;
        Ok(xs.flatten_from(1)?)
    }
}

impl FracNet {
    /// Build a freshly initialised network on `device`
    pub fn new(config: NetworkConfig, device: &Device) -> Result<Self> {
        config.validate()?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let in_channels = config.input_shape.channels;
        let branches = config
            .branches
            .iter()
            .enumerate()
            .map(|(i, branch)| {
                let conv_config = Conv2dConfig {
                    padding: branch.padding(),
                    ..Default::default()
                };
                let conv = candle_nn::conv2d(
                    in_channels,
                    branch.width,
                    branch.kernel_size,
                    conv_config,
                    vb.pp(format!("branch{i}")).pp("conv"),
                )?;
                Ok(Branch {
                    conv,
                    pool_size: branch.pool_size,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let feature_size = config.feature_size()?;
        let classifier = candle_nn::linear(feature_size, config.num_classes, vb.pp("classifier"))?;

        debug!(
            "Built FracNet with {} branches, {} features, {} outputs",
            branches.len(),
            feature_size,
            config.num_classes
        );

        Ok(Self {
            config,
            branches,
            classifier,
            varmap,
            device: device.clone(),
        })
    }

    /// Forward pass. Dropout is only applied when `train` is set.
    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let expected = self.config.input_shape.dims();
        match xs.dims() {
            &[_, c, h, w] if (c, h, w) == expected => {}
            actual => {
                let (c, h, w) = expected;
                return Err(Error::ShapeMismatch {
                    expected: format!("[N, {c}, {h}, {w}]"),
                    actual: format!("{actual:?}"),
                });
            }
        }

        let features = self
            .branches
            .iter()
            .map(|branch| branch.forward(xs))
            .collect::<Result<Vec<_>>>()?;
        let xs = Tensor::cat(&features, 1)?;

        let xs = if train && self.config.dropout > 0.0 {
            candle_nn::ops::dropout(&xs, self.config.dropout)?
        } else {
            xs
        };

        Ok(self.classifier.forward(&xs)?)
    }

    /// Inference-mode forward pass
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.forward_t(xs, false)
    }

    /// Architecture configuration
    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Device holding the parameters
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Trainable variables by name, sorted
    pub fn named_vars(&self) -> Result<BTreeMap<String, Var>> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| Error::internal("parameter store lock poisoned"))?;
        Ok(data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect())
    }

    /// Snapshot of every parameter as a flat `name -> tensor` mapping
    pub fn state_dict(&self) -> Result<BTreeMap<String, Tensor>> {
        self.named_vars()?
            .into_iter()
            .map(|(name, var)| Ok((name, var.as_tensor().copy()?)))
            .collect()
    }

    /// Overwrite every parameter. Names and shapes must match exactly; nothing
    /// is modified unless the whole mapping is accepted.
    pub fn load_state_dict(&self, tensors: &HashMap<String, Tensor>) -> Result<()> {
        let vars = self.named_vars()?;

        if let Some(extra) = tensors.keys().find(|name| !vars.contains_key(*name)) {
            return Err(Error::config_mismatch(format!(
                "stored parameter '{extra}' does not exist in this architecture"
            )));
        }
        for (name, var) in &vars {
            let tensor = tensors.get(name).ok_or_else(|| {
                Error::config_mismatch(format!("parameter '{name}' is missing from the record"))
            })?;
            if tensor.dims() != var.dims() {
                return Err(Error::config_mismatch(format!(
                    "parameter '{name}': stored shape {:?}, architecture expects {:?}",
                    tensor.dims(),
                    var.dims()
                )));
            }
        }

        for (name, var) in &vars {
            let tensor = tensors[name].to_device(&self.device)?.to_dtype(DType::F32)?;
            var.set(&tensor)?;
        }
        Ok(())
    }

    /// Total number of scalar parameters
    pub fn num_parameters(&self) -> Result<usize> {
        Ok(self
            .named_vars()?
            .values()
            .map(|var| var.elem_count())
            .sum())
    }
}
