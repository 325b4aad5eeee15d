//! Adam optimizer
//!
//! Adam with bias-corrected moment estimates. Weight decay is either added to
//! the gradient (classic Adam / L2 regularisation) or applied directly to the
//! parameters (AdamW), depending on `decoupled_weight_decay`.

use std::collections::BTreeMap;

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use tracing::debug;

use super::{Optimizer, OptimizerHeader, OptimizerStateDict};
use crate::config::OptimizerConfig;
use crate::error::{Error, Result};
use crate::network::FracNet;

const EXP_AVG: &str = "exp_avg";
const EXP_AVG_SQ: &str = "exp_avg_sq";

struct ParamState {
    param: Var,
    /// First moment estimate
    exp_avg: Var,
    /// Second moment estimate
    exp_avg_sq: Var,
}

/// Adam optimizer bound to a fixed set of named parameters
pub struct Adam {
    params: BTreeMap<String, ParamState>,
    config: OptimizerConfig,
    step_count: usize,
}

impl Adam {
    /// Bind to `params` with zero-initialised moments
    pub fn new(params: BTreeMap<String, Var>, config: OptimizerConfig) -> Result<Self> {
        let params = params
            .into_iter()
            .map(|(name, param)| {
                let exp_avg = Var::zeros(param.dims(), param.dtype(), param.device())?;
                let exp_avg_sq = Var::zeros(param.dims(), param.dtype(), param.device())?;
                Ok((
                    name,
                    ParamState {
                        param,
                        exp_avg,
                        exp_avg_sq,
                    },
                ))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;

        debug!("Adam bound to {} parameter tensors", params.len());

        Ok(Self {
            params,
            config,
            step_count: 0,
        })
    }

    /// Bind to every parameter of a network
    pub fn for_network(model: &FracNet, config: OptimizerConfig) -> Result<Self> {
        Self::new(model.named_vars()?, config)
    }

    /// Rebuild hyperparameters from a stored header
    pub fn config_from_header(header: &OptimizerHeader) -> Result<OptimizerConfig> {
        if header.optimizer_type != "adam" {
            return Err(Error::checkpoint(format!(
                "expected adam optimizer state, found '{}'",
                header.optimizer_type
            )));
        }
        let get = |key: &str| {
            header.hyperparameters.get(key).copied().ok_or_else(|| {
                Error::checkpoint(format!("optimizer hyperparameter '{key}' is missing"))
            })
        };
        Ok(OptimizerConfig {
            learning_rate: header.learning_rate,
            beta1: get("beta1")?,
            beta2: get("beta2")?,
            epsilon: get("epsilon")?,
            weight_decay: get("weight_decay")?,
            decoupled_weight_decay: get("decoupled_weight_decay")? != 0.0,
        })
    }

    /// Hyperparameters in use
    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    fn update(&self, state: &ParamState, grad: &Tensor) -> Result<()> {
        let OptimizerConfig {
            learning_rate: lr,
            beta1,
            beta2,
            epsilon,
            weight_decay,
            decoupled_weight_decay,
        } = self.config;
        let theta = state.param.as_tensor();

        let grad = if weight_decay > 0.0 && !decoupled_weight_decay {
            (grad + theta.affine(weight_decay, 0.0)?)?
        } else {
            grad.clone()
        };

        let m = (state.exp_avg.affine(beta1, 0.0)? + grad.affine(1.0 - beta1, 0.0)?)?;
        let v = (state.exp_avg_sq.affine(beta2, 0.0)? + grad.sqr()?.affine(1.0 - beta2, 0.0)?)?;

        let t = self.step_count as i32;
        let m_hat = m.affine(1.0 / (1.0 - beta1.powi(t)), 0.0)?;
        let v_hat = v.affine(1.0 / (1.0 - beta2.powi(t)), 0.0)?;
        let step = m_hat.div(&v_hat.sqrt()?.affine(1.0, epsilon)?)?;

        let decay = if weight_decay > 0.0 && decoupled_weight_decay {
            1.0 - lr * weight_decay
        } else {
            1.0
        };
        let next = (theta.affine(decay, 0.0)? - step.affine(lr, 0.0)?)?;

        state.exp_avg.set(&m)?;
        state.exp_avg_sq.set(&v)?;
        state.param.set(&next)?;
        Ok(())
    }
}

impl Optimizer for Adam {
    fn name(&self) -> &str {
        "adam"
    }

    fn step(&mut self, gradients: &GradStore) -> Result<()> {
        self.step_count += 1;
        for state in self.params.values() {
            if let Some(grad) = gradients.get(state.param.as_tensor()) {
                self.update(state, grad)?;
            }
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.config.learning_rate = lr;
    }

    fn state_dict(&self) -> Result<OptimizerStateDict> {
        let mut tensors = BTreeMap::new();
        for (name, state) in &self.params {
            tensors.insert(format!("{name}.{EXP_AVG}"), state.exp_avg.as_tensor().copy()?);
            tensors.insert(format!("{name}.{EXP_AVG_SQ}"), state.exp_avg_sq.as_tensor().copy()?);
        }

        let hyperparameters = BTreeMap::from([
            ("beta1".to_string(), self.config.beta1),
            ("beta2".to_string(), self.config.beta2),
            ("epsilon".to_string(), self.config.epsilon),
            ("weight_decay".to_string(), self.config.weight_decay),
            (
                "decoupled_weight_decay".to_string(),
                if self.config.decoupled_weight_decay { 1.0 } else { 0.0 },
            ),
        ]);

        Ok(OptimizerStateDict {
            header: OptimizerHeader {
                optimizer_type: self.name().to_string(),
                step_count: self.step_count,
                learning_rate: self.config.learning_rate,
                hyperparameters,
            },
            tensors,
        })
    }

    fn load_state_dict(&mut self, state: OptimizerStateDict) -> Result<()> {
        let config = Self::config_from_header(&state.header)?;

        let expected = self.params.len() * 2;
        if state.tensors.len() != expected {
            return Err(Error::config_mismatch(format!(
                "optimizer state holds {} tensors, architecture needs {expected}",
                state.tensors.len()
            )));
        }

        let mut pending = Vec::with_capacity(expected);
        for (name, param_state) in &self.params {
            for (slot, var) in [(EXP_AVG, &param_state.exp_avg), (EXP_AVG_SQ, &param_state.exp_avg_sq)] {
                let key = format!("{name}.{slot}");
                let tensor = state.tensors.get(&key).ok_or_else(|| {
                    Error::config_mismatch(format!("optimizer state '{key}' is missing"))
                })?;
                if tensor.dims() != var.dims() {
                    return Err(Error::config_mismatch(format!(
                        "optimizer state '{key}': stored shape {:?}, parameter has {:?}",
                        tensor.dims(),
                        var.dims()
                    )));
                }
                pending.push((var, tensor.to_device(var.device())?.to_dtype(var.dtype())?));
            }
        }

        for (var, tensor) in pending {
            var.set(&tensor)?;
        }
        self.config = config;
        self.step_count = state.header.step_count;
        Ok(())
    }

    fn step_count(&self) -> usize {
        self.step_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use candle_core::{DType, Device};

    fn quadratic_setup(config: OptimizerConfig) -> (Var, Adam) {
        let w = Var::from_tensor(&Tensor::new(&[1.0f32, -2.0, 3.0], &Device::Cpu).unwrap()).unwrap();
        let adam = Adam::new(BTreeMap::from([("w".to_string(), w.clone())]), config).unwrap();
        (w, adam)
    }

    fn no_decay(lr: f64) -> OptimizerConfig {
        OptimizerConfig {
            learning_rate: lr,
            weight_decay: 0.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_first_step_moves_by_learning_rate() {
        let (w, mut adam) = quadratic_setup(no_decay(0.1));
        let loss = w.as_tensor().sqr().unwrap().sum_all().unwrap();
        adam.step(&loss.backward().unwrap()).unwrap();

        // Bias-corrected first step is lr * sign(grad)
        let values = w.as_tensor().to_vec1::<f32>().unwrap();
        assert_relative_eq!(values[0], 0.9, epsilon = 1e-5);
        assert_relative_eq!(values[1], -1.9, epsilon = 1e-5);
        assert_relative_eq!(values[2], 2.9, epsilon = 1e-5);
        assert_eq!(adam.step_count(), 1);
    }

    #[test]
    fn test_minimises_quadratic() {
        let (w, mut adam) = quadratic_setup(no_decay(0.05));
        for _ in 0..500 {
            let loss = w.as_tensor().sqr().unwrap().sum_all().unwrap();
            adam.step(&loss.backward().unwrap()).unwrap();
        }
        let norm = w.as_tensor().sqr().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(norm < 1e-2, "norm {norm}");
    }

    #[test]
    fn test_parameters_without_gradient_are_untouched() {
        let config = OptimizerConfig {
            learning_rate: 0.1,
            weight_decay: 0.5,
            decoupled_weight_decay: true,
            ..Default::default()
        };
        let (w, mut adam) = quadratic_setup(config);
        let other = Var::zeros(1, DType::F32, &Device::Cpu).unwrap();
        // Gradient only for an unrelated variable leaves `w` untouched
        let loss = other.as_tensor().sum_all().unwrap();
        adam.step(&loss.backward().unwrap()).unwrap();
        assert_eq!(w.as_tensor().to_vec1::<f32>().unwrap(), vec![1.0, -2.0, 3.0]);
    }

    #[test]
    fn test_state_dict_restores_trajectory() {
        let (w, mut adam) = quadratic_setup(no_decay(0.05));
        for _ in 0..3 {
            let loss = w.as_tensor().sqr().unwrap().sum_all().unwrap();
            adam.step(&loss.backward().unwrap()).unwrap();
        }
        let state = adam.state_dict().unwrap();
        assert_eq!(state.header.step_count, 3);
        assert_eq!(state.tensors.len(), 2);

        let (w2, mut adam2) = quadratic_setup(no_decay(0.5));
        w2.set(w.as_tensor()).unwrap();
        adam2.load_state_dict(state).unwrap();
        assert_eq!(adam2.learning_rate(), 0.05);

        for (var, opt) in [(&w, &mut adam), (&w2, &mut adam2)] {
            let loss = var.as_tensor().sqr().unwrap().sum_all().unwrap();
            opt.step(&loss.backward().unwrap()).unwrap();
        }
        assert_eq!(
            w.as_tensor().to_vec1::<f32>().unwrap(),
            w2.as_tensor().to_vec1::<f32>().unwrap()
        );
    }

    #[test]
    fn test_load_rejects_missing_slots() {
        let (_, mut adam) = quadratic_setup(no_decay(0.1));
        let mut state = adam.state_dict().unwrap();
        state.tensors.remove("w.exp_avg_sq");
        assert!(matches!(
            adam.load_state_dict(state),
            Err(Error::ConfigMismatch(_))
        ));
    }
}
