//! Optimizers
//!
//! `sgd` and `adam` use candle's own implementations (`adam` is `AdamW`
//! without weight decay). Momentum, Adagrad and RMSProp follow the same
//! [`Optimizer`] trait and keep their slots as [`Var`]s next to each weight.

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, SGD};

use crate::config::OptimizerConfig;
use crate::error::Result;

fn float_vars(vars: Vec<Var>) -> Vec<Var> {
    vars.into_iter()
        .filter(|var| var.dtype().is_float())
        .collect()
}

fn slot(var: &Var, value: f64) -> candle_core::Result<Var> {
    Var::from_tensor(&(var.ones_like()? * value)?)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamsMomentum {
    pub lr: f64,
    pub momentum: f64,
    pub nesterov: bool,
}

/// Heavy-ball momentum, optionally Nesterov.
#[derive(Debug)]
pub struct Momentum {
    vars: Vec<(Var, Var)>,
    params: ParamsMomentum,
}

impl Optimizer for Momentum {
    type Config = ParamsMomentum;

    fn new(vars: Vec<Var>, params: ParamsMomentum) -> candle_core::Result<Self> {
        let vars = float_vars(vars)
            .into_iter()
            .map(|var| {
                let accum = slot(&var, 0.0)?;
                Ok((var, accum))
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self { vars, params })
    }

    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        let ParamsMomentum {
            lr,
            momentum,
            nesterov,
        } = self.params;
        for (var, accum) in &self.vars {
            if let Some(grad) = grads.get(var) {
                let next = ((accum.as_tensor() * momentum)? + grad)?;
                let update = if nesterov {
                    (grad + (&next * momentum)?)?
                } else {
                    next.clone()
                };
                accum.set(&next)?;
                var.set(&var.sub(&(update * lr)?)?)?;
            }
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamsAdagrad {
    pub lr: f64,
    pub initial_accumulator_value: f64,
}

#[derive(Debug)]
pub struct Adagrad {
    vars: Vec<(Var, Var)>,
    params: ParamsAdagrad,
}

impl Optimizer for Adagrad {
    type Config = ParamsAdagrad;

    fn new(vars: Vec<Var>, params: ParamsAdagrad) -> candle_core::Result<Self> {
        let vars = float_vars(vars)
            .into_iter()
            .map(|var| {
                let accum = slot(&var, params.initial_accumulator_value)?;
                Ok((var, accum))
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self { vars, params })
    }

    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        for (var, accum) in &self.vars {
            if let Some(grad) = grads.get(var) {
                let next = (accum.as_tensor() + grad.sqr()?)?;
                let update = grad.div(&next.sqrt()?)?;
                accum.set(&next)?;
                var.set(&var.sub(&(update * self.params.lr)?)?)?;
            }
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamsRmsProp {
    pub lr: f64,
    pub decay: f64,
    pub momentum: f64,
    pub epsilon: f64,
    pub centered: bool,
}

struct RmsSlots {
    var: Var,
    mean_square: Var,
    mean_grad: Var,
    moment: Var,
}

/// RMSProp with the mean square initialised to one.
pub struct RmsProp {
    slots: Vec<RmsSlots>,
    params: ParamsRmsProp,
}

impl Optimizer for RmsProp {
    type Config = ParamsRmsProp;

    fn new(vars: Vec<Var>, params: ParamsRmsProp) -> candle_core::Result<Self> {
        let slots = float_vars(vars)
            .into_iter()
            .map(|var| {
                Ok(RmsSlots {
                    mean_square: slot(&var, 1.0)?,
                    mean_grad: slot(&var, 0.0)?,
                    moment: slot(&var, 0.0)?,
                    var,
                })
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self { slots, params })
    }

    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        let ParamsRmsProp {
            lr,
            decay,
            momentum,
            epsilon,
            centered,
        } = self.params;
        for slots in &self.slots {
            let Some(grad) = grads.get(&slots.var) else {
                continue;
            };
            let mean_square =
                ((slots.mean_square.as_tensor() * decay)? + (grad.sqr()? * (1.0 - decay))?)?;
            let mut denom = mean_square.clone();
            if centered {
                let mean_grad = ((slots.mean_grad.as_tensor() * decay)? + (grad * (1.0 - decay))?)?;
                denom = denom.sub(&mean_grad.sqr()?)?;
                slots.mean_grad.set(&mean_grad)?;
            }
            let step = (grad.div(&(denom + epsilon)?.sqrt()?)? * lr)?;
            let moment = ((slots.moment.as_tensor() * momentum)? + step)?;
            slots.mean_square.set(&mean_square)?;
            slots.moment.set(&moment)?;
            slots.var.set(&slots.var.sub(&moment)?)?;
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr
    }
}

/// The optimizer selected by an [`OptimizerConfig`].
pub enum TrainOptimizer {
    Sgd(SGD),
    Momentum(Momentum),
    Adagrad(Adagrad),
    Adam(AdamW),
    RmsProp(RmsProp),
}

impl TrainOptimizer {
    pub fn new(config: &OptimizerConfig, vars: Vec<Var>, lr: f64) -> Result<Self> {
        let optimizer = match *config {
            OptimizerConfig::Sgd => TrainOptimizer::Sgd(SGD::new(vars, lr)?),
            OptimizerConfig::Momentum {
                momentum,
                use_nesterov,
            } => TrainOptimizer::Momentum(Momentum::new(
                vars,
                ParamsMomentum {
                    lr,
                    momentum,
                    nesterov: use_nesterov,
                },
            )?),
            OptimizerConfig::Adagrad {
                initial_accumulator_value,
            } => TrainOptimizer::Adagrad(Adagrad::new(
                vars,
                ParamsAdagrad {
                    lr,
                    initial_accumulator_value,
                },
            )?),
            OptimizerConfig::Adam {
                beta1,
                beta2,
                epsilon,
            } => TrainOptimizer::Adam(AdamW::new(
                vars,
                ParamsAdamW {
                    lr,
                    beta1,
                    beta2,
                    eps: epsilon,
                    weight_decay: 0.0,
                },
            )?),
            OptimizerConfig::Rmsprop {
                decay,
                momentum,
                epsilon,
                centered,
            } => TrainOptimizer::RmsProp(RmsProp::new(
                vars,
                ParamsRmsProp {
                    lr,
                    decay,
                    momentum,
                    epsilon,
                    centered,
                },
            )?),
        };
        Ok(optimizer)
    }

    /// Back-propagates `loss` and applies one update.
    pub fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
        match self {
            TrainOptimizer::Sgd(opt) => opt.backward_step(loss)?,
            TrainOptimizer::Momentum(opt) => opt.backward_step(loss)?,
            TrainOptimizer::Adagrad(opt) => opt.backward_step(loss)?,
            TrainOptimizer::Adam(opt) => opt.backward_step(loss)?,
            TrainOptimizer::RmsProp(opt) => opt.backward_step(loss)?,
        }
        Ok(())
    }

    pub fn learning_rate(&self) -> f64 {
        match self {
            TrainOptimizer::Sgd(opt) => opt.learning_rate(),
            TrainOptimizer::Momentum(opt) => opt.learning_rate(),
            TrainOptimizer::Adagrad(opt) => opt.learning_rate(),
            TrainOptimizer::Adam(opt) => opt.learning_rate(),
            TrainOptimizer::RmsProp(opt) => opt.learning_rate(),
        }
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        match self {
            TrainOptimizer::Sgd(opt) => opt.set_learning_rate(lr),
            TrainOptimizer::Momentum(opt) => opt.set_learning_rate(lr),
            TrainOptimizer::Adagrad(opt) => opt.set_learning_rate(lr),
            TrainOptimizer::Adam(opt) => opt.set_learning_rate(lr),
            TrainOptimizer::RmsProp(opt) => opt.set_learning_rate(lr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    /// Runs `steps` updates on `(x - 3)^2` from `x = 0` and returns `x`.
    fn minimize(config: OptimizerConfig, lr: f64, steps: usize) -> f32 {
        let x = Var::new(&[0f32], &Device::Cpu).unwrap();
        let mut opt = TrainOptimizer::new(&config, vec![x.clone()], lr).unwrap();
        for _ in 0..steps {
            let loss = (x.as_tensor() - 3.0).unwrap().sqr().unwrap().sum_all().unwrap();
            opt.backward_step(&loss).unwrap();
        }
        x.as_tensor().to_vec1::<f32>().unwrap()[0]
    }

    #[test]
    fn test_momentum_first_steps() {
        let config = OptimizerConfig::Momentum {
            momentum: 0.9,
            use_nesterov: false,
        };
        // grad -6 then -4.8, accumulator -6 then -10.2
        assert!((minimize(config, 0.1, 1) - 0.6).abs() < 1e-5);
        assert!((minimize(config, 0.1, 2) - 1.62).abs() < 1e-5);
    }

    #[test]
    fn test_all_optimizers_reduce_loss() {
        let configs = [
            (OptimizerConfig::Sgd, 0.1),
            (
                OptimizerConfig::Momentum {
                    momentum: 0.5,
                    use_nesterov: true,
                },
                0.05,
            ),
            (
                OptimizerConfig::Adagrad {
                    initial_accumulator_value: 0.1,
                },
                0.5,
            ),
            (OptimizerConfig::default(), 0.1),
            (
                OptimizerConfig::Rmsprop {
                    decay: 0.9,
                    momentum: 0.0,
                    epsilon: 1e-6,
                    centered: false,
                },
                0.05,
            ),
        ];
        for (config, lr) in configs {
            let x = minimize(config, lr, 60);
            assert!((x - 3.0).abs() < 2.0, "{config:?} ended at {x}");
            assert!(x > 0.5, "{config:?} ended at {x}");
        }
    }

    #[test]
    fn test_learning_rate_update() {
        let x = Var::new(&[0f32], &Device::Cpu).unwrap();
        let mut opt = TrainOptimizer::new(&OptimizerConfig::Sgd, vec![x], 0.1).unwrap();
        opt.set_learning_rate(0.01);
        assert_eq!(opt.learning_rate(), 0.01);
    }
}
