use crate::guide::AutoGuide;
use crate::model::DklModel;
use crate::trace::{Trace, TraceMode};

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::info;
use rand::rngs::StdRng;

pub struct SviConfig {
    pub num_steps: usize,
    pub step_size: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub show_progress: bool,
    /// log the loss every this many steps (0: never)
    pub log_every: usize,
}

impl SviConfig {
    pub fn new(num_steps: usize, step_size: f64) -> Self {
        Self {
            num_steps,
            step_size,
            beta1: 0.5,
            beta2: 0.999,
            eps: 1e-8,
            show_progress: true,
            log_every: 100,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.num_steps == 0 {
            anyhow::bail!("number of SVI steps must be positive");
        }
        if !(self.step_size.is_finite() && self.step_size > 0.) {
            anyhow::bail!("step size must be a positive number, got {}", self.step_size);
        }
        Ok(())
    }
}

/// Minimize `loss_fn` over every variable in `varmap`
///
/// * `varmap` - must already hold all trainable variables
/// * `loss_fn` - called with the step index, returns a scalar loss
///
/// Returns the loss recorded at every step, before its update.
pub fn run_svi<L>(varmap: &VarMap, config: &SviConfig, mut loss_fn: L) -> anyhow::Result<Vec<f64>>
where
    L: FnMut(usize) -> Result<Tensor>,
{
    config.validate()?;

    // plain Adam: AdamW without weight decay
    let params = ParamsAdamW {
        lr: config.step_size,
        beta1: config.beta1,
        beta2: config.beta2,
        eps: config.eps,
        weight_decay: 0.,
    };
    let mut adam = AdamW::new(varmap.all_vars(), params)?;

    let pb = ProgressBar::new(config.num_steps as u64);
    if !config.show_progress {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    }

    let mut losses = Vec::with_capacity(config.num_steps);

    for step in 0..config.num_steps {
        let loss = loss_fn(step)?;
        adam.backward_step(&loss)?;

        let loss_val = loss.to_dtype(DType::F64)?.to_scalar::<f64>()?;
        losses.push(loss_val);
        pb.inc(1);

        if config.log_every > 0 && (step % config.log_every == 0 || step + 1 == config.num_steps)
        {
            info!("[{}] loss: {:.4}", step + 1, loss_val);
        }
    }

    pb.finish_and_clear();
    Ok(losses)
}

/// Full-batch training data, already on the model's dtype and device
pub struct ObservedData<'a> {
    /// inputs `(n, *data_dim)`
    pub x: &'a Tensor,
    /// targets `(n,)`
    pub y: &'a Tensor,
}

impl ObservedData<'_> {
    pub fn dtype(&self) -> DType {
        self.x.dtype()
    }

    pub fn device(&self) -> &Device {
        self.x.device()
    }
}

/// Negative ELBO averaged over the guide's particles (scalar)
pub fn elbo_loss(
    model: &DklModel,
    guide: &AutoGuide,
    vb: &VarBuilder,
    data: &ObservedData,
    rng: &mut StdRng,
) -> Result<Tensor> {
    let num_particles = guide.strategy.num_particles();

    let mut elbo_tot: Option<Tensor> = None;
    for _ in 0..num_particles {
        let mut trace = Trace::new(
            guide,
            &mut *rng,
            TraceMode::Guided,
            data.dtype(),
            data.device(),
        );
        model.run(&mut trace, vb, data.x, data.y)?;
        let elbo = trace.log_density()?;
        elbo_tot = Some(match elbo_tot {
            None => elbo,
            Some(tot) => (tot + elbo)?,
        });
    }

    match elbo_tot {
        Some(tot) => (tot / num_particles as f64)?.neg(),
        None => candle_core::bail!("no particles"),
    }
}
