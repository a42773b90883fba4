use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{Activation, Linear, Module, VarBuilder, VarMap};
use log::debug;
use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};
use std::collections::HashMap;

/// Variable-name scope of the embedding network
pub const FEATURE_EXTRACTOR: &str = "feature_extractor";

/// Seed of the embedding network whenever a fitted model is applied or
/// its median is read out
pub const PREDICTION_SEED: u64 = 0;

/// Neural network mapping raw inputs to latent features
///
/// The network is a pure function of its parameters: `forward` looks every
/// weight up through `vb`, so the same implementation both registers
/// trainable variables (a `VarMap`-backed builder) and applies a frozen
/// snapshot (a tensor-backed builder).
pub trait FeatureExtractor {
    /// * `vb` - parameter scope
    /// * `x` - inputs `(n, *data_dim)`
    /// * `seed` - seed for stochastic layers
    ///
    /// Returns latent features `(n, dim_latent)`.
    fn forward(&self, vb: VarBuilder, x: &Tensor, seed: u64) -> Result<Tensor>;

    fn dim_latent(&self) -> usize;
}

/// build a stack of linear layers, each followed by an optional activation
struct StackLayers {
    layers: Vec<(Linear, Option<Activation>)>,
}

impl Module for StackLayers {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let mut x = input.clone();
        for (layer, activation) in self.layers.iter() {
            x = layer.forward(&x)?;
            if let Some(activation) = activation {
                x = activation.forward(&x)?;
            }
        }
        Ok(x)
    }
}

impl StackLayers {
    fn new() -> Self {
        Self { layers: vec![] }
    }

    fn push_with_act(&mut self, layer: Linear, activation: Activation) {
        self.layers.push((layer, Some(activation)));
    }

    fn push(&mut self, layer: Linear) {
        self.layers.push((layer, None));
    }
}

/// Fully connected ReLU network, `64 -> 64 -> z_dim` by default
#[derive(Clone, Debug)]
pub struct Mlp {
    hidden: Vec<usize>,
    z_dim: usize,
}

impl Mlp {
    pub fn new(z_dim: usize) -> Self {
        Self::with_hidden(vec![64, 64], z_dim)
    }

    pub fn with_hidden(hidden: Vec<usize>, z_dim: usize) -> Self {
        Self { hidden, z_dim }
    }
}

impl FeatureExtractor for Mlp {
    fn forward(&self, vb: VarBuilder, x: &Tensor, _seed: u64) -> Result<Tensor> {
        let x_nd = x.flatten_from(1)?;
        let mut prev_dim = x_nd.dim(1)?;

        let mut fc = StackLayers::new();
        for (j, &next_dim) in self.hidden.iter().enumerate() {
            fc.push_with_act(
                candle_nn::linear(prev_dim, next_dim, vb.pp(format!("fc.{}", j)))?,
                Activation::Relu,
            );
            prev_dim = next_dim;
        }
        fc.push(candle_nn::linear(prev_dim, self.z_dim, vb.pp("z"))?);

        fc.forward(&x_nd)
    }

    fn dim_latent(&self) -> usize {
        self.z_dim
    }
}

/// Frozen snapshot of the network weights, keyed by full variable name
#[derive(Clone, Debug, Default)]
pub struct NetworkParams {
    tensors: HashMap<String, Tensor>,
}

impl NetworkParams {
    /// Copy every variable under `prefix.` out of the `VarMap`
    pub fn from_varmap(varmap: &VarMap, prefix: &str) -> Result<Self> {
        let scope = format!("{}.", prefix);
        let data = varmap
            .data()
            .lock()
            .map_err(|e| candle_core::Error::Msg(format!("varmap lock: {}", e)))?;

        let mut tensors = HashMap::new();
        for (name, var) in data.iter() {
            if name.starts_with(&scope) {
                tensors.insert(name.clone(), var.as_tensor().detach().copy()?);
            }
        }
        Ok(Self { tensors })
    }

    /// A builder that serves the snapshot instead of creating variables
    pub fn var_builder(&self, dtype: DType, device: &Device) -> VarBuilder<'static> {
        VarBuilder::from_tensors(self.tensors.clone(), dtype, device)
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    /// Variable names in sorted order
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tensors.keys().map(|s| s.as_str()).collect();
        names.sort();
        names
    }
}

/// Re-draw every network variable under `prefix.` from `rng`
///
/// Weights `(out, in)` follow a normal truncated at two standard
/// deviations with std `1/sqrt(in)`; biases start at zero. Variables are
/// visited in name order so a seed always gives the same network.
pub fn initialize_network(varmap: &VarMap, prefix: &str, rng: &mut StdRng) -> Result<()> {
    let scope = format!("{}.", prefix);
    let data = varmap
        .data()
        .lock()
        .map_err(|e| candle_core::Error::Msg(format!("varmap lock: {}", e)))?;

    let mut names: Vec<&String> = data.keys().filter(|k| k.starts_with(&scope)).collect();
    names.sort();

    for name in names {
        let var = &data[name];
        let dims = var.dims().to_vec();

        let init = if name.ends_with(".bias") {
            var.zeros_like()?
        } else {
            let fan_in = dims.last().copied().unwrap_or(1).max(1);
            let stdev = 1. / (fan_in as f64).sqrt();
            let n = var.elem_count();
            let data: Vec<f64> = (0..n).map(|_| truncated_normal(rng) * stdev).collect();
            Tensor::from_vec(data, dims.as_slice(), var.device())?.to_dtype(var.dtype())?
        };
        var.set(&init)?;
        debug!("initialized {} {:?}", name, dims);
    }
    Ok(())
}

fn truncated_normal(rng: &mut StdRng) -> f64 {
    loop {
        let x: f64 = StandardNormal.sample(rng);
        if x.abs() <= 2. {
            return x;
        }
    }
}

/// Apply a frozen network to `x`, checking the latent dimension
pub fn apply(
    extractor: &dyn FeatureExtractor,
    nn_params: &NetworkParams,
    x: &Tensor,
    seed: u64,
) -> Result<Tensor> {
    let vb = nn_params.var_builder(x.dtype(), x.device());
    let z_nk = extractor.forward(vb.pp(FEATURE_EXTRACTOR), x, seed)?;

    let (n, k) = z_nk.dims2()?;
    if n != x.dim(0)? || k != extractor.dim_latent() {
        candle_core::bail!(
            "embedding of {} inputs has shape {:?}, expected ({}, {})",
            x.dim(0)?,
            z_nk.dims(),
            x.dim(0)?,
            extractor.dim_latent()
        );
    }
    Ok(z_nk)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn register(varmap: &VarMap, mlp: &Mlp, x: &Tensor) -> Result<Tensor> {
        let vb = VarBuilder::from_varmap(varmap, DType::F64, &Device::Cpu);
        mlp.forward(vb.pp(FEATURE_EXTRACTOR), x, 0)
    }

    #[test]
    fn mlp_registers_named_layers() -> Result<()> {
        let varmap = VarMap::new();
        let mlp = Mlp::new(2);
        let x = Tensor::zeros((7, 5), DType::F64, &Device::Cpu)?;
        let z = register(&varmap, &mlp, &x)?;
        assert_eq!(z.dims(), &[7, 2]);

        let params = NetworkParams::from_varmap(&varmap, FEATURE_EXTRACTOR)?;
        assert_eq!(
            params.names(),
            vec![
                "feature_extractor.fc.0.bias",
                "feature_extractor.fc.0.weight",
                "feature_extractor.fc.1.bias",
                "feature_extractor.fc.1.weight",
                "feature_extractor.z.bias",
                "feature_extractor.z.weight",
            ]
        );
        let w0 = params.get("feature_extractor.fc.0.weight");
        assert_eq!(w0.map(|w| w.dims().to_vec()), Some(vec![64, 5]));
        Ok(())
    }

    #[test]
    fn multi_dimensional_inputs_are_flattened() -> Result<()> {
        let varmap = VarMap::new();
        let mlp = Mlp::with_hidden(vec![8], 3);
        let x = Tensor::ones((4, 2, 3), DType::F64, &Device::Cpu)?;
        let z = register(&varmap, &mlp, &x)?;
        assert_eq!(z.dims(), &[4, 3]);
        Ok(())
    }

    #[test]
    fn seeded_initialization_is_reproducible() -> Result<()> {
        let mlp = Mlp::new(2);
        let x = Tensor::new(&[[0.1_f64, 0.2, 0.3], [1.0, -1.0, 0.5]], &Device::Cpu)?;

        let init = |seed: u64| -> Result<Tensor> {
            let varmap = VarMap::new();
            register(&varmap, &mlp, &x)?;
            let mut rng = StdRng::seed_from_u64(seed);
            initialize_network(&varmap, FEATURE_EXTRACTOR, &mut rng)?;
            let params = NetworkParams::from_varmap(&varmap, FEATURE_EXTRACTOR)?;
            apply(&mlp, &params, &x, 0)
        };

        let a = init(42)?.to_vec2::<f64>()?;
        let b = init(42)?.to_vec2::<f64>()?;
        let c = init(7)?.to_vec2::<f64>()?;
        assert_eq!(a, b);
        assert_ne!(a, c);
        Ok(())
    }

    #[test]
    fn biases_start_at_zero_and_weights_are_truncated() -> Result<()> {
        let varmap = VarMap::new();
        let mlp = Mlp::new(2);
        let x = Tensor::zeros((1, 16), DType::F64, &Device::Cpu)?;
        register(&varmap, &mlp, &x)?;

        let mut rng = StdRng::seed_from_u64(0);
        initialize_network(&varmap, FEATURE_EXTRACTOR, &mut rng)?;
        let params = NetworkParams::from_varmap(&varmap, FEATURE_EXTRACTOR)?;

        let bias = params.get("feature_extractor.fc.0.bias");
        let bias = bias.map(|b| b.to_vec1::<f64>()).transpose()?;
        assert_eq!(bias, Some(vec![0.0; 64]));

        let bound = 2. / (16_f64).sqrt();
        if let Some(w) = params.get("feature_extractor.fc.0.weight") {
            let max = w.abs()?.max_all()?.to_scalar::<f64>()?;
            assert!(max <= bound + 1e-12);
        }
        Ok(())
    }

    #[test]
    fn frozen_network_rejects_wrong_latent_dim() -> Result<()> {
        let varmap = VarMap::new();
        let x = Tensor::zeros((3, 4), DType::F64, &Device::Cpu)?;
        register(&varmap, &Mlp::new(2), &x)?;
        let params = NetworkParams::from_varmap(&varmap, FEATURE_EXTRACTOR)?;

        // same weights read with a different output width
        assert!(apply(&Mlp::new(3), &params, &x, 0).is_err());
        Ok(())
    }
}
