use ndarray::prelude::*;
use rand::{SeedableRng, rngs::StdRng};
use rand_distr::{Distribution, Normal};

use crate::{
    MlErr, Result,
    dense::{ActFn, Dense},
    spec::NetworkSpec,
};

/// Numeric guard inside the cross-entropy log.
const BUMP: f32 = 1e-10;

/// How a forward or backward pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    Completed,
    Interrupted,
}

impl PassOutcome {
    pub fn completed(&self) -> bool {
        matches!(self, PassOutcome::Completed)
    }
}

/// The compute capabilities the synchronization layer consumes.
///
/// Weights and gradients are exposed as flat `f32` slices, one per trainable
/// layer, so they can be moved over the wire without any repacking. Both
/// passes take a callback: `probe` is polled after every layer of the forward
/// pass, `sink` receives each layer's gradient the moment it exists during
/// the backward pass. Returning `false` from either abandons the rest of the
/// pass, which is what lets a caller stop computing against weights it
/// already knows are stale.
pub trait Model {
    fn trainable_layers(&self) -> usize;

    /// The parameter count of one trainable layer.
    fn layer_len(&self, layer: usize) -> usize;

    fn learning_rate(&self) -> f32;

    fn weights(&self, layer: usize) -> &[f32];

    fn gradient(&self, layer: usize) -> &[f32];

    /// Overwrites one layer's parameters. Errs when `data` is not exactly
    /// the layer's parameter count.
    fn commit_weights(&mut self, layer: usize, data: &[f32]) -> Result<()>;

    /// Steps one layer's parameters against a gradient: `w -= rate * g`.
    fn apply_update(&mut self, layer: usize, rate: f32, grad: &[f32]) -> Result<()>;

    /// Runs the batch through the network, leaving class probabilities ready
    /// for [`Model::backward`].
    fn forward<P>(&mut self, x: ArrayView2<f32>, probe: P) -> Result<PassOutcome>
    where
        P: FnMut() -> bool;

    /// Runs the backward pass against one-hot labels `y`. Must follow a
    /// completed forward pass over the matching batch. Gradients are handed
    /// to `sink` from the last trainable layer down to the first.
    fn backward<S>(&mut self, y: ArrayView2<f32>, sink: S) -> Result<PassOutcome>
    where
        S: FnMut(usize, &[f32]) -> bool;

    /// Total cross-entropy loss over a dataset, evaluated in batch chunks.
    fn loss(&mut self, x: ArrayView2<f32>, y: ArrayView2<f32>) -> Result<f32>;

    /// Fraction of rows whose predicted class is not the labelled class.
    fn error_rate(&mut self, x: ArrayView2<f32>, y: ArrayView2<f32>) -> Result<f32>;
}

/// A feed-forward classifier: a stack of dense layers with relu between
/// them and a softmax/cross-entropy terminal stage.
///
/// The terminal stage owns no parameters, so "trainable layers" and "dense
/// layers" are the same set and index gradients, weights and transport
/// channels alike.
#[derive(Clone)]
pub struct Network {
    spec: NetworkSpec,
    layers: Vec<Dense>,
    params: Vec<Vec<f32>>,
    grads: Vec<Vec<f32>>,
    probs: Array2<f32>,
}

impl Network {
    /// Builds the network and samples its initial weights from per-layer
    /// LeCun normal distributions.
    pub fn new(spec: NetworkSpec, seed: u64) -> Result<Self> {
        spec.validate()?;

        let hidden = spec.layers.len() - 1;
        let layers = spec
            .layers
            .iter()
            .enumerate()
            .map(|(i, &dim)| {
                let act_fn = if i < hidden { Some(ActFn::Relu) } else { None };
                Dense::new(dim, act_fn)
            })
            .collect();

        let mut rng = StdRng::seed_from_u64(seed);
        let mut params = Vec::with_capacity(spec.layers.len());
        let mut grads = Vec::with_capacity(spec.layers.len());
        for (layer, &(input, _)) in spec.layers.iter().enumerate() {
            let len = spec.layer_len(layer);
            let normal = Normal::new(0.0, (1.0 / input as f32).sqrt())?;
            params.push((0..len).map(|_| normal.sample(&mut rng)).collect());
            grads.push(vec![0.0; len]);
        }

        Ok(Self {
            spec,
            layers,
            params,
            grads,
            probs: Array2::zeros((0, 0)),
        })
    }

    pub fn spec(&self) -> &NetworkSpec {
        &self.spec
    }

    /// The class probabilities left behind by the last completed forward.
    pub fn probs(&self) -> ArrayView2<'_, f32> {
        self.probs.view()
    }
}

impl Model for Network {
    fn trainable_layers(&self) -> usize {
        self.layers.len()
    }

    fn layer_len(&self, layer: usize) -> usize {
        self.spec.layer_len(layer)
    }

    fn learning_rate(&self) -> f32 {
        self.spec.learning_rate
    }

    fn weights(&self, layer: usize) -> &[f32] {
        &self.params[layer]
    }

    fn gradient(&self, layer: usize) -> &[f32] {
        &self.grads[layer]
    }

    fn commit_weights(&mut self, layer: usize, data: &[f32]) -> Result<()> {
        let params = &mut self.params[layer];
        if data.len() != params.len() {
            return Err(MlErr::SizeMismatch {
                what: "committed weights",
                got: data.len(),
                expected: params.len(),
            });
        }
        params.copy_from_slice(data);
        Ok(())
    }

    fn apply_update(&mut self, layer: usize, rate: f32, grad: &[f32]) -> Result<()> {
        let params = &mut self.params[layer];
        if grad.len() != params.len() {
            return Err(MlErr::SizeMismatch {
                what: "update gradient",
                got: grad.len(),
                expected: params.len(),
            });
        }
        for (p, g) in params.iter_mut().zip(grad) {
            *p -= rate * g;
        }
        Ok(())
    }

    fn forward<P>(&mut self, x: ArrayView2<f32>, mut probe: P) -> Result<PassOutcome>
    where
        P: FnMut() -> bool,
    {
        if x.ncols() != self.spec.features() {
            return Err(MlErr::SizeMismatch {
                what: "input features",
                got: x.ncols(),
                expected: self.spec.features(),
            });
        }

        let mut cur = x;
        for (i, layer) in self.layers.iter_mut().enumerate() {
            cur = layer.forward(&self.params[i], cur);
            if !probe() {
                return Ok(PassOutcome::Interrupted);
            }
        }

        let shape = (cur.nrows(), cur.ncols());
        if self.probs.dim() != shape {
            self.probs = Array2::zeros(shape);
        }
        for (z, out) in cur.outer_iter().zip(self.probs.outer_iter_mut()) {
            softmax_row(z, out);
        }

        Ok(PassOutcome::Completed)
    }

    fn backward<S>(&mut self, y: ArrayView2<f32>, mut sink: S) -> Result<PassOutcome>
    where
        S: FnMut(usize, &[f32]) -> bool,
    {
        if y.dim() != self.probs.dim() {
            return Err(MlErr::SizeMismatch {
                what: "labels",
                got: y.len(),
                expected: self.probs.len(),
            });
        }

        // Mean gradient of softmax + cross-entropy over the batch.
        let mut delta = (&self.probs - &y) / y.nrows() as f32;
        let mut d = delta.view_mut();

        let last = self.layers.len() - 1;
        for (back, layer) in self.layers.iter_mut().rev().enumerate() {
            let i = last - back;
            d = layer.backward(&self.params[i], &mut self.grads[i], d);
            if !sink(i, &self.grads[i]) && i > 0 {
                return Ok(PassOutcome::Interrupted);
            }
        }

        Ok(PassOutcome::Completed)
    }

    fn loss(&mut self, x: ArrayView2<f32>, y: ArrayView2<f32>) -> Result<f32> {
        if x.nrows() != y.nrows() {
            return Err(MlErr::SizeMismatch {
                what: "dataset rows",
                got: y.nrows(),
                expected: x.nrows(),
            });
        }

        let batch = self.spec.batch;
        let mut total = 0.0;
        for (xb, yb) in x
            .axis_chunks_iter(Axis(0), batch)
            .zip(y.axis_chunks_iter(Axis(0), batch))
        {
            self.forward(xb, || true)?;
            total += self
                .probs
                .iter()
                .zip(yb.iter())
                .map(|(&p, &t)| -((p + BUMP).ln()) * t)
                .sum::<f32>();
        }

        Ok(total)
    }

    fn error_rate(&mut self, x: ArrayView2<f32>, y: ArrayView2<f32>) -> Result<f32> {
        if x.nrows() != y.nrows() {
            return Err(MlErr::SizeMismatch {
                what: "dataset rows",
                got: y.nrows(),
                expected: x.nrows(),
            });
        }

        let batch = self.spec.batch;
        let mut wrong = 0usize;
        let mut seen = 0usize;
        for (xb, yb) in x
            .axis_chunks_iter(Axis(0), batch)
            .zip(y.axis_chunks_iter(Axis(0), batch))
        {
            self.forward(xb, || true)?;
            for (p, t) in self.probs.outer_iter().zip(yb.outer_iter()) {
                if argmax(p) != argmax(t) {
                    wrong += 1;
                }
                seen += 1;
            }
        }

        if seen == 0 {
            return Ok(0.0);
        }
        Ok(wrong as f32 / seen as f32)
    }
}

/// Writes a numerically shifted softmax of `z` into `out`.
fn softmax_row(z: ArrayView1<f32>, mut out: ArrayViewMut1<f32>) {
    let max = z.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
    let mut sum = 0.0;
    for (o, &v) in out.iter_mut().zip(z.iter()) {
        let e = (v - max).exp();
        *o = e;
        sum += e;
    }
    for o in out.iter_mut() {
        *o /= sum;
    }
}

fn argmax(row: ArrayView1<f32>) -> usize {
    let mut best = 0;
    let mut max = f32::NEG_INFINITY;
    for (i, &v) in row.iter().enumerate() {
        if v > max {
            best = i;
            max = v;
        }
    }
    best
}
