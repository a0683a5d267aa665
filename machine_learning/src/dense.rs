use ndarray::{linalg, prelude::*};

/// A pointwise activation, applied on top of a dense layer's affine output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActFn {
    Relu,
    Sigmoid,
}

impl ActFn {
    pub fn f(&self, x: f32) -> f32 {
        match self {
            ActFn::Relu => x.max(0.0),
            ActFn::Sigmoid => 1.0 / (1.0 + (-x).exp()),
        }
    }

    /// The derivative with respect to the pre-activation input. For relu the
    /// kink at zero counts as active, matching the forward clamp.
    pub fn df(&self, x: f32) -> f32 {
        match self {
            ActFn::Relu => {
                if x < 0.0 {
                    0.0
                } else {
                    1.0
                }
            }
            ActFn::Sigmoid => {
                let s = self.f(x);
                s * (1.0 - s)
            }
        }
    }
}

/// A fully connected layer over externally owned parameters.
///
/// The layer itself only holds its dimensions and the per-pass caches; the
/// parameter and gradient slices are passed in on every call so that the
/// network can hand the same storage to the synchronization layer untouched.
/// Parameter layout: a row-major `inputs x outputs` weight matrix followed by
/// one bias per output.
#[derive(Clone)]
pub struct Dense {
    dim: (usize, usize),
    act_fn: Option<ActFn>,
    size: usize,

    // Forward caches
    x: Array2<f32>,
    z: Array2<f32>,
    a: Array2<f32>,

    // Backward scratch
    d: Array2<f32>,
}

impl Dense {
    pub fn new(dim: (usize, usize), act_fn: Option<ActFn>) -> Self {
        let zeros = Array2::zeros((0, 0));

        Self {
            dim,
            size: (dim.0 + 1) * dim.1,
            act_fn,
            x: zeros.clone(),
            z: zeros.clone(),
            a: zeros.clone(),
            d: zeros,
        }
    }

    /// The amount of parameters this layer has, biases included.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Computes `act(x * w + b)` for a batch of rows, caching what the
    /// backward pass needs. The returned view borrows this layer's caches.
    pub fn forward(&mut self, params: &[f32], x: ArrayView2<f32>) -> ArrayView2<'_, f32> {
        let (w, b) = self.view_params(params);
        let shape = (x.nrows(), self.dim.1);

        if self.z.dim() != shape {
            self.z = Array2::zeros(shape);
        }
        linalg::general_mat_mul(1.0, &x, &w, 0.0, &mut self.z);
        self.z += &b;

        self.x = x.to_owned();

        let Some(ref act_fn) = self.act_fn else {
            return self.z.view();
        };

        if self.a.dim() != shape {
            self.a = Array2::zeros(shape);
        }
        self.a.zip_mut_with(&self.z, |a, &z| *a = act_fn.f(z));
        self.a.view()
    }

    /// Consumes the downstream delta, writes this layer's gradient into
    /// `grad` and returns the delta for the layer below.
    pub fn backward(
        &mut self,
        params: &[f32],
        grad: &mut [f32],
        mut d: ArrayViewMut2<f32>,
    ) -> ArrayViewMut2<'_, f32> {
        if let Some(act_fn) = &self.act_fn {
            d.zip_mut_with(&self.z, |d, &z| *d *= act_fn.df(z));
        }

        let (mut dw, mut db) = self.view_grad(grad);
        linalg::general_mat_mul(1.0, &self.x.t(), &d, 0.0, &mut dw);
        db.assign(&d.sum_axis(Axis(0)));

        let (w, _) = self.view_params(params);
        let shape = (d.nrows(), w.nrows());
        if self.d.dim() != shape {
            self.d = Array2::zeros(shape);
        }
        linalg::general_mat_mul(1.0, &d, &w.t(), 0.0, &mut self.d);

        self.d.view_mut()
    }

    /// Views the raw parameter slice as this layer's weights and biases.
    fn view_params<'a>(&self, params: &'a [f32]) -> (ArrayView2<'a, f32>, ArrayView1<'a, f32>) {
        let w_size = self.size - self.dim.1;
        let weights = ArrayView2::from_shape(self.dim, &params[..w_size]).unwrap();
        let biases = ArrayView1::from_shape(self.dim.1, &params[w_size..]).unwrap();
        (weights, biases)
    }

    /// Views the raw gradient slice as this layer's delta weights and biases.
    fn view_grad<'a>(
        &self,
        grad: &'a mut [f32],
    ) -> (ArrayViewMut2<'a, f32>, ArrayViewMut1<'a, f32>) {
        let w_size = self.size - self.dim.1;
        let (dw_raw, db_raw) = grad.split_at_mut(w_size);
        let dw = ArrayViewMut2::from_shape(self.dim, dw_raw).unwrap();
        let db = ArrayViewMut1::from_shape(self.dim.1, db_raw).unwrap();
        (dw, db)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_is_x_w_plus_b() {
        let mut layer = Dense::new((2, 2), None);
        // w = [[1, 2], [3, 4]], b = [10, 20]
        let params = [1.0, 2.0, 3.0, 4.0, 10.0, 20.0];
        let x = array![[1.0, 1.0], [2.0, 0.0]];

        let out = layer.forward(&params, x.view());
        assert_eq!(out, array![[14.0, 26.0], [12.0, 24.0]]);
    }

    #[test]
    fn relu_clamps_forward_and_gates_backward() {
        let mut layer = Dense::new((1, 2), Some(ActFn::Relu));
        // w = [[1, -1]], b = [0, 0]
        let params = [1.0, -1.0, 0.0, 0.0];
        let x = array![[2.0]];

        let out = layer.forward(&params, x.view());
        assert_eq!(out, array![[2.0, 0.0]]);

        let mut grad = [0.0f32; 4];
        let mut d = array![[1.0, 1.0]];
        let below = layer.backward(&params, &mut grad, d.view_mut());

        // The negative pre-activation kills its column of the delta.
        assert_eq!(grad, [2.0, 0.0, 1.0, 0.0]);
        assert_eq!(below, array![[1.0]]);
    }

    #[test]
    fn caches_track_the_batch_size() {
        let mut layer = Dense::new((3, 2), Some(ActFn::Relu));
        let params = vec![0.5; layer.size()];

        let first = layer.forward(&params, Array2::ones((4, 3)).view()).nrows();
        assert_eq!(first, 4);
        let second = layer.forward(&params, Array2::ones((7, 3)).view()).nrows();
        assert_eq!(second, 7);
    }
}
