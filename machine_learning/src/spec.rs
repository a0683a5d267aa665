use crate::{MlErr, Result};

/// The static description of a feed-forward network: one `(inputs, outputs)`
/// pair per trainable layer, the batch size used for training and evaluation
/// chunking, and the base learning rate.
///
/// A spec is plain data; building the live [`Network`](crate::Network) from it
/// validates it first, so an invalid chain is caught before any weights are
/// allocated.
#[derive(Debug, Clone)]
pub struct NetworkSpec {
    pub layers: Vec<(usize, usize)>,
    pub batch: usize,
    pub learning_rate: f32,
}

impl NetworkSpec {
    /// Creates a validated spec.
    pub fn new(layers: Vec<(usize, usize)>, batch: usize, learning_rate: f32) -> Result<Self> {
        let spec = Self {
            layers,
            batch,
            learning_rate,
        };
        spec.validate()?;
        Ok(spec)
    }

    /// Checks that the layer widths chain, every width is non-zero, the batch
    /// size is non-zero and the learning rate is usable.
    pub fn validate(&self) -> Result<()> {
        if self.layers.is_empty() {
            return Err(MlErr::EmptyNetwork);
        }
        if self.batch == 0 {
            return Err(MlErr::ZeroBatch);
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(MlErr::BadRate {
                rate: self.learning_rate,
            });
        }

        let mut previous = self.layers[0].1;
        for (layer, &(input, output)) in self.layers.iter().enumerate() {
            if input == 0 || output == 0 {
                return Err(MlErr::ZeroWidth { layer });
            }
            if layer > 0 && input != previous {
                return Err(MlErr::WidthChain {
                    layer,
                    got: input,
                    expected: previous,
                });
            }
            previous = output;
        }

        Ok(())
    }

    /// The number of input features the first layer consumes.
    pub fn features(&self) -> usize {
        self.layers[0].0
    }

    /// The number of classes the last layer produces.
    pub fn classes(&self) -> usize {
        self.layers[self.layers.len() - 1].1
    }

    pub fn trainable_layers(&self) -> usize {
        self.layers.len()
    }

    /// The parameter count of one layer: an `inputs x outputs` weight matrix
    /// plus a bias row.
    pub fn layer_len(&self, layer: usize) -> usize {
        let (input, output) = self.layers[layer];
        (input + 1) * output
    }
}
