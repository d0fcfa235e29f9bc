//! Classification head shared by every backbone.

use burn::{
    config::Config,
    module::Module,
    nn::{Dropout, DropoutConfig, Linear, LinearConfig, Relu},
    tensor::{backend::Backend, Tensor},
};

use crate::utils::error::SorghumError;

/// Configuration for the [`ClassificationHead`]
#[derive(Config, Debug)]
pub struct HeadConfig {
    /// Width of the backbone feature vector
    pub input_width: usize,

    /// Number of cultivars
    pub num_classes: usize,

    /// `None` gives a single linear layer, `Some(h)` the funnel
    /// `h -> h/2 -> h/4 -> num_classes`
    pub hidden_size: Option<usize>,

    /// Dropout probability, shared by every dropout site
    #[config(default = "0.5")]
    pub dropout: f64,
}

impl HeadConfig {
    pub fn validate(&self) -> crate::utils::error::Result<()> {
        if self.input_width == 0 {
            return Err(SorghumError::Config("head input_width must be > 0".into()));
        }
        if self.num_classes == 0 {
            return Err(SorghumError::Config("num_classes must be > 0".into()));
        }
        if let Some(hidden) = self.hidden_size {
            if hidden < 4 {
                return Err(SorghumError::Config(format!(
                    "hidden_size must be at least 4, got {}",
                    hidden
                )));
            }
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(SorghumError::Config(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        Ok(())
    }

    /// Layer widths from input to logits
    pub fn widths(&self) -> Vec<usize> {
        match self.hidden_size {
            None => vec![self.input_width, self.num_classes],
            Some(h) => vec![self.input_width, h, h / 2, h / 4, self.num_classes],
        }
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> crate::utils::error::Result<ClassificationHead<B>> {
        self.validate()?;

        let layers = self
            .widths()
            .windows(2)
            .map(|pair| LinearConfig::new(pair[0], pair[1]).init(device))
            .collect();

        Ok(ClassificationHead {
            dropout: DropoutConfig::new(self.dropout).init(),
            relu: Relu::new(),
            layers,
        })
    }
}

/// Feed-forward stack from features to logits, no final activation
#[derive(Module, Debug)]
pub struct ClassificationHead<B: Backend> {
    dropout: Dropout,
    relu: Relu,
    layers: Vec<Linear<B>>,
}

impl<B: Backend> ClassificationHead<B> {
    /// `[batch, input_width]` -> `[batch, num_classes]`
    pub fn forward(&self, features: Tensor<B, 2>) -> Tensor<B, 2> {
        let mut x = features;
        for (i, layer) in self.layers.iter().enumerate() {
            if i > 0 {
                x = self.relu.forward(x);
            }
            x = layer.forward(self.dropout.forward(x));
        }
        x
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }
}
