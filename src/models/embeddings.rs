use burn::config::Config;
use burn::module::Module;
use burn::nn::{Linear, LinearConfig};
use burn::tensor::activation::gelu;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

#[derive(Config, Debug)]
pub struct EmbedFCConfig {
    input_dim: usize,
    emb_dim: usize,
}

/// Two layer fully connected embedding of a timestep or a class context.
#[derive(Module, Debug)]
pub struct EmbedFC<B: Backend> {
    linear_1: Linear<B>,
    linear_2: Linear<B>,
    emb_dim: usize,
}

impl EmbedFCConfig {
    /// Initialize a new [embedding](EmbedFC) module.
    /// Uses activating function: "gelu".
    pub fn init<B: Backend>(&self, device: &B::Device) -> EmbedFC<B> {
        let linear_1 = LinearConfig::new(self.input_dim, self.emb_dim).init(device);
        let linear_2 = LinearConfig::new(self.emb_dim, self.emb_dim).init(device);
        EmbedFC {
            linear_1,
            linear_2,
            emb_dim: self.emb_dim,
        }
    }
}

impl<B: Backend> EmbedFC<B> {
    /// Embeds `[batch, input_dim]` into `[batch, emb_dim]`.
    pub fn forward(&self, xs: Tensor<B, 2>) -> Tensor<B, 2> {
        let xs = gelu(self.linear_1.forward(xs));
        self.linear_2.forward(xs)
    }

    /// Embeds and reshapes to `[batch, emb_dim, 1, 1]` for per-channel
    /// modulation of a feature map.
    pub fn forward_spatial(&self, xs: Tensor<B, 2>) -> Tensor<B, 4> {
        let [batch, _] = xs.dims();
        self.forward(xs).reshape([batch, self.emb_dim, 1, 1])
    }
}
