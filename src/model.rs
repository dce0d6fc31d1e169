use burn::config::Config;
use burn::module::{Ignored, Module};
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig};
use burn::nn::{
    BiLstm, BiLstmConfig, Dropout, DropoutConfig, Linear, LinearConfig, Lstm, LstmConfig,
    PaddingConfig2d, Relu,
};
use burn::tensor::activation::softmax;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use crate::config::TemporalPool;

/// Per-frame spatial encoder: a small convolutional stack with two 2x
/// downsampling steps, global average pooling and a linear projection to the
/// embedding dimension.
#[derive(Module, Debug)]
pub struct SpaceCnn<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    conv3: Conv2d<B>,
    conv4: Conv2d<B>,
    pool: MaxPool2d,
    avg: AdaptiveAvgPool2d,
    fc: Linear<B>,
    relu: Relu,
}

impl<B: Backend> SpaceCnn<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.relu.forward(self.conv1.forward(x));
        let x = self.pool.forward(self.relu.forward(self.conv2.forward(x)));
        let x = self.pool.forward(self.relu.forward(self.conv3.forward(x)));
        let x = self.relu.forward(self.conv4.forward(x));
        let x = self.avg.forward(x);
        let flat: Tensor<B, 2> = x.flatten(1, 3);
        self.fc.forward(flat)
    }
}

/// Collapses the hidden-state sequence into one vector per sample, then maps
/// it to class logits.
#[derive(Module, Debug)]
pub struct TemporalHead<B: Backend> {
    mode: Ignored<TemporalPool>,
    attn: Option<Linear<B>>,
    drop: Dropout,
    fc: Linear<B>,
}

impl<B: Backend> TemporalHead<B> {
    pub fn forward(&self, seq: Tensor<B, 3>) -> Tensor<B, 2> {
        let [_, t, _] = seq.dims();
        let pooled: Tensor<B, 2> = match (self.mode.0, &self.attn) {
            (TemporalPool::Mean, _) => seq.mean_dim(1).squeeze(1),
            (TemporalPool::Attn, Some(attn)) => {
                let scores: Tensor<B, 2> = attn.forward(seq.clone()).squeeze(2);
                let weights = softmax(scores, 1).unsqueeze_dim::<3>(2);
                (seq * weights).sum_dim(1).squeeze(1)
            }
            // Last, or an attention head that was never materialized.
            _ => seq.narrow(1, t - 1, 1).squeeze(1),
        };
        self.fc.forward(self.drop.forward(pooled))
    }
}

#[derive(Config, Debug)]
pub struct FallNetConfig {
    pub in_channels: usize,
    pub num_classes: usize,
    pub temporal_pool: TemporalPool,
    #[config(default = 256)]
    pub cnn_out: usize,
    #[config(default = 256)]
    pub lstm_hidden: usize,
    #[config(default = 2)]
    pub lstm_layers: usize,
    #[config(default = false)]
    pub bidirectional: bool,
    #[config(default = 0.3)]
    pub dropout: f64,
}

/// Spatial encoder applied per frame, a stacked (bi)directional LSTM over
/// the embedding sequence, and a temporal pooling head.
#[derive(Module, Debug)]
pub struct FallNet<B: Backend> {
    cnn: SpaceCnn<B>,
    uni: Vec<Lstm<B>>,
    bi: Vec<BiLstm<B>>,
    head: TemporalHead<B>,
}

impl FallNetConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> FallNet<B> {
        let conv = |io: [usize; 2], device: &B::Device| {
            Conv2dConfig::new(io, [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device)
        };
        let cnn = SpaceCnn {
            conv1: conv([self.in_channels, 64], device),
            conv2: conv([64, 64], device),
            conv3: conv([64, 128], device),
            conv4: conv([128, 256], device),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            avg: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            fc: LinearConfig::new(256, self.cnn_out).init(device),
            relu: Relu::new(),
        };

        let mut uni = Vec::new();
        let mut bi = Vec::new();
        let mut input = self.cnn_out;
        for _ in 0..self.lstm_layers {
            if self.bidirectional {
                bi.push(BiLstmConfig::new(input, self.lstm_hidden, true).init(device));
                input = self.lstm_hidden * 2;
            } else {
                uni.push(LstmConfig::new(input, self.lstm_hidden, true).init(device));
                input = self.lstm_hidden;
            }
        }

        let feat_dim = self.lstm_hidden * if self.bidirectional { 2 } else { 1 };
        let head = TemporalHead {
            mode: Ignored(self.temporal_pool),
            attn: matches!(self.temporal_pool, TemporalPool::Attn)
                .then(|| LinearConfig::new(feat_dim, 1).init(device)),
            drop: DropoutConfig::new(self.dropout).init(),
            fc: LinearConfig::new(feat_dim, self.num_classes).init(device),
        };

        FallNet { cnn, uni, bi, head }
    }
}

impl<B: Backend> FallNet<B> {
    /// (batch, T, C, H, W) -> (batch, num_classes) logits. Batch and time
    /// are flattened through the spatial encoder.
    pub fn forward(&self, x: Tensor<B, 5>) -> Tensor<B, 2> {
        let [b, t, c, h, w] = x.dims();
        let frames = x.reshape([b * t, c, h, w]);
        let embed = self.cnn.forward(frames);
        let d = embed.dims()[1];
        let mut seq: Tensor<B, 3> = embed.reshape([b, t, d]);
        for lstm in &self.uni {
            let (out, _) = lstm.forward(seq, None);
            seq = out;
        }
        for lstm in &self.bi {
            let (out, _) = lstm.forward(seq, None);
            seq = out;
        }
        self.head.forward(seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NdBackend;

    fn tiny_config(pool: TemporalPool, bidirectional: bool) -> FallNetConfig {
        FallNetConfig::new(33, 3, pool)
            .with_cnn_out(32)
            .with_lstm_hidden(16)
            .with_bidirectional(bidirectional)
    }

    fn forward_shape(pool: TemporalPool, bidirectional: bool) -> [usize; 2] {
        let device = Default::default();
        let model: FallNet<NdBackend> = tiny_config(pool, bidirectional).init(&device);
        let x = Tensor::<NdBackend, 5>::zeros([2, 4, 33, 16, 16], &device);
        model.forward(x).dims()
    }

    #[test]
    fn test_logits_shape_last_pool() {
        assert_eq!(forward_shape(TemporalPool::Last, false), [2, 3]);
    }

    #[test]
    fn test_logits_shape_mean_pool() {
        assert_eq!(forward_shape(TemporalPool::Mean, false), [2, 3]);
    }

    #[test]
    fn test_logits_shape_attn_pool() {
        assert_eq!(forward_shape(TemporalPool::Attn, false), [2, 3]);
    }

    #[test]
    fn test_logits_shape_bidirectional() {
        assert_eq!(forward_shape(TemporalPool::Attn, true), [2, 3]);
    }

    #[test]
    fn test_attention_head_only_built_for_attn() {
        let device = Default::default();
        let attn: FallNet<NdBackend> = tiny_config(TemporalPool::Attn, false).init(&device);
        let mean: FallNet<NdBackend> = tiny_config(TemporalPool::Mean, false).init(&device);
        assert!(attn.head.attn.is_some());
        assert!(mean.head.attn.is_none());
    }
}
