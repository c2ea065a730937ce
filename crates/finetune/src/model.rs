//! The model seam.
//!
//! The trainer only needs named parameters, a loss for a batch of token
//! windows and autoregressive generation. Any network that maps `[batch, seq]`
//! token ids to `[batch, seq, vocab]` logits gets the last two for free.

use std::cmp::Ordering;

use candle_core::{DType, Device, IndexOp, Tensor, Var};
use rand::{
    distributions::{Distribution, WeightedIndex},
    rngs::StdRng,
    Rng, SeedableRng,
};

use crate::{loss::CrossEntropyLoss, FinetuneError, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationOptions {
    /// Tokens to generate after the context.
    pub length: usize,
    pub temperature: f32,
    /// Keep only the `top_k` most likely tokens; 0 keeps all of them.
    pub top_k: usize,
}

pub trait LanguageModel {
    /// All parameters in model order, used for checkpoints and for selecting
    /// the trainable suffix.
    fn parameters(&self) -> Vec<(String, Var)>;

    fn device(&self) -> &Device;

    /// Longest token sequence the model accepts, if bounded.
    fn context_window(&self) -> Option<usize>;

    /// `[batch, seq]` token ids to `[batch, seq, vocab]` logits.
    fn forward(&self, tokens: &Tensor) -> Result<Tensor>;

    /// Mean next-token loss over equally long windows. The result stays
    /// attached to the graph so callers can backpropagate through it.
    fn loss(&self, batch: &[&[u32]]) -> Result<Tensor> {
        let (inputs, targets) = next_token_pair(batch, self.device())?;
        let logits = self.forward(&inputs)?;
        CrossEntropyLoss::new().compute(&logits, &targets)
    }

    /// Returns `context` followed by `options.length` sampled tokens.
    fn generate<R>(&self, context: &[u32], options: &GenerationOptions, rng: &mut R) -> Result<Vec<u32>>
    where
        R: Rng + ?Sized,
    {
        if context.is_empty() {
            return Err(FinetuneError::runtime("generation requires a non-empty context"));
        }

        let mut tokens = context.to_vec();
        for _ in 0..options.length {
            let start = match self.context_window() {
                Some(window) if tokens.len() > window => tokens.len() - window,
                _ => 0,
            };
            let input = Tensor::new(&tokens[start..], self.device())?.unsqueeze(0)?;
            let logits = self.forward(&input)?;
            let (_, seq_len, _) = logits.dims3()?;
            let scores = logits
                .i((0, seq_len - 1))?
                .to_dtype(DType::F32)?
                .to_vec1::<f32>()?;
            let next = sample_next_token(&scores, options.temperature, options.top_k, rng)
                .ok_or_else(|| FinetuneError::runtime("model produced no usable logits"))?;
            tokens.push(next);
        }
        Ok(tokens)
    }
}

/// Splits equally long windows into shifted `[batch, len - 1]` inputs and targets.
pub fn next_token_pair(batch: &[&[u32]], device: &Device) -> Result<(Tensor, Tensor)> {
    let Some(first) = batch.first() else {
        return Err(FinetuneError::runtime("batch must contain at least one window"));
    };
    let seq_len = first.len();
    if seq_len < 2 {
        return Err(FinetuneError::runtime(
            "windows need at least two tokens for next-token prediction",
        ));
    }
    if batch.iter().any(|window| window.len() != seq_len) {
        return Err(FinetuneError::runtime("batch windows must share one length"));
    }

    let flat: Vec<u32> = batch.iter().flat_map(|window| window.iter().copied()).collect();
    let ids = Tensor::from_vec(flat, (batch.len(), seq_len), device)?;
    let inputs = ids.narrow(1, 0, seq_len - 1)?;
    let targets = ids.narrow(1, 1, seq_len - 1)?;
    Ok((inputs, targets))
}

/// Samples a token id from `logits` after temperature scaling and top-k filtering.
pub fn sample_next_token<R>(logits: &[f32], temperature: f32, top_k: usize, rng: &mut R) -> Option<u32>
where
    R: Rng + ?Sized,
{
    if logits.is_empty() {
        return None;
    }

    let inv_temp = 1.0 / temperature.max(1e-4);
    let adjusted: Vec<f32> = logits.iter().map(|logit| logit * inv_temp).collect();

    let max_val = adjusted.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let mut probs: Vec<f32> = adjusted
        .iter()
        .map(|logit| (logit - max_val).exp())
        .collect();

    if !probs.iter().all(|p| p.is_finite()) {
        return None;
    }

    if top_k > 0 && top_k < probs.len() {
        let mut indices: Vec<usize> = (0..probs.len()).collect();
        indices
            .sort_unstable_by(|&a, &b| probs[b].partial_cmp(&probs[a]).unwrap_or(Ordering::Equal));
        for &idx in indices.iter().skip(top_k) {
            probs[idx] = 0.0;
        }
    }

    let sum: f32 = probs.iter().sum();
    if !sum.is_finite() || sum <= 0.0 {
        return adjusted
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(Ordering::Equal))
            .map(|(idx, _)| idx as u32);
    }

    let dist = WeightedIndex::new(&probs).ok()?;
    Some(dist.sample(rng) as u32)
}

/// Next-token logits looked up from a `[vocab, vocab]` table plus a bias.
///
/// Small enough to train on a CPU, and its rank-2 and rank-1 parameters
/// exercise both optimizer slot layouts.
#[derive(Debug)]
pub struct BigramModel {
    transitions: Var,
    bias: Var,
    vocab_size: usize,
    context_window: usize,
    device: Device,
}

impl BigramModel {
    pub fn new(vocab_size: usize, context_window: usize, seed: u64, device: &Device) -> Result<Self> {
        if vocab_size == 0 {
            return Err(FinetuneError::initialization(
                "bigram model requires a non-empty vocabulary",
            ));
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let init: Vec<f32> = (0..vocab_size * vocab_size)
            .map(|_| rng.gen_range(-0.02f32..0.02))
            .collect();
        let transitions = Var::from_tensor(&Tensor::from_vec(
            init,
            (vocab_size, vocab_size),
            device,
        )?)?;
        let bias = Var::zeros(vocab_size, DType::F32, device)?;
        Ok(Self {
            transitions,
            bias,
            vocab_size,
            context_window,
            device: device.clone(),
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }
}

impl LanguageModel for BigramModel {
    fn parameters(&self) -> Vec<(String, Var)> {
        vec![
            ("transitions.weight".to_string(), self.transitions.clone()),
            ("transitions.bias".to_string(), self.bias.clone()),
        ]
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn context_window(&self) -> Option<usize> {
        Some(self.context_window)
    }

    fn forward(&self, tokens: &Tensor) -> Result<Tensor> {
        let (batch, seq_len) = tokens.dims2()?;
        let ids = tokens.flatten_all()?.to_dtype(DType::U32)?;
        let logits = self
            .transitions
            .as_tensor()
            .index_select(&ids, 0)?
            .broadcast_add(self.bias.as_tensor())?;
        Ok(logits.reshape((batch, seq_len, self.vocab_size))?)
    }
}
