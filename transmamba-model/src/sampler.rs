use anyhow::Result;
use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::tensor::softmax;

/// Stores a probability and its associated token id.
#[derive(Clone, Debug)]
struct ProbIndex {
    prob: f32,
    index: usize,
}

/// Greedy / temperature / nucleus sampler over next-token logits.
#[derive(Debug)]
pub struct Sampler {
    probindex: Vec<ProbIndex>,
    temperature: f32,
    top_p: f32,
    rng: StdRng,
}

impl Sampler {
    /// * `temperature` - 0 selects greedy decoding
    /// * `top_p` - nucleus mass in `(0, 1]`, 1 disables truncation
    pub fn new(vocab_size: usize, temperature: f32, top_p: f32, seed: u64) -> Result<Self> {
        if vocab_size == 0 {
            anyhow::bail!("Vocab size must be positive");
        }
        if temperature < 0.0 {
            anyhow::bail!("Temperature must be non-negative, got {temperature}");
        }
        if !(top_p > 0.0 && top_p <= 1.0) {
            anyhow::bail!("Top-p must be in (0, 1], got {top_p}");
        }

        Ok(Self {
            probindex: Vec::with_capacity(vocab_size),
            temperature,
            top_p,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn greedy(vocab_size: usize) -> Result<Self> {
        Self::new(vocab_size, 0.0, 1.0, 0)
    }

    pub fn is_greedy(&self) -> bool {
        self.temperature == 0.0
    }

    fn sample_argmax(logits: &[f32]) -> usize {
        logits
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
            .map(|(i, _)| i)
            .unwrap_or_default()
    }

    fn sample_mult(probs: &[f32], coin: f32) -> usize {
        let mut cdf = 0.0;
        for (i, &prob) in probs.iter().enumerate() {
            cdf += prob;
            if coin < cdf {
                return i;
            }
        }
        probs.len().saturating_sub(1)
    }

    /// Samples from the smallest set of tokens whose cumulative probability exceeds `top_p`.
    fn sample_top_p(&mut self, probs: &[f32], coin: f32) -> usize {
        // tokens below this cannot be part of the nucleus
        let cutoff = (1.0 - self.top_p) / probs.len().saturating_sub(1).max(1) as f32;

        self.probindex.clear();
        self.probindex.extend(
            probs.iter().enumerate().filter(|&(_, &prob)| prob >= cutoff).map(|(index, &prob)| ProbIndex { prob, index }),
        );
        self.probindex.sort_unstable_by(|a, b| b.prob.total_cmp(&a.prob));

        let mut cumulative = 0.0;
        let mut last = self.probindex.len().saturating_sub(1);
        for (i, candidate) in self.probindex.iter().enumerate() {
            cumulative += candidate.prob;
            if cumulative > self.top_p {
                last = i;
                break;
            }
        }

        let r = coin * cumulative;
        let mut cdf = 0.0;
        for candidate in &self.probindex[..=last] {
            cdf += candidate.prob;
            if r < cdf {
                return candidate.index;
            }
        }
        self.probindex.get(last).map_or(0, |c| c.index)
    }

    /// Picks the next token id from one row of logits.
    pub fn sample(&mut self, logits: &[f32]) -> u32 {
        let index = if self.is_greedy() {
            Self::sample_argmax(logits)
        } else {
            let mut probs = logits.iter().map(|&l| l / self.temperature).collect::<Vec<_>>();
            softmax(&mut probs);

            let coin = self.rng.gen_range(0.0f32..1.0);
            if self.top_p >= 1.0 { Self::sample_mult(&probs, coin) } else { self.sample_top_p(&probs, coin) }
        };
        index as u32
    }
}
