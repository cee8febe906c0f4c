#[cfg(test)]
#[path = "../tests/unit/layers_test.rs"]
mod layers_test;

use anyhow::Result;
use rayon::prelude::*;

use crate::dropout::{DropoutStream, apply_dropout};
use crate::params::ParameterTree;
use crate::tensor::{matmul, silu};

/// Token embedding layer - converts token IDs to dense vectors
///
/// **Shape**: [vocab_size, embedding_dim]
/// **Note**: Shared with the output projection when word embeddings are tied
pub struct TokenEmbedding {
    pub embedding_table: Vec<f32>,
    pub dim: usize,
}

impl TokenEmbedding {
    pub fn new(embedding_table: Vec<f32>, dim: usize) -> Self {
        Self { embedding_table, dim }
    }

    pub fn vocab_size(&self) -> usize {
        self.embedding_table.len() / self.dim
    }

    /// Looks up every token, producing `[tokens.len(), dim]`.
    pub fn forward(&self, tokens: &[u32]) -> Result<Vec<f32>> {
        let vocab_size = self.vocab_size();
        let mut output = vec![0.0; tokens.len() * self.dim];

        for (row, &token) in output.chunks_mut(self.dim).zip(tokens) {
            let token = token as usize;
            if token >= vocab_size {
                anyhow::bail!("Token id {token} is outside the vocabulary of {vocab_size}");
            }
            row.copy_from_slice(&self.embedding_table[token * self.dim..(token + 1) * self.dim]);
        }

        Ok(output)
    }
}

impl std::fmt::Debug for TokenEmbedding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenEmbedding").field("dim", &self.dim).field("vocab_size", &self.vocab_size()).finish()
    }
}

/// RMS Layer Normalization
///
/// **Mathematical Formula**:
/// ```text
/// RMSNorm(x) = x / RMS(x) * γ
/// where RMS(x) = sqrt(mean(x²) + ε)
/// ```
///
/// The mean of squares is accumulated in f64 so that large activations do not lose precision.
pub struct RMSNorm {
    pub weight: Vec<f32>,
    pub eps: f32,
}

impl RMSNorm {
    pub fn new(weight: Vec<f32>, eps: f32) -> Self {
        Self { weight, eps }
    }

    pub fn from_params(params: &ParameterTree, name: &str, dim: usize, eps: f32) -> Result<Self> {
        let weight = params.get_shaped(name, &[dim])?.as_slice().to_vec();
        Ok(Self::new(weight, eps))
    }

    pub fn dim(&self) -> usize {
        self.weight.len()
    }

    pub fn forward(&self, output: &mut [f32], input: &[f32]) {
        debug_assert_eq!(output.len(), input.len());
        debug_assert_eq!(input.len(), self.weight.len());

        let mean_square = input.iter().map(|&x| (x as f64) * (x as f64)).sum::<f64>() / input.len() as f64;
        let factor = (mean_square + self.eps as f64).sqrt().recip();

        output.iter_mut().zip(input).zip(&self.weight).for_each(|((out, &inp), &w)| {
            *out = ((inp as f64) * factor) as f32 * w;
        });
    }

    /// Normalizes every row of a `[rows, dim]` buffer.
    pub fn forward_rows(&self, input: &[f32]) -> Vec<f32> {
        let mut output = vec![0.0; input.len()];
        output.par_chunks_mut(self.dim()).zip(input.par_chunks(self.dim())).for_each(|(out, inp)| {
            self.forward(out, inp);
        });
        output
    }
}

impl std::fmt::Debug for RMSNorm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RMSNorm").field("dim", &self.weight.len()).field("eps", &self.eps).finish()
    }
}

/// Dense layer `y = x W^T + b` with weights stored `[out_features, in_features]`.
pub struct Linear {
    pub weight: Vec<f32>,
    pub bias: Option<Vec<f32>>,
    pub in_features: usize,
    pub out_features: usize,
}

impl Linear {
    pub fn new(weight: Vec<f32>, bias: Option<Vec<f32>>, in_features: usize, out_features: usize) -> Self {
        Self { weight, bias, in_features, out_features }
    }

    /// Reads `<prefix>.kernel` and, when `with_bias` is set, `<prefix>.bias`.
    pub fn from_params(
        params: &ParameterTree,
        prefix: &str,
        in_features: usize,
        out_features: usize,
        with_bias: bool,
    ) -> Result<Self> {
        let weight = params.get_shaped(&format!("{prefix}.kernel"), &[out_features, in_features])?;
        let bias = match with_bias {
            true => Some(params.get_shaped(&format!("{prefix}.bias"), &[out_features])?.as_slice().to_vec()),
            false => None,
        };
        Ok(Self::new(weight.as_slice().to_vec(), bias, in_features, out_features))
    }

    /// Projects a `[rows, in_features]` buffer to `[rows, out_features]`.
    pub fn forward(&self, input: &[f32]) -> Vec<f32> {
        let rows = input.len() / self.in_features;
        let mut output = vec![0.0; rows * self.out_features];
        matmul(&mut output, input, &self.weight, self.bias.as_deref(), self.in_features, self.out_features);
        output
    }
}

impl std::fmt::Debug for Linear {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Linear")
            .field("in_features", &self.in_features)
            .field("out_features", &self.out_features)
            .field("bias", &self.bias.is_some())
            .finish()
    }
}

/// Feed-Forward Network with SwiGLU activation
///
/// **Formula**: `W2(silu(W1·x) ⊙ W3·x)`, followed by residual dropout.
///
/// With `chunk_len` set and sequences at least that long, each sequence is
/// processed in blocks of `chunk_len` positions, which bounds the size of the
/// `[positions, intermediate]` temporaries without changing the result.
pub struct FeedForward {
    pub w1: Linear, // Gate projection
    pub w2: Linear, // Down projection
    pub w3: Linear, // Up projection
    pub dropout: f32,
    pub chunk_len: Option<usize>,
}

impl FeedForward {
    pub fn new(w1: Linear, w2: Linear, w3: Linear, dropout: f32, chunk_len: Option<usize>) -> Self {
        Self { w1, w2, w3, dropout, chunk_len }
    }

    /// Whether sequences of `seq_len` positions take the blockwise path.
    pub fn is_blockwise(&self, seq_len: usize) -> bool {
        self.chunk_len.is_some_and(|chunk| seq_len >= chunk)
    }

    /// Applies the FFN to `input` laid out `[batch, seq_len, dim]`.
    pub fn forward(&self, input: &[f32], seq_len: usize, stream: Option<DropoutStream>) -> Vec<f32> {
        let dim = self.w1.in_features;

        let mut output = match self.chunk_len {
            Some(chunk) if self.is_blockwise(seq_len) => input
                .chunks(seq_len * dim)
                .flat_map(|sequence| sequence.chunks(chunk * dim))
                .flat_map(|block| self.forward_block(block))
                .collect(),
            _ => self.forward_block(input),
        };

        apply_dropout(&mut output, self.dropout, stream);
        output
    }

    fn forward_block(&self, input: &[f32]) -> Vec<f32> {
        let mut gate = self.w1.forward(input);
        let up = self.w3.forward(input);

        gate.par_iter_mut().zip(up.par_iter()).for_each(|(g, &u)| *g = silu(*g) * u);

        self.w2.forward(&gate)
    }
}

impl std::fmt::Debug for FeedForward {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedForward")
            .field("hidden_dim", &self.w1.out_features)
            .field("chunk_len", &self.chunk_len)
            .field("w1", &self.w1)
            .field("w2", &self.w2)
            .field("w3", &self.w3)
            .finish()
    }
}
