#[cfg(test)]
#[path = "../tests/unit/example_test.rs"]
mod example_test;

use anyhow::{Context, Result};

/// A padded training example.
#[derive(Debug, Clone, PartialEq)]
pub struct Example {
    /// `max_seq_len + 1` token ids, right padded with the pad id.
    pub tokens: Vec<u32>,
    /// `max_seq_len` loss weights aligned with the shifted targets.
    pub weights: Vec<f32>,
    pub dataset: String,
}

/// Decompresses a `seq` blob and parses its whitespace separated token ids.
pub fn decode_tokens(seq: &[u8]) -> Result<Vec<u32>> {
    let raw = zstd::decode_all(seq).context("Failed to decompress token sequence")?;
    if !raw.is_ascii() {
        anyhow::bail!("Decompressed token sequence is not ASCII");
    }
    let text = std::str::from_utf8(&raw)?;

    text.split_ascii_whitespace()
        .map(|id| id.parse::<u32>().with_context(|| format!("Invalid token id '{id}'")))
        .collect()
}

/// Compresses token ids into the `seq` column format.
pub fn encode_tokens(tokens: &[u32]) -> Result<Vec<u8>> {
    let text = tokens.iter().map(u32::to_string).collect::<Vec<_>>().join(" ");
    zstd::encode_all(text.as_bytes(), 0).context("Failed to compress token sequence")
}

/// Pads `tokens` and builds loss weights for the next-token targets.
///
/// Target `i` predicts `tokens[i + 1]`; its weight is 1 when
/// `i + 1 >= pred_start` and 0 otherwise, and 0 over padding.
/// `pred_start` is clamped to `[1, tokens.len()]`.
pub fn build_example(
    mut tokens: Vec<u32>,
    pred_start: i64,
    dataset: String,
    max_seq_len: usize,
    pad_id: u32,
) -> Result<Example> {
    let len = tokens.len();
    if len == 0 {
        anyhow::bail!("Example from '{dataset}' has no tokens");
    }
    if len > max_seq_len + 1 {
        anyhow::bail!("Example from '{dataset}' has {len} tokens, more than max_seq_len + 1 = {}", max_seq_len + 1);
    }

    let pred_start = pred_start.clamp(1, len as i64) as usize;

    let mut weights = vec![0.0; max_seq_len];
    weights[pred_start - 1..len - 1].fill(1.0);
    tokens.resize(max_seq_len + 1, pad_id);

    Ok(Example { tokens, weights, dataset })
}
