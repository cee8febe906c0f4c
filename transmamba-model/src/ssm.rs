//! Selective state-space recurrence (S6).
//!
//! Per (batch, channel) lane and state index the recurrence is
//! `h[t] = exp(Δ[t]·A) · h[t-1] + Δ[t]·B[t] · x[t]`, read out as `y[t] = Σ C[t]·h[t]`.

#[cfg(test)]
#[path = "../tests/unit/ssm_test.rs"]
mod ssm_test;

use anyhow::Result;
use rayon::prelude::*;

use crate::layers::Linear;
use crate::params::ParameterTree;
use crate::tensor::softplus;

/// How the linear recurrence is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanMode {
    /// One step per timestep.
    #[default]
    Sequential,
    /// Parallel-prefix composition of `(a, b)` pairs.
    Associative,
}

/// Runs `h[t] = a[t] * h[t-1] + b[t]` from `h[-1] = init`, returning every `h[t]`.
pub fn sequential_scan(a: &[f32], b: &[f32], init: f32) -> Vec<f32> {
    debug_assert_eq!(a.len(), b.len());

    let mut h = init;
    a.iter()
        .zip(b)
        .map(|(&a, &b)| {
            h = a * h + b;
            h
        })
        .collect()
}

/// Same recurrence as [`sequential_scan`] via the associative operator
/// `(a1, b1) ⊕ (a2, b2) = (a1·a2, a2·b1 + b2)` (Hillis-Steele doubling).
pub fn associative_scan(a: &[f32], b: &[f32], init: f32) -> Vec<f32> {
    debug_assert_eq!(a.len(), b.len());

    let n = a.len();
    let mut prefix = a.iter().copied().zip(b.iter().copied()).collect::<Vec<_>>();

    let mut offset = 1;
    while offset < n {
        let previous = prefix.clone();
        prefix[offset..].iter_mut().zip(&previous).for_each(|(current, &(a1, b1))| {
            let (a2, b2) = *current;
            *current = (a1 * a2, a2 * b1 + b2);
        });
        offset *= 2;
    }

    prefix.into_iter().map(|(a, b)| a * init + b).collect()
}

/// Final recurrent state, `[batch, channels, state_size]`.
#[derive(Debug, Clone, PartialEq)]
pub struct SsmState {
    batch: usize,
    channels: usize,
    state_size: usize,
    h: Vec<f32>,
}

impl SsmState {
    pub fn zeros(batch: usize, channels: usize, state_size: usize) -> Self {
        Self { batch, channels, state_size, h: vec![0.0; batch * channels * state_size] }
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.h
    }
}

/// Parameters of the selective scan: input-dependent `Δ`, `B`, `C` projections and the log decay rates.
pub struct SelectiveScan {
    pub fc_delta: Linear,
    pub fc_b: Linear,
    pub fc_c: Linear,
    /// [channels, state_size]
    pub a_log: Vec<f32>,
    pub channels: usize,
    pub state_size: usize,
    pub mode: ScanMode,
}

impl SelectiveScan {
    pub fn from_params(
        params: &ParameterTree,
        prefix: &str,
        channels: usize,
        state_size: usize,
        mode: ScanMode,
    ) -> Result<Self> {
        Ok(Self {
            fc_delta: Linear::from_params(params, &format!("{prefix}.fc_delta"), channels, channels, true)?,
            fc_b: Linear::from_params(params, &format!("{prefix}.fc_b"), channels, state_size, true)?,
            fc_c: Linear::from_params(params, &format!("{prefix}.fc_c"), channels, state_size, true)?,
            a_log: params.get_shaped(&format!("{prefix}.a_log"), &[channels, state_size])?.as_slice().to_vec(),
            channels,
            state_size,
            mode,
        })
    }

    /// Applies the recurrence to `x` (`[batch, seq_len, channels]`).
    ///
    /// Starts from `state` when given (it must match the batch size) and
    /// from zeros otherwise. Returns `y` with the shape of `x` plus the final state.
    pub fn forward(
        &self,
        x: &[f32],
        batch: usize,
        seq_len: usize,
        state: Option<&SsmState>,
    ) -> Result<(Vec<f32>, SsmState)> {
        let (channels, state_size) = (self.channels, self.state_size);

        if seq_len == 0 {
            anyhow::bail!("Selective scan needs a non-empty sequence");
        }
        if x.len() != batch * seq_len * channels {
            anyhow::bail!("Expected [{batch}, {seq_len}, {channels}] input, got {} values", x.len());
        }
        if let Some(state) = state {
            if state.batch != batch || state.channels != channels || state.state_size != state_size {
                anyhow::bail!(
                    "Recurrent state is [{}, {}, {}] but the input needs [{batch}, {channels}, {state_size}]",
                    state.batch,
                    state.channels,
                    state.state_size
                );
            }
        }

        let mut delta = self.fc_delta.forward(x);
        // softplus underflows to zero for very negative inputs
        delta.iter_mut().for_each(|d| *d = softplus(*d).max(f32::MIN_POSITIVE));
        let b_proj = self.fc_b.forward(x);
        let c_proj = self.fc_c.forward(x);
        let decay = self.a_log.iter().map(|&a| -a.exp()).collect::<Vec<_>>();

        // one lane per (batch, channel)
        let lanes = (0..batch * channels)
            .into_par_iter()
            .map(|lane| {
                let (b, c) = (lane / channels, lane % channels);
                let at = |t: usize| (b * seq_len + t) * channels + c;

                let mut y = vec![0.0f32; seq_len];
                let mut last = vec![0.0f32; state_size];
                let mut da = vec![0.0f32; seq_len];
                let mut db = vec![0.0f32; seq_len];

                for n in 0..state_size {
                    for t in 0..seq_len {
                        let dt = delta[at(t)];
                        da[t] = (dt * decay[c * state_size + n]).exp();
                        db[t] = dt * b_proj[(b * seq_len + t) * state_size + n] * x[at(t)];
                    }

                    let init = state.map_or(0.0, |s| s.h[lane * state_size + n]);
                    let h = match self.mode {
                        ScanMode::Sequential => sequential_scan(&da, &db, init),
                        ScanMode::Associative => associative_scan(&da, &db, init),
                    };

                    for (t, &h_t) in h.iter().enumerate() {
                        y[t] += c_proj[(b * seq_len + t) * state_size + n] * h_t;
                    }
                    last[n] = h[seq_len - 1];
                }

                (y, last)
            })
            .collect::<Vec<_>>();

        let mut output = vec![0.0; batch * seq_len * channels];
        let mut final_state = SsmState::zeros(batch, channels, state_size);
        for (lane, (y, last)) in lanes.into_iter().enumerate() {
            let (b, c) = (lane / channels, lane % channels);
            for (t, y_t) in y.into_iter().enumerate() {
                output[(b * seq_len + t) * channels + c] = y_t;
            }
            final_state.h[lane * state_size..(lane + 1) * state_size].copy_from_slice(&last);
        }

        Ok((output, final_state))
    }
}

impl std::fmt::Debug for SelectiveScan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectiveScan")
            .field("channels", &self.channels)
            .field("state_size", &self.state_size)
            .field("mode", &self.mode)
            .finish()
    }
}
