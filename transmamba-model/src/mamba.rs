#[cfg(test)]
#[path = "../tests/unit/mamba_test.rs"]
mod mamba_test;

use anyhow::Result;
use rayon::prelude::*;

use crate::configuration::ModelConfig;
use crate::layers::{Linear, RMSNorm};
use crate::params::ParameterTree;
use crate::ssm::{ScanMode, SelectiveScan, SsmState};
use crate::tensor::silu;

/// Depthwise convolution over time with left zero padding.
///
/// Weights are `[channels, kernel]`; tap `kernel - 1` multiplies the current
/// step and tap `0` the oldest one, matching a `Conv1d(groups=channels)`
/// checkpoint layout.
pub struct CausalConv1d {
    pub weight: Vec<f32>,
    pub bias: Vec<f32>,
    pub channels: usize,
    pub kernel: usize,
}

impl CausalConv1d {
    pub fn from_params(params: &ParameterTree, prefix: &str, channels: usize, kernel: usize) -> Result<Self> {
        Ok(Self {
            weight: params.get_shaped(&format!("{prefix}.kernel"), &[channels, kernel])?.as_slice().to_vec(),
            bias: params.get_shaped(&format!("{prefix}.bias"), &[channels])?.as_slice().to_vec(),
            channels,
            kernel,
        })
    }

    /// Convolves `x` laid out `[batch, seq_len, channels]`.
    pub fn forward(&self, x: &[f32], batch: usize, seq_len: usize) -> Vec<f32> {
        let channels = self.channels;
        let mut output = vec![0.0; batch * seq_len * channels];

        output.par_chunks_mut(channels).enumerate().for_each(|(row, out)| {
            let (b, t) = (row / seq_len, row % seq_len);
            for (c, o) in out.iter_mut().enumerate() {
                let taps = &self.weight[c * self.kernel..(c + 1) * self.kernel];
                *o = self.bias[c]
                    + taps
                        .iter()
                        .enumerate()
                        .filter_map(|(k, &w)| {
                            // tap k looks back kernel-1-k steps
                            let back = self.kernel - 1 - k;
                            (t >= back).then(|| w * x[(b * seq_len + t - back) * channels + c])
                        })
                        .sum::<f32>();
            }
        });

        output
    }
}

/// Mamba stage
///
/// ```text
/// x  = x ⊙ mask
/// n  = RMSNorm(x)
/// u  = silu(conv(inp_proj(n) ⊙ mask)) ⊙ mask
/// y  = S6(u) ⊙ silu(d_proj(n))
/// out = out_proj(y)
/// ```
///
/// The output replaces the hidden state (no residual add around the stage).
pub struct MambaBlock {
    pub norm: RMSNorm,
    pub inp_proj: Linear,
    pub conv: CausalConv1d,
    pub s6: SelectiveScan,
    pub d_proj: Linear,
    pub out_proj: Linear,
    pub hidden_size: usize,
}

impl MambaBlock {
    pub fn from_params(params: &ParameterTree, prefix: &str, config: &ModelConfig, mode: ScanMode) -> Result<Self> {
        let (h, c) = (config.hidden_size, config.ssm_inner_size());
        Ok(Self {
            norm: RMSNorm::from_params(params, &format!("{prefix}.norm.kernel"), h, config.rms_norm_eps)?,
            inp_proj: Linear::from_params(params, &format!("{prefix}.inp_proj"), h, c, true)?,
            conv: CausalConv1d::from_params(params, &format!("{prefix}.conv"), c, config.ssm_conv_kernel)?,
            s6: SelectiveScan::from_params(params, &format!("{prefix}.s6"), c, config.ssm_state_size, mode)?,
            d_proj: Linear::from_params(params, &format!("{prefix}.d_proj"), h, c, true)?,
            out_proj: Linear::from_params(params, &format!("{prefix}.out_proj"), c, h, true)?,
            hidden_size: h,
        })
    }

    /// Runs the stage from a zero recurrent state.
    pub fn forward(&self, x: &[f32], attention_mask: Option<&[u8]>, batch: usize, seq_len: usize) -> Result<Vec<f32>> {
        self.forward_with_state(x, attention_mask, batch, seq_len, None).map(|(output, _)| output)
    }

    /// Runs the stage from an explicit recurrent state and returns the new one.
    pub fn forward_with_state(
        &self,
        x: &[f32],
        attention_mask: Option<&[u8]>,
        batch: usize,
        seq_len: usize,
        state: Option<&SsmState>,
    ) -> Result<(Vec<f32>, SsmState)> {
        let h = self.hidden_size;
        if x.len() != batch * seq_len * h {
            anyhow::bail!("Mamba stage expects [{batch}, {seq_len}, {h}] input, got {} values", x.len());
        }

        let channels = self.conv.channels;
        let mut input = x.to_vec();
        zero_masked_rows(&mut input, attention_mask, h);

        let normed = self.norm.forward_rows(&input);

        let mut projected = self.inp_proj.forward(&normed);
        zero_masked_rows(&mut projected, attention_mask, channels);

        let mut branch = self.conv.forward(&projected, batch, seq_len);
        branch.par_iter_mut().for_each(|v| *v = silu(*v));
        // padded steps feed nothing into the recurrence
        zero_masked_rows(&mut branch, attention_mask, channels);

        let (mut mixed, state) = self.s6.forward(&branch, batch, seq_len, state)?;

        let gate = self.d_proj.forward(&normed);
        mixed.par_iter_mut().zip(gate.par_iter()).for_each(|(y, &g)| *y *= silu(g));

        Ok((self.out_proj.forward(&mixed), state))
    }
}

fn zero_masked_rows(values: &mut [f32], mask: Option<&[u8]>, width: usize) {
    if let Some(mask) = mask {
        values.chunks_mut(width).zip(mask).filter(|(_, m)| **m == 0).for_each(|(row, _)| row.fill(0.0));
    }
}

impl std::fmt::Debug for MambaBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MambaBlock")
            .field("hidden_size", &self.hidden_size)
            .field("inp_proj", &self.inp_proj)
            .field("conv_kernel", &self.conv.kernel)
            .field("s6", &self.s6)
            .field("out_proj", &self.out_proj)
            .finish()
    }
}
