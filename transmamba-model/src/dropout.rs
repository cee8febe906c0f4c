use rand::{Rng, SeedableRng, rngs::StdRng};

const GOLDEN_GAMMA: u64 = 0x9e37_79b9_7f4a_7c15;

/// Call-scoped random stream for dropout.
///
/// Every dropout site forks its own stream from the call seed, so results do
/// not depend on the order in which layers or chunks are evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DropoutStream {
    seed: u64,
}

impl DropoutStream {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Derives an independent stream for a named site (layer, branch, ...).
    pub fn fork(&self, site: u64) -> Self {
        Self { seed: mix(self.seed ^ mix(site.wrapping_add(GOLDEN_GAMMA))) }
    }

    pub fn rng(&self) -> StdRng {
        StdRng::seed_from_u64(self.seed)
    }

    /// Keep decision for a single element addressed by its coordinates.
    ///
    /// Counter based: the same coordinates always give the same answer, which
    /// lets chunked and unchunked attention drop identical weights.
    pub fn keep(&self, coords: [u64; 4], rate: f32) -> bool {
        let hash = coords.iter().fold(self.seed, |h, &c| mix(h ^ c.wrapping_add(GOLDEN_GAMMA)));
        let uniform = (hash >> 40) as f32 / (1u64 << 24) as f32;
        uniform >= rate
    }
}

/// SplitMix64 finalizer.
fn mix(mut z: u64) -> u64 {
    z = z.wrapping_add(GOLDEN_GAMMA);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Inverted dropout: zeroes elements with probability `rate` and rescales the rest.
///
/// A `None` stream or a zero rate leaves `x` untouched.
pub fn apply_dropout(x: &mut [f32], rate: f32, stream: Option<DropoutStream>) {
    let Some(stream) = stream else {
        return;
    };
    if rate <= 0.0 {
        return;
    }

    let scale = (1.0 - rate).recip();
    let mut rng = stream.rng();
    x.iter_mut().for_each(|v| {
        *v = if rng.gen_bool(rate as f64) { 0.0 } else { *v * scale };
    });
}
