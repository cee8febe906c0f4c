use anyhow::Result;

/// Rotary Position Embedding (RoPE) table
///
/// **Layout**: `[max_positions, head_dim / 2]` pairs of `(cos, sin)`.
/// Frequency `i` rotates at `theta^(-2i / head_dim)` radians per position.
///
/// Rotation acts on *adjacent* coordinate pairs `(x[2i], x[2i+1])`, as in the
/// complex-multiplication formulation, not on the two halves of the vector.
pub struct RotaryTable {
    head_dim: usize,
    max_positions: usize,
    table: Vec<(f32, f32)>,
}

impl RotaryTable {
    pub fn new(head_dim: usize, max_positions: usize, theta: f32) -> Self {
        let half = head_dim / 2;
        let freqs = (0..half)
            .map(|i| (theta as f64).powf(-(2.0 * i as f64) / head_dim as f64))
            .collect::<Vec<_>>();

        let table = (0..max_positions)
            .flat_map(|pos| {
                freqs.iter().map(move |&freq| {
                    let angle = pos as f64 * freq;
                    (angle.cos() as f32, angle.sin() as f32)
                })
            })
            .collect();

        Self { head_dim, max_positions, table }
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    pub fn max_positions(&self) -> usize {
        self.max_positions
    }

    /// Rotates one head vector in place by the angles of `position`.
    pub fn rotate(&self, head: &mut [f32], position: usize) -> Result<()> {
        if position >= self.max_positions {
            anyhow::bail!("Position {position} exceeds the rotary table of {} positions", self.max_positions);
        }
        debug_assert_eq!(head.len(), self.head_dim);

        let half = self.head_dim / 2;
        let freqs = &self.table[position * half..(position + 1) * half];

        head.chunks_exact_mut(2).zip(freqs).for_each(|(pair, &(cos, sin))| {
            let (x, y) = (pair[0], pair[1]);
            pair[0] = x * cos - y * sin;
            pair[1] = x * sin + y * cos;
        });

        Ok(())
    }

    /// Rotates queries and keys laid out `[batch, seq, heads, head_dim]`.
    ///
    /// `position_ids` is `[batch, seq]`.
    pub fn apply(&self, query: &mut [f32], key: &mut [f32], position_ids: &[usize]) -> Result<()> {
        let row = query.len() / position_ids.len();
        debug_assert_eq!(query.len(), key.len());

        for ((q_row, k_row), &position) in query.chunks_mut(row).zip(key.chunks_mut(row)).zip(position_ids) {
            for (q_head, k_head) in q_row.chunks_mut(self.head_dim).zip(k_row.chunks_mut(self.head_dim)) {
                self.rotate(q_head, position)?;
                self.rotate(k_head, position)?;
            }
        }

        Ok(())
    }
}

impl std::fmt::Debug for RotaryTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RotaryTable")
            .field("head_dim", &self.head_dim)
            .field("max_positions", &self.max_positions)
            .finish()
    }
}
