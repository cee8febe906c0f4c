use std::{fmt, ops::Range, sync::Arc};

use anyhow::Result;
use log::{debug, info};

use crate::configuration::{MeshShape, ModelConfig};

/// Key/value rows held by one processing unit during ring attention.
///
/// `keys`/`values` are `[batch, len, heads, head_dim]`, `key_mask` and
/// `segment_ids` are `[batch, len]`; `start` is the absolute key position of row 0.
#[derive(Debug, Clone)]
pub struct KvBlock {
    pub start: usize,
    pub len: usize,
    pub keys: Vec<f32>,
    pub values: Vec<f32>,
    pub key_mask: Vec<u8>,
    pub segment_ids: Option<Vec<i64>>,
}

/// Capability to split work along the sequence-parallel axis and to pass
/// key/value blocks between neighbouring units.
pub trait MeshExecution: Send + Sync + fmt::Debug {
    /// Number of units along the sequence-parallel axis.
    fn sequence_parallel_size(&self) -> usize;

    /// Splits `len` positions into one contiguous range per unit.
    fn partition(&self, len: usize) -> Vec<Range<usize>> {
        contiguous_partition(len, self.sequence_parallel_size())
    }

    /// Moves the block held by unit `i` to unit `i + 1` (mod size).
    fn ring_exchange(&self, blocks: &mut [KvBlock]);
}

/// Everything runs on one unit; exchange is a no-op.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleDevice;

impl MeshExecution for SingleDevice {
    fn sequence_parallel_size(&self) -> usize {
        1
    }

    fn ring_exchange(&self, _blocks: &mut [KvBlock]) {}
}

/// In-process ring of `size` units; units run on the rayon pool and the
/// exchange is a rotation of the block list.
#[derive(Debug, Clone, Copy)]
pub struct LocalRing {
    size: usize,
}

impl LocalRing {
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            anyhow::bail!("A ring needs at least one unit");
        }
        Ok(Self { size })
    }
}

impl MeshExecution for LocalRing {
    fn sequence_parallel_size(&self) -> usize {
        self.size
    }

    fn ring_exchange(&self, blocks: &mut [KvBlock]) {
        debug_assert_eq!(blocks.len(), self.size);
        blocks.rotate_right(1);
    }
}

/// Execution target resolved once at startup and threaded through the model.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub shape: MeshShape,
    pub mesh: Arc<dyn MeshExecution>,
}

impl ExecutionContext {
    pub fn single_device() -> Self {
        Self { shape: MeshShape::single(), mesh: Arc::new(SingleDevice) }
    }

    pub fn local_ring(sp: usize) -> Result<Self> {
        let shape = MeshShape { sp, ..MeshShape::single() };
        Ok(Self { shape, mesh: Arc::new(LocalRing::new(sp)?) })
    }

    /// Builds the context described by `config.mesh_dim`, with `-1` inferred from the rayon pool size.
    pub fn from_config(config: &ModelConfig) -> Result<Self> {
        let shape = config.mesh_shape(rayon::current_num_threads())?;

        if shape.dp * shape.fsdp * shape.tp > 1 {
            debug!("Only the sp axis is executed locally; dp={}, fsdp={}, tp={} are ignored", shape.dp, shape.fsdp, shape.tp);
        }

        let context = match shape.sp {
            1 => Self { shape, mesh: Arc::new(SingleDevice) },
            sp => Self { shape, mesh: Arc::new(LocalRing::new(sp)?) },
        };

        info!("Execution mesh: {:?}", context.shape);
        Ok(context)
    }

    pub fn sequence_parallel_size(&self) -> usize {
        self.mesh.sequence_parallel_size()
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::single_device()
    }
}

/// Splits `0..len` into `parts` near-equal contiguous ranges; earlier ranges take the remainder.
pub fn contiguous_partition(len: usize, parts: usize) -> Vec<Range<usize>> {
    let base = len / parts;
    let remainder = len % parts;

    let mut start = 0;
    (0..parts)
        .map(|unit| {
            let size = base + usize::from(unit < remainder);
            let range = start..start + size;
            start += size;
            range
        })
        .collect()
}
