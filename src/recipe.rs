//! Recipe compilation: projecting a set of heterogeneous devices onto one
//! common space so a single chunk plan replicates across all of them.

use anyhow::{bail, ensure, Context, Error};
use log::{debug, info};

use recipe_api::{
    config::{PartitionRequest, PartitionTableType, RecipeConfig},
    error::{AllocError, DeviceError},
};

use crate::{
    device::BlockDevice,
    planner::{self, Chunk, ChunkBounds, ChunkSpace},
};

/// A compiled recipe: introspected devices plus the common geometry every
/// partition plan is computed against.
#[derive(Debug, Clone)]
pub struct Recipe {
    pub devices: Vec<BlockDevice>,
    pub requests: Vec<PartitionRequest>,
    pub table: PartitionTableType,
    pub keep_partitions: bool,

    /// Largest sector size across the devices; all geometry is aligned to
    /// it so partitions carry identical byte sizes everywhere.
    pub common_block_size: u64,

    /// Smallest addressable span across the devices, rounded down to the
    /// common block size, in bytes.
    pub common_space: u64,
}

impl Recipe {
    /// Introspects every device named by `config` and computes the common
    /// geometry.
    pub fn compile(config: &RecipeConfig) -> Result<Self, Error> {
        ensure!(
            !config.devices.is_empty(),
            "A recipe needs at least one device"
        );

        let devices = config
            .devices
            .iter()
            .map(|path| {
                BlockDevice::introspect(path, config.keep_partitions)
                    .with_context(|| format!("Failed to introspect '{}'", path.display()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Self::from_parts(
            devices,
            config.partitions.clone(),
            config.table,
            config.keep_partitions,
        )
    }

    pub(crate) fn from_parts(
        devices: Vec<BlockDevice>,
        requests: Vec<PartitionRequest>,
        table: PartitionTableType,
        keep_partitions: bool,
    ) -> Result<Self, Error> {
        ensure!(!devices.is_empty(), "A recipe needs at least one device");
        ensure!(
            !requests.is_empty(),
            "A recipe needs at least one partition request"
        );

        let common_block_size = devices
            .iter()
            .map(|device| device.addressable.block_size)
            .max()
            .unwrap();
        let smallest = devices
            .iter()
            .map(|device| device.addressable.bytes())
            .min()
            .unwrap();
        let common_space = smallest / common_block_size * common_block_size;

        if keep_partitions {
            let labels: std::collections::HashSet<_> =
                devices.iter().map(|device| device.table_type).collect();
            if labels.len() > 1 {
                let details = devices
                    .iter()
                    .map(|device| {
                        format!(
                            "{}: {}",
                            device.path.display(),
                            device
                                .table_type
                                .map(|label| label.to_string())
                                .unwrap_or_else(|| "unlabelled".to_string())
                        )
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                bail!(DeviceError::HeterogeneousTables { details });
            }
        }

        info!(
            "Compiled recipe over {} device(s): common space {common_space} bytes in {common_block_size}-byte blocks",
            devices.len()
        );

        Ok(Recipe {
            devices,
            requests,
            table,
            keep_partitions,
            common_block_size,
            common_space,
        })
    }

    /// The canvas the planner allocates against.
    pub fn chunk_space(&self) -> ChunkSpace {
        ChunkSpace::new(self.common_space / self.common_block_size, self.common_block_size)
    }

    fn bounds(&self) -> Vec<ChunkBounds> {
        self.requests
            .iter()
            .map(|request| {
                ChunkBounds::new(
                    request.min_size.bytes(),
                    request.max_size.bytes(),
                    request.weight,
                )
            })
            .collect()
    }

    /// Runs the chunk planner over the common space. The resulting chunks
    /// are positionally matched with `requests`.
    pub fn plan_chunks(&self) -> Result<Vec<Chunk>, AllocError> {
        let space = self.chunk_space();
        debug!(
            "Planning {} chunk(s) over {} blocks of {} bytes",
            self.requests.len(),
            space.blocks,
            space.block_size
        );
        planner::allocate(space, &self.bounds())
    }
}
