//! Block-device introspection.
//!
//! A [`BlockDevice`] is the immutable result of validating a device path
//! against the kernel's block registry and measuring its usable space. The
//! default layout leaves the customary 2048 sectors of headroom at the start
//! of the disk and protects the 33 sectors of the secondary GPT header and
//! table at the end.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, ensure, Context, Error};
use log::debug;
use serde::Serialize;

use diskutils::{
    lsblk,
    sfdisk::{DiskLayout, TableLabel},
    sysblock,
};
use recipe_api::{config::PartitionTableType, error::DeviceError};

use crate::planner::ChunkSpace;

/// First sector handed out on a freshly labelled disk.
pub const DEFAULT_BASE_OFFSET: u64 = 2048;

/// Sectors reserved at the end of the disk for the secondary GPT header and
/// partition table.
pub const DEFAULT_FOOTER: u64 = 33;

/// A validated, measured whole-disk device.
#[derive(Debug, Clone, Serialize)]
pub struct BlockDevice {
    /// The path the recipe named, e.g. `/dev/sdb`.
    pub path: PathBuf,

    /// Kernel name of the device.
    pub name: String,

    /// Device-tree path the block registry links to.
    pub sys_path: PathBuf,

    /// Hardware model, when the kernel knows one.
    pub model: Option<String>,

    /// Space available to the planner, in device sectors.
    pub addressable: ChunkSpace,

    /// Physical sector size (reports only; geometry uses logical sectors).
    pub physical_sector_size: u64,

    /// Whole-device length in logical sectors.
    pub length: u64,

    /// First sector the planner may allocate.
    pub base_offset: u64,

    /// Sectors kept free at the end of the disk.
    pub footer: u64,

    /// Label already present on the device, if any.
    pub table_type: Option<PartitionTableType>,

    /// Whether existing partitions are preserved.
    pub keep_partitions: bool,
}

impl BlockDevice {
    /// Validates `path` and measures the device behind it.
    ///
    /// The path must live under `/dev/`, exist (one level of symlink is
    /// followed), be registered in the kernel's block registry, and be a
    /// whole disk rather than a partition. With `keep_partitions`, a device
    /// that already carries a label offers only its largest free region to
    /// the planner.
    pub fn introspect(path: impl AsRef<Path>, keep_partitions: bool) -> Result<Self, Error> {
        let requested = path.as_ref();
        let display = requested.to_string_lossy().to_string();

        if !display.starts_with("/dev/") {
            bail!(DeviceError::BadDevicePath { path: display });
        }

        let metadata = match fs::symlink_metadata(requested) {
            Ok(metadata) => metadata,
            Err(_) => bail!(DeviceError::DeviceNotFound { path: display }),
        };

        let resolved = if metadata.file_type().is_symlink() {
            let target = fs::read_link(requested)
                .with_context(|| format!("Failed to resolve symlink '{display}'"))?;
            if target.is_absolute() {
                target
            } else {
                requested
                    .parent()
                    .unwrap_or_else(|| Path::new("/"))
                    .join(target)
            }
        } else {
            requested.to_path_buf()
        };

        let name = resolved
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("Device path '{display}' has no usable name"))?
            .to_string();

        let registered = sysblock::device_names().context("Failed to list block devices")?;
        if !registered.contains(&name) {
            bail!(DeviceError::DeviceNotFound { path: display });
        }

        let sys_path = sysblock::registry_link(&name)?;
        let whole_disk = sysblock::whole_disk_from_link(&sys_path.to_string_lossy())
            .with_context(|| format!("Registry link for '{name}' is not a device-tree path"))?;
        if whole_disk != name {
            bail!(DeviceError::NotPartitionable { path: display });
        }

        let probe = lsblk::probe(&resolved)
            .with_context(|| format!("Failed to probe device '{display}'"))?;
        let sector_size = probe.logical_sector_size;
        ensure!(
            sector_size > 0,
            "Device '{display}' reports a zero sector size"
        );
        let length = probe.size_in_sectors();

        let layout = DiskLayout::try_read(&resolved)
            .with_context(|| format!("Failed to inspect the label of '{display}'"))?;

        debug!(
            "Device '{display}': {length} sectors of {sector_size} bytes, label {:?}",
            probe.table_label
        );

        let (base_offset, addressable) =
            resolve_space(length, sector_size, keep_partitions, layout.as_ref())?;

        Ok(BlockDevice {
            path: requested.to_path_buf(),
            name,
            sys_path,
            model: probe.model,
            addressable,
            physical_sector_size: probe.physical_sector_size,
            length,
            base_offset,
            footer: DEFAULT_FOOTER,
            table_type: probe.table_label.map(table_type_for),
            keep_partitions,
        })
    }
}

fn table_type_for(label: TableLabel) -> PartitionTableType {
    match label {
        TableLabel::Gpt => PartitionTableType::Gpt,
        TableLabel::Dos => PartitionTableType::Msdos,
    }
}

/// Picks the sector window the planner may fill: the largest free region
/// when keeping an existing label, the whole disk minus head and footer
/// otherwise.
fn resolve_space(
    length: u64,
    sector_size: u64,
    keep_partitions: bool,
    layout: Option<&DiskLayout>,
) -> Result<(u64, ChunkSpace), Error> {
    if keep_partitions {
        if let Some(layout) = layout {
            let region = layout
                .free_regions()
                .into_iter()
                .max_by_key(|region| region.length)
                .context("No free region left on the device")?;
            return Ok((region.start, ChunkSpace::new(region.length, sector_size)));
        }
    }

    let usable = length
        .checked_sub(DEFAULT_BASE_OFFSET + DEFAULT_FOOTER)
        .filter(|usable| *usable > 0)
        .context("Device is too small to partition")?;

    Ok((DEFAULT_BASE_OFFSET, ChunkSpace::new(usable, sector_size)))
}
