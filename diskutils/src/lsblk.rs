use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Error};
use serde::{Deserialize, Serialize};

use crate::{
    exe::{self, RunAndCheck},
    sfdisk::TableLabel,
};

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
struct LsblkOutput {
    blockdevices: Vec<ProbedDevice>,
}

/// A block device as reported by `lsblk --json --bytes`. Only the columns
/// the engine consumes are mapped; see `man lsblk` for the full set.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct ProbedDevice {
    /// Device path (lsblk is always invoked with `--path`).
    pub name: PathBuf,

    /// Device model, e.g. "QEMU HARDDISK".
    pub model: Option<String>,

    /// Size of the device in bytes.
    pub size: u64,

    /// Logical sector size.
    #[serde(rename = "log-sec")]
    pub logical_sector_size: u64,

    /// Physical sector size.
    #[serde(rename = "phy-sec")]
    pub physical_sector_size: u64,

    /// Device type.
    #[serde(default, rename = "type")]
    pub device_type: ProbedDeviceType,

    /// Parent kernel device name.
    #[serde(rename = "pkname")]
    pub parent_kernel_name: Option<PathBuf>,

    /// Partition table type, if the device carries one.
    #[serde(rename = "pttype")]
    pub table_label: Option<TableLabel>,

    /// Child devices (e.g. the partitions of a disk).
    #[serde(default)]
    pub children: Vec<ProbedDevice>,
}

impl ProbedDevice {
    /// Total device size in logical sectors.
    pub fn size_in_sectors(&self) -> u64 {
        self.size / self.logical_sector_size
    }
}

/// Device types returned by lsblk; everything beyond disks, partitions and
/// loop devices is lumped together.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ProbedDeviceType {
    Disk,
    #[serde(alias = "part")]
    Partition,
    Loop,

    #[default]
    #[serde(other)]
    Other,
}

/// Retrieves the description of the single block device at `device_path`.
pub fn probe(device_path: impl AsRef<Path>) -> Result<ProbedDevice, Error> {
    let output = exe::privileged("lsblk")
        .arg("--json")
        .arg("--bytes")
        .arg("--output-all")
        .arg("--path")
        .arg(device_path.as_ref())
        .output_and_check()
        .context("Failed to execute lsblk")?;

    let mut devices = parse_lsblk_output(&output).with_context(|| {
        format!(
            "Failed to parse lsblk output for '{}'",
            device_path.as_ref().display()
        )
    })?;

    if devices.len() != 1 {
        bail!(
            "Expected one block device at '{}', lsblk reported {}",
            device_path.as_ref().display(),
            devices.len()
        );
    }

    Ok(devices.remove(0))
}

fn parse_lsblk_output(output: &str) -> Result<Vec<ProbedDevice>, Error> {
    let parsed: LsblkOutput =
        serde_json::from_str(output).context("Failed to parse lsblk output")?;
    Ok(parsed.blockdevices)
}
