use std::{
    fmt,
    path::{Path, PathBuf},
};

use anyhow::{Context, Error};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::exe::{self, OutputChecker, RunAndCheck};

/// Stderr marker sfdisk prints when asked to dump a device without a label.
const NO_TABLE_MARKER: &str = "does not contain a recognized partition table";

#[derive(Debug, PartialEq, Deserialize)]
struct SfdiskReport {
    partitiontable: DiskLayout,
}

/// A partition table as dumped by `sfdisk --json`.
#[derive(Debug, PartialEq, Clone, Deserialize)]
pub struct DiskLayout {
    /// Disk label type.
    pub label: TableLabel,

    /// Disk identifier: a UUID for gpt labels, a 32-bit hex id for dos.
    pub id: Option<String>,

    /// Device path.
    pub device: PathBuf,

    /// Size unit (always sectors).
    pub unit: TableUnit,

    /// First usable LBA.
    #[serde(rename = "firstlba")]
    pub first_lba: u64,

    /// Last usable LBA.
    #[serde(rename = "lastlba")]
    pub last_lba: u64,

    /// Sector size.
    #[serde(rename = "sectorsize", default = "DiskLayout::default_sector_size")]
    pub sector_size: u64,

    /// Table entries.
    #[serde(default)]
    pub partitions: Vec<TableEntry>,
}

/// One partition entry of a dumped table.
#[derive(Debug, PartialEq, Clone, Deserialize)]
pub struct TableEntry {
    /// Partition device path.
    pub node: PathBuf,

    /// Start offset in sectors.
    pub start: u64,

    /// Size in sectors.
    #[serde(rename = "size")]
    pub size_sectors: u64,

    /// Partition type: a GUID on gpt labels, a hex id on dos.
    #[serde(rename = "type")]
    pub type_id: String,

    /// Partition UUID (gpt only).
    #[serde(rename = "uuid")]
    pub id: Option<Uuid>,

    /// Partition name (gpt only).
    #[serde(default)]
    pub name: Option<String>,

    /// Attribute string, e.g. `LegacyBIOSBootable`.
    #[serde(default)]
    pub attrs: Option<String>,

    /// Boot flag (dos only).
    #[serde(default)]
    pub bootable: bool,
}

impl TableEntry {
    pub fn end(&self) -> u64 {
        self.start + self.size_sectors - 1
    }

    /// Partition number taken from the trailing digits of the node name.
    pub fn number(&self) -> Option<u64> {
        let name = self.node.file_name()?.to_str()?;
        let digits: String = name
            .chars()
            .rev()
            .take_while(|c| c.is_ascii_digit())
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        digits.parse().ok()
    }
}

/// Partition table labels, as both sfdisk and lsblk spell them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TableLabel {
    #[serde(rename = "gpt")]
    Gpt,
    #[serde(rename = "dos", alias = "msdos", alias = "mbr")]
    Dos,
}

impl fmt::Display for TableLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableLabel::Gpt => f.write_str("gpt"),
            TableLabel::Dos => f.write_str("dos"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum TableUnit {
    #[serde(rename = "sectors")]
    Sectors,
}

/// A contiguous run of unallocated sectors inside the usable LBA window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeRegion {
    pub start: u64,
    pub length: u64,
}

impl DiskLayout {
    fn default_sector_size() -> u64 {
        512
    }

    /// Reads the partition table of `device`. Fails when the device carries
    /// no recognizable label; see [`DiskLayout::try_read`] for the tolerant
    /// variant.
    pub fn read(device: impl AsRef<Path>) -> Result<Self, Error> {
        Self::try_read(device.as_ref())?.with_context(|| {
            format!(
                "Device '{}' does not carry a partition table",
                device.as_ref().display()
            )
        })
    }

    /// Reads the partition table of `device`, mapping an absent label to
    /// `None`.
    pub fn try_read(device: impl AsRef<Path>) -> Result<Option<Self>, Error> {
        let output = exe::privileged("sfdisk")
            .arg("--json")
            .arg(device.as_ref())
            .capture()
            .context("Failed to execute sfdisk")?;

        if !output.is_success() {
            if output.error_output().contains(NO_TABLE_MARKER) {
                return Ok(None);
            }
            output.check().with_context(|| {
                format!(
                    "Failed to dump partition table of '{}'",
                    device.as_ref().display()
                )
            })?;
        }

        Self::parse(&output.output())
            .with_context(|| {
                format!(
                    "Failed to extract partition table of '{}'",
                    device.as_ref().display()
                )
            })
            .map(Some)
    }

    fn parse(output: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str::<SfdiskReport>(output)
            .context("Failed to parse sfdisk output")?
            .partitiontable)
    }

    /// Maximal unallocated runs between `first_lba` and `last_lba`, in
    /// ascending start order.
    pub fn free_regions(&self) -> Vec<FreeRegion> {
        let mut extents: Vec<(u64, u64)> = self
            .partitions
            .iter()
            .map(|entry| (entry.start, entry.end()))
            .collect();
        extents.sort_unstable();

        let mut regions = Vec::new();
        let mut cursor = self.first_lba;
        for (start, end) in extents {
            if start > cursor {
                regions.push(FreeRegion {
                    start: cursor,
                    length: start - cursor,
                });
            }
            cursor = cursor.max(end + 1);
        }
        if cursor <= self.last_lba {
            regions.push(FreeRegion {
                start: cursor,
                length: self.last_lba - cursor + 1,
            });
        }
        regions
    }

    /// Highest partition number present in the table.
    pub fn max_partition_number(&self) -> u64 {
        self.partitions
            .iter()
            .filter_map(TableEntry::number)
            .max()
            .unwrap_or(0)
    }
}

/// One line of an sfdisk input script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptEntry {
    /// Start offset in sectors.
    pub start: u64,

    /// Size in sectors.
    pub size: u64,

    /// Partition type (GUID on gpt, hex id on dos); sfdisk default if None.
    pub type_id: Option<String>,

    /// GPT attribute names.
    pub attrs: Vec<String>,

    /// dos boot flag.
    pub bootable: bool,
}

/// An sfdisk input script: a label header plus one line per partition.
/// `append` leaves an existing table in place and only adds entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableScript {
    label: TableLabel,
    append: bool,
    entries: Vec<ScriptEntry>,
}

impl TableScript {
    pub fn new(label: TableLabel, append: bool) -> Self {
        Self {
            label,
            append,
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, entry: ScriptEntry) {
        self.entries.push(entry);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Renders the script in the format `sfdisk` reads from stdin.
    pub fn render(&self) -> String {
        let mut script = String::new();
        if !self.append {
            script += &format!("label: {}\n\n", self.label);
        }

        for entry in &self.entries {
            script += &format!("start={}, size={}", entry.start, entry.size);
            if let Some(type_id) = &entry.type_id {
                script += &format!(", type={type_id}");
            }
            if !entry.attrs.is_empty() {
                script += &format!(", attrs=\"{}\"", entry.attrs.join(" "));
            }
            if entry.bootable {
                script += ", bootable";
            }
            script += "\n";
        }
        script
    }

    /// Feeds the script to `sfdisk` against `device`. The kernel is not told
    /// about the new table; that is a separate, later step.
    pub fn apply(&self, device: impl AsRef<Path>) -> Result<(), Error> {
        let mut command = exe::privileged("sfdisk");
        if self.append {
            command.arg("--append");
        }
        command
            .arg("--no-reread")
            .arg("--no-tell-kernel")
            .arg(device.as_ref());

        command
            .capture_with_input(&self.render())?
            .check()
            .with_context(|| {
                format!(
                    "Failed to write partition table to '{}'",
                    device.as_ref().display()
                )
            })
    }
}
