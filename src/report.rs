//! Run reports: a serialisable snapshot of each device's table before and
//! after partitioning, plus the composed volumes.

use std::{collections::BTreeMap, path::PathBuf};

use anyhow::{Context, Error};
use serde::{Deserialize, Serialize};

use diskutils::sfdisk::TableEntry;

use crate::table::PlannedPartition;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PartitionGeometry {
    pub start: u64,
    pub end: u64,
    pub length: u64,
}

/// One partition, before or after the run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PartitionEntry {
    pub number: u64,
    pub path: PathBuf,
    pub active: bool,
    pub geometry: PartitionGeometry,
    pub flags: String,
}

impl From<&TableEntry> for PartitionEntry {
    fn from(entry: &TableEntry) -> Self {
        PartitionEntry {
            number: entry.number().unwrap_or(0),
            path: entry.node.clone(),
            active: entry.bootable,
            geometry: PartitionGeometry {
                start: entry.start,
                end: entry.end(),
                length: entry.size_sectors,
            },
            flags: entry.attrs.clone().unwrap_or_default(),
        }
    }
}

impl From<&PlannedPartition> for PartitionEntry {
    fn from(partition: &PlannedPartition) -> Self {
        PartitionEntry {
            number: partition.number,
            path: partition.node.clone(),
            active: partition.active(),
            geometry: PartitionGeometry {
                start: partition.start,
                end: partition.end(),
                length: partition.length,
            },
            flags: partition
                .flags
                .iter()
                .map(|flag| flag.to_string())
                .collect::<Vec<_>>()
                .join(", "),
        }
    }
}

/// Per-device report document.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DeviceReport {
    /// Partition table type written to (or found on) the device.
    #[serde(rename = "type")]
    pub table_type: String,

    pub model: String,

    pub path: PathBuf,

    #[serde(rename = "physicalSectorSize")]
    pub physical_sector_size: u64,

    #[serde(rename = "sectorSize")]
    pub sector_size: u64,

    /// Device length in sectors.
    pub length: u64,

    pub partitions_before: Vec<PartitionEntry>,

    pub partitions_after: Vec<PartitionEntry>,
}

/// Everything one run did: device tables, the partition groups by handle,
/// and the devices the volumes materialised as.
#[derive(Serialize, Debug, Clone, Default)]
pub struct RunReport {
    pub devices: Vec<DeviceReport>,

    /// Partition entries grouped by request handle, across all devices.
    pub partitions: BTreeMap<String, Vec<PartitionEntry>>,

    /// Built volumes: handle to kernel device path.
    pub volumes: BTreeMap<String, PathBuf>,
}

impl RunReport {
    pub fn to_yaml(&self) -> Result<String, Error> {
        serde_yaml::to_string(self).context("Failed to render report as YAML")
    }

    pub fn to_json(&self, pretty: bool) -> Result<String, Error> {
        if pretty {
            serde_json::to_string_pretty(self).context("Failed to render report as JSON")
        } else {
            serde_json::to_string(self).context("Failed to render report as JSON")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_report() -> DeviceReport {
        DeviceReport {
            table_type: "gpt".to_string(),
            model: "QEMU HARDDISK".to_string(),
            path: "/dev/loop100".into(),
            physical_sector_size: 512,
            sector_size: 512,
            length: 80_000,
            partitions_before: vec![],
            partitions_after: vec![PartitionEntry {
                number: 1,
                path: "/dev/loop100p1".into(),
                active: true,
                geometry: PartitionGeometry {
                    start: 2048,
                    end: 4095,
                    length: 2048,
                },
                flags: "boot, esp".to_string(),
            }],
        }
    }

    #[test]
    fn test_document_field_names() {
        let rendered = serde_yaml::to_string(&sample_report()).unwrap();
        assert!(rendered.contains("type: gpt"), "{rendered}");
        assert!(rendered.contains("physicalSectorSize: 512"), "{rendered}");
        assert!(rendered.contains("sectorSize: 512"), "{rendered}");
        assert!(rendered.contains("partitions_before: []"), "{rendered}");
        assert!(rendered.contains("partitions_after:"), "{rendered}");
        assert!(rendered.contains("geometry:"), "{rendered}");
        assert!(rendered.contains("start: 2048"), "{rendered}");
    }

    #[test]
    fn test_report_roundtrip() {
        let report = sample_report();
        let rendered = serde_yaml::to_string(&report).unwrap();
        let reparsed: DeviceReport = serde_yaml::from_str(&rendered).unwrap();
        assert_eq!(report, reparsed);
    }

    #[test]
    fn test_run_report_rendering() {
        let report = RunReport {
            devices: vec![sample_report()],
            partitions: maplit::btreemap! {
                "esp".to_string() => vec![],
            },
            volumes: maplit::btreemap! {
                "data".to_string() => PathBuf::from("/dev/data"),
            },
        };

        let yaml = report.to_yaml().unwrap();
        assert!(yaml.contains("volumes:"), "{yaml}");
        assert!(yaml.contains("data: /dev/data"), "{yaml}");

        let json = report.to_json(true).unwrap();
        assert!(json.contains("\"devices\""), "{json}");
    }
}
