//! The partition-table seam: a narrow adapter trait the partitioner drives,
//! with a production implementation that renders sfdisk scripts.

use std::path::{Path, PathBuf};

use anyhow::{Context, Error};
use log::{debug, info};
use serde::Serialize;

use diskutils::{
    sfdisk::{DiskLayout, ScriptEntry, TableEntry, TableLabel, TableScript},
    sysblock, udevadm,
};
use recipe_api::{
    config::{PartitionFlag, PartitionKind, PartitionTableType},
    Handle,
};

use crate::{
    device::BlockDevice,
    report::{DeviceReport, PartitionEntry},
};

// GPT type GUIDs for the flag-derived partition roles.
const GUID_ESP: &str = "C12A7328-F81F-11D2-BA4B-00A0C93EC93B";
const GUID_BIOS_BOOT: &str = "21686148-6449-6E6F-744E-656564454649";
const GUID_LINUX_RAID: &str = "A19D880F-05FC-4D3B-A006-743F0F84911E";
const GUID_LINUX_LVM: &str = "E6D6D379-F507-44C2-A23C-238F2A3DF928";
const GUID_LINUX_SWAP: &str = "0657FD6D-A4AB-43C4-84E5-0933C84B4F4F";
const GUID_LINUX_HOME: &str = "933AC7E1-2EB4-4F13-B844-0E14E2AEF915";
const GUID_LINUX_GENERIC: &str = "0FC63DAF-8483-4772-8E79-3D69D8477DE4";

/// Geometry and typing of one partition to add, in device sectors.
#[derive(Debug, Clone)]
pub struct PartitionSpec<'a> {
    pub handle: &'a Handle,
    pub start: u64,
    pub length: u64,
    pub kind: PartitionKind,
    pub flags: &'a [PartitionFlag],
}

/// A partition the planner has placed and, once committed, written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedPartition {
    pub handle: Handle,

    /// The disk this partition lives on.
    pub device: PathBuf,

    /// Kernel node path the partition will appear as.
    pub node: PathBuf,

    pub number: u64,

    /// First sector.
    pub start: u64,

    /// Length in sectors.
    pub length: u64,

    pub kind: PartitionKind,

    pub flags: Vec<PartitionFlag>,
}

impl PlannedPartition {
    pub fn end(&self) -> u64 {
        self.start + self.length - 1
    }

    pub fn active(&self) -> bool {
        self.flags.contains(&PartitionFlag::Boot)
    }
}

/// What the partitioner needs from a partition table: staging entries,
/// flushing them to the device, and telling the kernel.
pub trait TableAdapter {
    fn device_path(&self) -> &Path;

    /// Stages one partition and returns its resolved identity (number and
    /// node path).
    fn add_partition(&mut self, spec: PartitionSpec<'_>) -> Result<PlannedPartition, Error>;

    /// Flushes the staged entries to the device.
    fn commit_to_device(&mut self) -> Result<(), Error>;

    /// Asks the kernel to re-read the device's table.
    fn commit_to_os(&mut self) -> Result<(), Error>;

    /// Report document: the table as found and as staged.
    fn describe(&self) -> DeviceReport;
}

/// Production adapter: stages entries as an sfdisk script and applies it in
/// one shot.
pub struct SfdiskTable {
    path: PathBuf,
    label: TableLabel,
    append: bool,
    model: String,
    physical_sector_size: u64,
    sector_size: u64,
    length: u64,
    existing: Vec<TableEntry>,
    script: TableScript,
    planned: Vec<PlannedPartition>,
    next_number: u64,
}

impl SfdiskTable {
    /// Opens the table of `device`. The pre-existing label, if any, is
    /// snapshotted for reporting; in keep mode it also decides numbering
    /// and switches the script to append mode.
    pub fn open(device: &BlockDevice, table: PartitionTableType) -> Result<Self, Error> {
        let label = label_for(table);
        let existing_layout = DiskLayout::try_read(&device.path).with_context(|| {
            format!("Failed to read the current label of '{}'", device.path.display())
        })?;

        let append = device.keep_partitions && existing_layout.is_some();
        let next_number = existing_layout
            .as_ref()
            .filter(|_| append)
            .map(|layout| layout.max_partition_number() + 1)
            .unwrap_or(1);

        debug!(
            "Opening table of '{}' ({}, append: {append}, first new number: {next_number})",
            device.path.display(),
            label,
        );

        Ok(SfdiskTable {
            path: device.path.clone(),
            label,
            append,
            model: device.model.clone().unwrap_or_default(),
            physical_sector_size: device.physical_sector_size,
            sector_size: device.addressable.block_size,
            length: device.length,
            existing: existing_layout
                .map(|layout| layout.partitions)
                .unwrap_or_default(),
            script: TableScript::new(label, append),
            planned: Vec::new(),
            next_number,
        })
    }
}

impl TableAdapter for SfdiskTable {
    fn device_path(&self) -> &Path {
        &self.path
    }

    fn add_partition(&mut self, spec: PartitionSpec<'_>) -> Result<PlannedPartition, Error> {
        let number = self.next_number;
        self.next_number += 1;

        self.script.push(ScriptEntry {
            start: spec.start,
            size: spec.length,
            type_id: Some(type_for(self.label, spec.kind, spec.flags)),
            attrs: attrs_for(self.label, spec.flags),
            bootable: self.label == TableLabel::Dos
                && spec.flags.contains(&PartitionFlag::Boot),
        });

        let partition = PlannedPartition {
            handle: spec.handle.clone(),
            device: self.path.clone(),
            node: sysblock::partition_node_path(&self.path, number),
            number,
            start: spec.start,
            length: spec.length,
            kind: spec.kind,
            flags: spec.flags.to_vec(),
        };
        self.planned.push(partition.clone());
        Ok(partition)
    }

    fn commit_to_device(&mut self) -> Result<(), Error> {
        info!(
            "Writing {} partition(s) to '{}'",
            self.planned.len(),
            self.path.display()
        );
        self.script.apply(&self.path)
    }

    fn commit_to_os(&mut self) -> Result<(), Error> {
        info!(
            "Announcing the new table of '{}' to the kernel",
            self.path.display()
        );
        sysblock::partx_update(&self.path)?;
        udevadm::settle()
    }

    fn describe(&self) -> DeviceReport {
        let before: Vec<PartitionEntry> = self.existing.iter().map(Into::into).collect();

        let mut after = if self.append { before.clone() } else { Vec::new() };
        after.extend(self.planned.iter().map(PartitionEntry::from));

        DeviceReport {
            table_type: self.label.to_string(),
            model: self.model.clone(),
            path: self.path.clone(),
            physical_sector_size: self.physical_sector_size,
            sector_size: self.sector_size,
            length: self.length,
            partitions_before: before,
            partitions_after: after,
        }
    }
}

fn label_for(table: PartitionTableType) -> TableLabel {
    match table {
        PartitionTableType::Gpt => TableLabel::Gpt,
        PartitionTableType::Msdos => TableLabel::Dos,
    }
}

/// sfdisk type field for a staged partition: a role GUID on GPT labels, an
/// MBR id byte on dos labels. The first matching flag decides the role;
/// everything else is a generic Linux partition.
fn type_for(label: TableLabel, kind: PartitionKind, flags: &[PartitionFlag]) -> String {
    let has = |flag: PartitionFlag| flags.contains(&flag);

    match label {
        TableLabel::Gpt => {
            // The boot flag means the ESP role on GPT labels.
            if has(PartitionFlag::Esp) || has(PartitionFlag::Boot) {
                GUID_ESP
            } else if has(PartitionFlag::BiosGrub) {
                GUID_BIOS_BOOT
            } else if has(PartitionFlag::Raid) {
                GUID_LINUX_RAID
            } else if has(PartitionFlag::Lvm) {
                GUID_LINUX_LVM
            } else if has(PartitionFlag::Swap) {
                GUID_LINUX_SWAP
            } else if has(PartitionFlag::LinuxHome) {
                GUID_LINUX_HOME
            } else {
                GUID_LINUX_GENERIC
            }
            .to_string()
        }
        TableLabel::Dos => {
            let id = if kind == PartitionKind::Extended {
                "5"
            } else if has(PartitionFlag::Esp) {
                "ef"
            } else if has(PartitionFlag::Raid) {
                "fd"
            } else if has(PartitionFlag::Lvm) {
                "8e"
            } else if has(PartitionFlag::Swap) {
                "82"
            } else {
                "83"
            };
            id.to_string()
        }
    }
}

/// GPT attribute names for the staged flags; dos labels carry no attrs.
fn attrs_for(label: TableLabel, flags: &[PartitionFlag]) -> Vec<String> {
    if label == TableLabel::Gpt && flags.contains(&PartitionFlag::LegacyBoot) {
        vec!["LegacyBIOSBootable".to_string()]
    } else {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_for_gpt_roles() {
        let gpt = TableLabel::Gpt;
        let normal = PartitionKind::Normal;

        assert_eq!(type_for(gpt, normal, &[PartitionFlag::Esp]), GUID_ESP);
        assert_eq!(type_for(gpt, normal, &[PartitionFlag::Boot]), GUID_ESP);
        assert_eq!(
            type_for(gpt, normal, &[PartitionFlag::Raid]),
            GUID_LINUX_RAID
        );
        assert_eq!(type_for(gpt, normal, &[PartitionFlag::Lvm]), GUID_LINUX_LVM);
        assert_eq!(
            type_for(gpt, normal, &[PartitionFlag::BiosGrub]),
            GUID_BIOS_BOOT
        );
        assert_eq!(type_for(gpt, normal, &[]), GUID_LINUX_GENERIC);
        assert_eq!(
            type_for(gpt, normal, &[PartitionFlag::LegacyBoot]),
            GUID_LINUX_GENERIC
        );
    }

    #[test]
    fn test_type_for_dos_ids() {
        let dos = TableLabel::Dos;
        let normal = PartitionKind::Normal;

        assert_eq!(type_for(dos, PartitionKind::Extended, &[]), "5");
        assert_eq!(type_for(dos, normal, &[PartitionFlag::Raid]), "fd");
        assert_eq!(type_for(dos, normal, &[PartitionFlag::Lvm]), "8e");
        assert_eq!(type_for(dos, normal, &[PartitionFlag::Swap]), "82");
        assert_eq!(type_for(dos, normal, &[]), "83");
    }

    #[test]
    fn test_attrs_for() {
        assert_eq!(
            attrs_for(TableLabel::Gpt, &[PartitionFlag::LegacyBoot]),
            vec!["LegacyBIOSBootable".to_string()]
        );
        assert!(attrs_for(TableLabel::Gpt, &[PartitionFlag::Esp]).is_empty());
        assert!(attrs_for(TableLabel::Dos, &[PartitionFlag::LegacyBoot]).is_empty());
    }
}
