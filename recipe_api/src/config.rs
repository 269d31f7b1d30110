//! Declarative recipe configuration.
//!
//! A whole run is described by one [`RecipeConfig`] document: the devices to
//! partition, the weighted partition requests, and the volumes (RAID arrays,
//! LVM volume groups and logical volumes) to compose on top of them.
//!
//! ```yaml
//! devices:
//!   - /dev/sdb
//!   - /dev/sdc
//! table: gpt
//! partitions:
//!   - handle: boot
//!     minSize: 512MiB
//!     maxSize: 512MiB
//!     weight: 0
//!     flags: [esp]
//!   - handle: pool
//!     minSize: 10GB
//!     maxSize: 100GB
//!     weight: 10
//!     flags: [raid]
//! volumes:
//!   - kind: raid
//!     handle: pool-md
//!     arrayPath: /dev/md0
//!     level: raid1
//!     partitions: pool
//!     members: [0, 1]
//!   - kind: lvm-vg
//!     handle: data
//!     volumes: [pool-md]
//!   - kind: lvm-lv
//!     handle: scratch
//!     group: data
//!     percent: 40
//! ```

use std::{collections::HashSet, path::PathBuf};

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::{
    error::VolumeError,
    primitives::size::ByteSize,
    Handle,
};

lazy_static! {
    static ref MD_PATH_PATTERN: Regex = Regex::new(r"^/dev/md\d+$").unwrap();
}

/// Partition table flavors the partitioner is willing to write.
#[derive(
    Serialize, Deserialize, Copy, Clone, Debug, Hash, Eq, PartialEq, Display, EnumString, Default,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PartitionTableType {
    #[default]
    Gpt,
    Msdos,
}

/// Kind of a requested partition entry.
///
/// `Freespace` reserves its allocated span as a gap: the span is counted
/// against the device but no table entry is written for it.
#[derive(
    Serialize, Deserialize, Copy, Clone, Debug, Hash, Eq, PartialEq, Display, EnumString, Default,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PartitionKind {
    #[default]
    Normal,
    Logical,
    Extended,
    Freespace,
    Metadata,
    Protected,
}

/// Closed set of partition flags.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, Hash, Eq, PartialEq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PartitionFlag {
    Boot,
    Root,
    Swap,
    Hidden,
    Raid,
    Lvm,
    Lba,
    Hpservice,
    Palo,
    Prep,
    Msftres,
    BiosGrub,
    AppleTvRecovery,
    Diag,
    LegacyBoot,
    Msftdata,
    Irst,
    Esp,
    ChromeOsKernel,
    BlsBoot,
    LinuxHome,
    NoAutoMount,
}

/// One named partition request.
///
/// Requests may share a handle across a multi-device recipe; the group then
/// denotes one partition per device with identical geometry.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PartitionRequest {
    pub handle: Handle,

    /// Smallest acceptable size for this partition.
    pub min_size: ByteSize,

    /// Largest useful size for this partition.
    pub max_size: ByteSize,

    /// Share of contested space relative to the other requests. Weight 0
    /// keeps the partition at its minimum when space runs short.
    pub weight: u64,

    #[serde(default)]
    pub kind: PartitionKind,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<PartitionFlag>,
}

/// Software RAID levels supported by the composer.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, Hash, Eq, PartialEq, Display, EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum RaidLevel {
    Raid0,
    Raid1,
    Raid4,
    Raid5,
    Raid6,
    Raid10,
}

/// mdadm superblock versions.
#[derive(
    Serialize, Deserialize, Copy, Clone, Debug, Hash, Eq, PartialEq, Display, EnumString, Default,
)]
pub enum RaidMetadata {
    #[serde(rename = "0")]
    #[strum(serialize = "0")]
    V0,

    #[serde(rename = "0.90")]
    #[strum(serialize = "0.90")]
    V090,

    #[serde(rename = "1.0")]
    #[strum(serialize = "1.0")]
    V10,

    #[serde(rename = "1")]
    #[strum(serialize = "1")]
    V1,

    #[default]
    #[serde(rename = "1.2")]
    #[strum(serialize = "1.2")]
    V12,
}

impl RaidMetadata {
    /// mdadm prompts for confirmation when the superblock format leaves the
    /// start of the device usable for a boot sector (the 1.x family).
    pub fn needs_confirmation(&self) -> bool {
        matches!(self, RaidMetadata::V10 | RaidMetadata::V1 | RaidMetadata::V12)
    }
}

/// A software RAID array assembled from the partitions of one request group.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RaidConfig {
    pub handle: Handle,

    /// Path of the md device to create, e.g. `/dev/md0`.
    pub array_path: PathBuf,

    pub level: RaidLevel,

    /// Handle of the partition request group supplying the member devices.
    pub partitions: Handle,

    /// Indices into the request group's partitions used as data devices.
    pub members: Vec<usize>,

    /// Indices used as hot spares. Disjoint from `members`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub spares: Vec<usize>,

    #[serde(default)]
    pub metadata: RaidMetadata,
}

impl RaidConfig {
    /// Checks everything that can be checked without looking at the host:
    /// device-path shape, member counts per level, index disjointness.
    pub fn validate(&self) -> Result<(), VolumeError> {
        let invalid = |reason: String| VolumeError::RaidConfigInvalid { reason };

        let path = self.array_path.to_string_lossy();
        if !MD_PATH_PATTERN.is_match(&path) {
            return Err(invalid(format!(
                "array path '{path}' must be of the form /dev/md<N>"
            )));
        }

        let n = self.members.len();
        match self.level {
            RaidLevel::Raid0 if n < 2 => {
                return Err(invalid(format!("{} needs at least 2 members, got {n}", self.level)));
            }
            RaidLevel::Raid1 if n != 2 => {
                return Err(invalid(format!("{} needs exactly 2 members, got {n}", self.level)));
            }
            RaidLevel::Raid10 if n != 4 => {
                return Err(invalid(format!("{} needs exactly 4 members, got {n}", self.level)));
            }
            RaidLevel::Raid4 | RaidLevel::Raid5 | RaidLevel::Raid6 if n < 3 => {
                return Err(invalid(format!("{} needs at least 3 members, got {n}", self.level)));
            }
            _ => {}
        }

        let mut seen = HashSet::new();
        for index in self.members.iter().chain(self.spares.iter()) {
            if !seen.insert(*index) {
                return Err(invalid(format!(
                    "device index {index} is listed more than once across members and spares"
                )));
            }
        }

        Ok(())
    }
}

/// A volume definition. Volumes resolve their inputs through handles, never
/// by direct reference, so a document can be validated before anything is
/// written to a disk.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum VolumeConfig {
    /// Pass-through to a single partition.
    Raw { handle: Handle, partition: Handle },

    /// Software RAID array over a partition group.
    Raid(RaidConfig),

    /// LVM volume group over partitions and/or previously built volumes.
    LvmVg {
        handle: Handle,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        partitions: Vec<Handle>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        volumes: Vec<Handle>,
    },

    /// LVM logical volume taking a percentage of its group.
    LvmLv {
        handle: Handle,
        group: Handle,
        percent: f64,
    },
}

impl VolumeConfig {
    pub fn handle(&self) -> &Handle {
        match self {
            VolumeConfig::Raw { handle, .. } => handle,
            VolumeConfig::Raid(raid) => &raid.handle,
            VolumeConfig::LvmVg { handle, .. } => handle,
            VolumeConfig::LvmLv { handle, .. } => handle,
        }
    }
}

/// A complete run description: devices, partition requests, volumes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RecipeConfig {
    /// Whole-disk devices to partition, e.g. `/dev/sdb`. All devices receive
    /// the same partition layout.
    pub devices: Vec<PathBuf>,

    #[serde(default)]
    pub table: PartitionTableType,

    /// Keep existing partitions and allocate inside the largest free region
    /// instead of starting a fresh table.
    #[serde(default)]
    pub keep_partitions: bool,

    pub partitions: Vec<PartitionRequest>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<VolumeConfig>,
}

impl RecipeConfig {
    pub fn from_yaml(document: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(document)
    }

    /// Static validation of the volume graph: unique volume handles, RAID
    /// constraints, and resolvable source references (partitions must name a
    /// request handle; volume sources must be defined earlier in the list).
    pub fn validate(&self) -> Result<(), VolumeError> {
        let partition_handles: HashSet<&Handle> =
            self.partitions.iter().map(|request| &request.handle).collect();

        let missing = |handle: &Handle| VolumeError::HandleNotFound {
            handle: handle.to_string(),
        };

        let mut defined: HashSet<&Handle> = HashSet::new();
        for volume in &self.volumes {
            if !defined.insert(volume.handle()) {
                return Err(VolumeError::DuplicateHandle {
                    handle: volume.handle().to_string(),
                });
            }

            match volume {
                VolumeConfig::Raw { partition, .. } => {
                    if !partition_handles.contains(partition) {
                        return Err(missing(partition));
                    }
                }
                VolumeConfig::Raid(raid) => {
                    raid.validate()?;
                    if !partition_handles.contains(&raid.partitions) {
                        return Err(missing(&raid.partitions));
                    }
                }
                VolumeConfig::LvmVg {
                    partitions,
                    volumes,
                    ..
                } => {
                    if let Some(handle) = partitions.iter().find(|h| !partition_handles.contains(h))
                    {
                        return Err(missing(handle));
                    }
                    // Sources must be built before this group, i.e. defined
                    // earlier in the document.
                    if let Some(handle) = volumes
                        .iter()
                        .find(|h| !defined.contains(h) || *h == volume.handle())
                    {
                        return Err(missing(handle));
                    }
                }
                VolumeConfig::LvmLv { group, .. } => {
                    if !defined.contains(group) || group == volume.handle() {
                        return Err(missing(group));
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    fn raid_config(level: RaidLevel, members: Vec<usize>, spares: Vec<usize>) -> RaidConfig {
        RaidConfig {
            handle: Handle::new("array").unwrap(),
            array_path: "/dev/md0".into(),
            level,
            partitions: Handle::new("pool").unwrap(),
            members,
            spares,
            metadata: RaidMetadata::default(),
        }
    }

    #[test]
    fn test_raid_member_count_rules() {
        raid_config(RaidLevel::Raid0, vec![0, 1], vec![]).validate().unwrap();
        raid_config(RaidLevel::Raid1, vec![0, 1], vec![2]).validate().unwrap();
        raid_config(RaidLevel::Raid5, vec![0, 1, 2], vec![]).validate().unwrap();
        raid_config(RaidLevel::Raid6, vec![0, 1, 2, 3], vec![]).validate().unwrap();
        raid_config(RaidLevel::Raid10, vec![0, 1, 2, 3], vec![]).validate().unwrap();

        // Mirrors take exactly two data devices.
        let err = raid_config(RaidLevel::Raid1, vec![0, 1, 2], vec![])
            .validate()
            .unwrap_err();
        assert!(matches!(err, VolumeError::RaidConfigInvalid { .. }));

        raid_config(RaidLevel::Raid0, vec![0], vec![]).validate().unwrap_err();
        raid_config(RaidLevel::Raid4, vec![0, 1], vec![]).validate().unwrap_err();
        raid_config(RaidLevel::Raid10, vec![0, 1, 2], vec![]).validate().unwrap_err();
    }

    #[test]
    fn test_raid_index_disjointness() {
        let err = raid_config(RaidLevel::Raid1, vec![0, 1], vec![1])
            .validate()
            .unwrap_err();
        assert!(matches!(err, VolumeError::RaidConfigInvalid { .. }));

        raid_config(RaidLevel::Raid1, vec![0, 0], vec![]).validate().unwrap_err();
    }

    #[test]
    fn test_raid_array_path_shape() {
        let mut config = raid_config(RaidLevel::Raid1, vec![0, 1], vec![]);
        for path in ["/dev/md", "/dev/md0p1", "/dev/sda", "md0", "/dev/md/array"] {
            config.array_path = path.into();
            config.validate().unwrap_err();
        }

        config.array_path = "/dev/md127".into();
        config.validate().unwrap();
    }

    #[test]
    fn test_metadata_confirmation_set() {
        assert!(!RaidMetadata::V0.needs_confirmation());
        assert!(!RaidMetadata::V090.needs_confirmation());
        assert!(RaidMetadata::V10.needs_confirmation());
        assert!(RaidMetadata::V1.needs_confirmation());
        assert!(RaidMetadata::V12.needs_confirmation());
    }

    #[test]
    fn test_enum_string_forms() {
        assert_eq!(RaidLevel::Raid10.to_string(), "raid10");
        assert_eq!(RaidMetadata::V090.to_string(), "0.90");
        assert_eq!(PartitionTableType::Msdos.to_string(), "msdos");
        assert_eq!(PartitionFlag::BiosGrub.to_string(), "bios_grub");
        assert_eq!(PartitionFlag::ChromeOsKernel.to_string(), "chrome_os_kernel");

        serde_yaml::from_str::<PartitionFlag>("esp").unwrap();
        serde_yaml::from_str::<PartitionFlag>("not_a_flag").unwrap_err();
        serde_yaml::from_str::<PartitionKind>("extended").unwrap();
        serde_yaml::from_str::<PartitionKind>("primary").unwrap_err();
    }

    const SAMPLE_RECIPE: &str = indoc! {r#"
        devices:
          - /dev/sdb
          - /dev/sdc
        table: gpt
        partitions:
          - handle: boot
            minSize: 512MiB
            maxSize: 512MiB
            weight: 0
            flags: [esp, boot]
          - handle: pool
            minSize: 10GB
            maxSize: 100GB
            weight: 10
            flags: [raid]
        volumes:
          - kind: raid
            handle: pool-md
            arrayPath: /dev/md0
            level: raid1
            partitions: pool
            members: [0, 1]
            metadata: "1.2"
          - kind: lvm-vg
            handle: data
            volumes: [pool-md]
          - kind: lvm-lv
            handle: scratch
            group: data
            percent: 40
    "#};

    #[test]
    fn test_recipe_document_roundtrip() {
        let recipe = RecipeConfig::from_yaml(SAMPLE_RECIPE).unwrap();
        recipe.validate().unwrap();

        assert_eq!(recipe.devices.len(), 2);
        assert_eq!(recipe.table, PartitionTableType::Gpt);
        assert!(!recipe.keep_partitions);
        assert_eq!(recipe.partitions[0].min_size, ByteSize(512 * 1024 * 1024));
        assert_eq!(recipe.partitions[1].weight, 10);
        assert_eq!(recipe.volumes.len(), 3);

        let VolumeConfig::Raid(raid) = &recipe.volumes[0] else {
            panic!("expected a raid volume");
        };
        assert_eq!(raid.level, RaidLevel::Raid1);
        assert_eq!(raid.members, vec![0, 1]);

        let rendered = serde_yaml::to_string(&recipe).unwrap();
        let reparsed = RecipeConfig::from_yaml(&rendered).unwrap();
        assert_eq!(recipe, reparsed);
    }

    #[test]
    fn test_recipe_validation_catches_dangling_handles() {
        let mut recipe = RecipeConfig::from_yaml(SAMPLE_RECIPE).unwrap();

        // A volume group naming a volume defined after it is rejected.
        recipe.volumes.swap(1, 2);
        let err = recipe.validate().unwrap_err();
        assert!(matches!(err, VolumeError::HandleNotFound { .. }));

        let mut recipe = RecipeConfig::from_yaml(SAMPLE_RECIPE).unwrap();
        recipe.partitions.remove(1);
        let err = recipe.validate().unwrap_err();
        assert_eq!(
            err,
            VolumeError::HandleNotFound {
                handle: "pool".to_string()
            }
        );
    }

    #[test]
    fn test_recipe_validation_catches_duplicates() {
        let mut recipe = RecipeConfig::from_yaml(SAMPLE_RECIPE).unwrap();
        let clone = recipe.volumes[1].clone();
        recipe.volumes.push(clone);
        let err = recipe.validate().unwrap_err();
        assert_eq!(
            err,
            VolumeError::DuplicateHandle {
                handle: "data".to_string()
            }
        );
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let document = indoc! {r#"
            devices: [/dev/sdb]
            partitions: []
            mystery: true
        "#};
        RecipeConfig::from_yaml(document).unwrap_err();
    }
}
