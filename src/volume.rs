//! Volume composition.
//!
//! Volumes are configuration records bound to their inputs through handles,
//! never through direct references: a RAID array names the partition group
//! supplying its members, a volume group names partitions and/or earlier
//! volumes, a logical volume names its group. The [`VolumeRegistry`] owns
//! the records in insertion order and drives the staged build; a volume may
//! only depend on volumes defined before it.
//!
//! Nothing is built until the partition set reports both commit stages
//! complete. That flag is the barrier between partitioning and volume
//! construction.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Error};
use log::{debug, info};

use diskutils::{lvm, mdadm};
use recipe_api::{
    config::{RaidConfig, VolumeConfig},
    error::{DeviceError, VolumeError},
    Handle,
};

use crate::partitioner::PartitionSet;

/// Runtime state shared by every volume kind. Starts unbuilt; the device
/// path appears once the volume exists on the host.
#[derive(Debug, Clone, Default)]
pub struct VolumeState {
    built: bool,
    sys_device: Option<PathBuf>,
}

/// One composed storage volume.
#[derive(Debug)]
pub enum Volume {
    /// Pass-through to a single partition.
    Raw {
        handle: Handle,
        partition: Handle,
        state: VolumeState,
    },

    /// Software RAID array assembled by mdadm.
    Raid {
        config: RaidConfig,
        state: VolumeState,
    },

    /// LVM volume group over partitions and/or earlier volumes.
    LvmVg {
        handle: Handle,
        partitions: Vec<Handle>,
        volumes: Vec<Handle>,
        state: VolumeState,
    },

    /// LVM logical volume carved out of a volume group.
    LvmLv {
        handle: Handle,
        group: Handle,
        percent: f64,
        state: VolumeState,
    },
}

impl Volume {
    /// Turns a configuration record into an unbuilt volume, running the
    /// static checks the record offers.
    pub fn from_config(config: VolumeConfig) -> Result<Self, VolumeError> {
        match config {
            VolumeConfig::Raw { handle, partition } => Ok(Volume::Raw {
                handle,
                partition,
                state: VolumeState::default(),
            }),
            VolumeConfig::Raid(raid) => {
                raid.validate()?;
                Ok(Volume::Raid {
                    config: raid,
                    state: VolumeState::default(),
                })
            }
            VolumeConfig::LvmVg {
                handle,
                partitions,
                volumes,
            } => Ok(Volume::LvmVg {
                handle,
                partitions,
                volumes,
                state: VolumeState::default(),
            }),
            VolumeConfig::LvmLv {
                handle,
                group,
                percent,
            } => Ok(Volume::LvmLv {
                handle,
                group,
                percent,
                state: VolumeState::default(),
            }),
        }
    }

    pub fn handle(&self) -> &Handle {
        match self {
            Volume::Raw { handle, .. } => handle,
            Volume::Raid { config, .. } => &config.handle,
            Volume::LvmVg { handle, .. } => handle,
            Volume::LvmLv { handle, .. } => handle,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Volume::Raw { .. } => "raw",
            Volume::Raid { .. } => "raid",
            Volume::LvmVg { .. } => "lvm-vg",
            Volume::LvmLv { .. } => "lvm-lv",
        }
    }

    fn state(&self) -> &VolumeState {
        match self {
            Volume::Raw { state, .. }
            | Volume::Raid { state, .. }
            | Volume::LvmVg { state, .. }
            | Volume::LvmLv { state, .. } => state,
        }
    }

    pub fn is_built(&self) -> bool {
        self.state().built
    }

    /// Kernel device path of the built volume.
    pub fn sys_device(&self) -> Result<&Path, VolumeError> {
        self.state()
            .sys_device
            .as_deref()
            .ok_or_else(|| VolumeError::NotBuilt {
                handle: self.handle().to_string(),
            })
    }

    fn build(&mut self, partitions: &PartitionSet, built: &[Volume]) -> Result<(), Error> {
        match self {
            Volume::Raw {
                handle,
                partition,
                state,
            } => {
                let device = resolve_raw(handle, partition, partitions)?;
                state.sys_device = Some(device);
            }
            Volume::Raid { config, state } => {
                let device = build_raid(config, partitions)?;
                state.sys_device = Some(device);
            }
            Volume::LvmVg {
                handle,
                partitions: partition_handles,
                volumes,
                state,
            } => {
                let device = build_vg(handle, partition_handles, volumes, partitions, built)?;
                state.sys_device = Some(device);
            }
            Volume::LvmLv {
                handle,
                group,
                percent,
                state,
            } => {
                let device = build_lv(handle, group, *percent, built)?;
                state.sys_device = Some(device);
            }
        }

        match self {
            Volume::Raw { state, .. }
            | Volume::Raid { state, .. }
            | Volume::LvmVg { state, .. }
            | Volume::LvmLv { state, .. } => state.built = true,
        }

        Ok(())
    }
}

/// A raw volume reads through to exactly one partition.
fn resolve_raw(
    handle: &Handle,
    partition: &Handle,
    partitions: &PartitionSet,
) -> Result<PathBuf, Error> {
    let candidates = partitions.partitions_by_handle(partition);
    if candidates.len() != 1 {
        bail!(
            "Raw volume '{handle}' requires exactly one partition under handle \
             '{partition}', found {}",
            candidates.len()
        );
    }
    Ok(candidates[0].node.clone())
}

fn build_raid(config: &RaidConfig, partitions: &PartitionSet) -> Result<PathBuf, Error> {
    let path = config.array_path.to_string_lossy().to_string();
    if config.array_path.exists() {
        bail!(VolumeError::RaidDeviceExists { path });
    }

    let available = partitions.partitions_by_handle(&config.partitions);
    let expected = config.members.len() + config.spares.len();
    if available.len() != expected {
        bail!(VolumeError::RaidConfigInvalid {
            reason: format!(
                "{expected} devices (including spares) expected under handle '{}', \
                 {} available",
                config.partitions,
                available.len()
            ),
        });
    }

    let pick = |indices: &[usize]| -> Result<Vec<PathBuf>, Error> {
        indices
            .iter()
            .map(|&index| {
                available
                    .get(index)
                    .map(|partition| partition.node.clone())
                    .ok_or_else(|| {
                        VolumeError::RaidConfigInvalid {
                            reason: format!("device index {index} is out of range"),
                        }
                        .into()
                    })
            })
            .collect()
    };
    let members = pick(&config.members)?;
    let spares = pick(&config.spares)?;

    mdadm::create(
        &config.array_path,
        config.level,
        &members,
        &spares,
        config.metadata,
    )?;

    if !config.array_path.exists() {
        bail!(VolumeError::RaidDeviceMissing { path });
    }

    Ok(config.array_path.clone())
}

fn build_vg(
    handle: &Handle,
    partition_handles: &[Handle],
    volume_handles: &[Handle],
    partitions: &PartitionSet,
    built: &[Volume],
) -> Result<PathBuf, Error> {
    let mut devices: Vec<PathBuf> = Vec::new();

    for partition in partition_handles {
        let group = partitions.partitions_by_handle(partition);
        if group.is_empty() {
            bail!(VolumeError::HandleNotFound {
                handle: partition.to_string(),
            });
        }
        devices.extend(group.iter().map(|p| p.node.clone()));
    }

    for volume in volume_handles {
        let source = built
            .iter()
            .find(|candidate| candidate.handle() == volume)
            .ok_or_else(|| VolumeError::HandleNotFound {
                handle: volume.to_string(),
            })?;
        devices.push(source.sys_device()?.to_path_buf());
    }

    for device in &devices {
        if !device.exists() {
            bail!(DeviceError::DeviceNotFound {
                path: device.to_string_lossy().to_string(),
            });
        }

        // A device without a physical volume just needs one created; only
        // membership in another group is fatal.
        if !lvm::pv_exists(device)? {
            lvm::pv_create(device)?;
        }
        if let Some(group) = lvm::pv_volume_group(device)? {
            bail!(VolumeError::PvAlreadyInVg {
                device: device.to_string_lossy().to_string(),
                vg: group,
            });
        }
    }

    debug!(
        "Volume group '{handle}' spans {} device(s)",
        devices.len()
    );
    lvm::vg_create(handle.as_str(), &devices)?;

    Ok(PathBuf::from(format!("/dev/{handle}")))
}

fn build_lv(
    handle: &Handle,
    group: &Handle,
    percent: f64,
    built: &[Volume],
) -> Result<PathBuf, Error> {
    let source = built
        .iter()
        .find(|candidate| candidate.handle() == group)
        .ok_or_else(|| VolumeError::HandleNotFound {
            handle: group.to_string(),
        })?;

    if !matches!(source, Volume::LvmVg { .. }) {
        bail!(VolumeError::WrongVolumeKind {
            handle: group.to_string(),
            expected: "lvm-vg",
            found: source.kind_name(),
        });
    }

    let group_device = source.sys_device()?.to_path_buf();
    let available = lvm::vg_free_percent(&group_device)?;
    if available < percent {
        bail!(VolumeError::VgInsufficientSpace {
            requested: percent,
            available,
        });
    }

    lvm::lv_create(handle.as_str(), &group_device, percent)?;

    Ok(group_device.join(handle.as_str()))
}

/// Ordered volume collection with unique handles.
#[derive(Default)]
pub struct VolumeRegistry {
    volumes: Vec<Volume>,
}

impl VolumeRegistry {
    pub fn new() -> Self {
        VolumeRegistry::default()
    }

    /// Builds a registry from configuration records, preserving document
    /// order.
    pub fn from_configs(configs: &[VolumeConfig]) -> Result<Self, VolumeError> {
        let mut registry = VolumeRegistry::new();
        for config in configs {
            registry.insert(Volume::from_config(config.clone())?)?;
        }
        Ok(registry)
    }

    pub fn insert(&mut self, volume: Volume) -> Result<(), VolumeError> {
        if self.get(volume.handle()).is_some() {
            return Err(VolumeError::DuplicateHandle {
                handle: volume.handle().to_string(),
            });
        }
        self.volumes.push(volume);
        Ok(())
    }

    pub fn get(&self, handle: &Handle) -> Option<&Volume> {
        self.volumes.iter().find(|volume| volume.handle() == handle)
    }

    pub fn len(&self) -> usize {
        self.volumes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty()
    }

    pub fn is_built(&self) -> bool {
        self.volumes.iter().all(Volume::is_built)
    }

    /// Builds every volume in insertion order. Refuses to start before the
    /// partition set has been written to disk and announced to the kernel.
    pub fn build(&mut self, partitions: &PartitionSet) -> Result<(), Error> {
        if !partitions.is_committed() {
            bail!(VolumeError::PreconditionNotCommitted);
        }

        for index in 0..self.volumes.len() {
            let (built, rest) = self.volumes.split_at_mut(index);
            let volume = &mut rest[0];
            let handle = volume.handle().to_string();

            info!("Building volume '{handle}' ({})", volume.kind_name());
            volume
                .build(partitions, built)
                .with_context(|| format!("Failed to build volume '{handle}'"))?;
        }

        Ok(())
    }

    /// Kernel device paths of the built volumes, by handle.
    pub fn device_map(&self) -> BTreeMap<String, PathBuf> {
        self.volumes
            .iter()
            .filter(|volume| volume.is_built())
            .filter_map(|volume| {
                volume
                    .sys_device()
                    .ok()
                    .map(|device| (volume.handle().to_string(), device.to_path_buf()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use recipe_api::config::{PartitionTableType, RaidLevel, RaidMetadata};

    use crate::{
        partitioner::Partitioner,
        recipe::Recipe,
        testutil::{request, synthetic_device, MockTable},
    };

    use super::*;

    fn handle(value: &str) -> Handle {
        Handle::new(value).unwrap()
    }

    /// One mock device with two committed partitions: `boot` and `data`.
    fn committed_set() -> PartitionSet {
        let recipe = Recipe::from_parts(
            vec![synthetic_device("/dev/sda", 80_000, 512, None)],
            vec![
                request("boot", 1_024_000, 1_024_000, 0),
                request("data", 10_000_000, 80_000_000, 10),
            ],
            PartitionTableType::Gpt,
            false,
        )
        .unwrap();

        let (table, _) = MockTable::new("/dev/sda");
        let partitioner = Partitioner::with_adapters(recipe, vec![Box::new(table)]);
        let mut set = PartitionSet::new(vec![partitioner]);
        set.plan().unwrap();
        set.commit().unwrap();
        set
    }

    fn raw_config(volume: &str, partition: &str) -> VolumeConfig {
        VolumeConfig::Raw {
            handle: handle(volume),
            partition: handle(partition),
        }
    }

    #[test]
    fn test_registry_rejects_duplicate_handles() {
        let mut registry = VolumeRegistry::new();
        registry
            .insert(Volume::from_config(raw_config("a", "boot")).unwrap())
            .unwrap();
        let err = registry
            .insert(Volume::from_config(raw_config("a", "data")).unwrap())
            .unwrap_err();
        assert_eq!(
            err,
            VolumeError::DuplicateHandle {
                handle: "a".to_string()
            }
        );
    }

    #[test]
    fn test_raid_config_is_validated_at_construction() {
        let config = VolumeConfig::Raid(RaidConfig {
            handle: handle("md"),
            array_path: "/dev/md0".into(),
            level: RaidLevel::Raid1,
            partitions: handle("data"),
            members: vec![0, 1, 2],
            spares: vec![],
            metadata: RaidMetadata::default(),
        });
        let err = Volume::from_config(config).unwrap_err();
        assert!(matches!(err, VolumeError::RaidConfigInvalid { .. }));
    }

    #[test]
    fn test_build_requires_committed_partitions() {
        let recipe = Recipe::from_parts(
            vec![synthetic_device("/dev/sda", 80_000, 512, None)],
            vec![request("data", 10_000_000, 80_000_000, 1)],
            PartitionTableType::Gpt,
            false,
        )
        .unwrap();
        let (table, _) = MockTable::new("/dev/sda");
        let mut set = PartitionSet::new(vec![Partitioner::with_adapters(
            recipe,
            vec![Box::new(table)],
        )]);
        set.plan().unwrap();
        // Deliberately no commit.

        let mut registry =
            VolumeRegistry::from_configs(&[raw_config("vol", "data")]).unwrap();
        let err = registry.build(&set).unwrap_err();
        assert_eq!(
            err.downcast_ref::<VolumeError>(),
            Some(&VolumeError::PreconditionNotCommitted)
        );
    }

    #[test]
    fn test_raw_volume_resolves_its_partition() {
        let set = committed_set();
        let mut registry =
            VolumeRegistry::from_configs(&[raw_config("vol", "data")]).unwrap();

        assert!(!registry.is_built());
        registry.build(&set).unwrap();
        assert!(registry.is_built());

        let volume = registry.get(&handle("vol")).unwrap();
        assert_eq!(volume.sys_device().unwrap(), Path::new("/dev/sda2"));
        assert_eq!(
            registry.device_map(),
            maplit::btreemap! {
                "vol".to_string() => PathBuf::from("/dev/sda2"),
            }
        );
    }

    #[test]
    fn test_raw_volume_needs_exactly_one_partition() {
        // Two devices means two partitions per handle.
        let recipe = Recipe::from_parts(
            vec![
                synthetic_device("/dev/sda", 80_000, 512, None),
                synthetic_device("/dev/sdb", 80_000, 512, None),
            ],
            vec![request("data", 10_000_000, 80_000_000, 1)],
            PartitionTableType::Gpt,
            false,
        )
        .unwrap();
        let (table_a, _) = MockTable::new("/dev/sda");
        let (table_b, _) = MockTable::new("/dev/sdb");
        let mut set = PartitionSet::new(vec![Partitioner::with_adapters(
            recipe,
            vec![Box::new(table_a), Box::new(table_b)],
        )]);
        set.plan().unwrap();
        set.commit().unwrap();

        let mut registry =
            VolumeRegistry::from_configs(&[raw_config("vol", "data")]).unwrap();
        let err = registry.build(&set).unwrap_err();
        assert!(format!("{err:#}").contains("exactly one partition"));
    }

    #[test]
    fn test_raid_member_count_checked_against_partition_group() {
        let set = committed_set();
        // The `data` handle provides one partition, the mirror wants two.
        let config = VolumeConfig::Raid(RaidConfig {
            handle: handle("md"),
            array_path: "/dev/md931".into(),
            level: RaidLevel::Raid1,
            partitions: handle("data"),
            members: vec![0, 1],
            spares: vec![],
            metadata: RaidMetadata::default(),
        });
        let mut registry = VolumeRegistry::from_configs(&[config]).unwrap();
        let err = registry.build(&set).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<VolumeError>(),
            Some(VolumeError::RaidConfigInvalid { .. })
        ));
    }

    #[test]
    fn test_logical_volume_requires_a_volume_group() {
        let set = committed_set();
        let configs = [
            raw_config("not-a-group", "data"),
            VolumeConfig::LvmLv {
                handle: handle("lv"),
                group: handle("not-a-group"),
                percent: 50.0,
            },
        ];
        let mut registry = VolumeRegistry::from_configs(&configs).unwrap();
        let err = registry.build(&set).unwrap_err();
        assert_eq!(
            err.downcast_ref::<VolumeError>(),
            Some(&VolumeError::WrongVolumeKind {
                handle: "not-a-group".to_string(),
                expected: "lvm-vg",
                found: "raw",
            })
        );
    }

    #[test]
    fn test_logical_volume_group_must_be_defined_before_it() {
        let set = committed_set();
        let configs = [VolumeConfig::LvmLv {
            handle: handle("lv"),
            group: handle("ghost"),
            percent: 50.0,
        }];
        let mut registry = VolumeRegistry::from_configs(&configs).unwrap();
        let err = registry.build(&set).unwrap_err();
        assert_eq!(
            err.downcast_ref::<VolumeError>(),
            Some(&VolumeError::HandleNotFound {
                handle: "ghost".to_string()
            })
        );
    }

    #[test]
    fn test_sys_device_is_gated_on_built() {
        let volume = Volume::from_config(raw_config("vol", "data")).unwrap();
        assert!(!volume.is_built());
        assert_eq!(
            volume.sys_device().unwrap_err(),
            VolumeError::NotBuilt {
                handle: "vol".to_string()
            }
        );
    }
}
