//! Partition planning and staged commits.
//!
//! A [`Partitioner`] materialises one recipe: it runs the chunk planner over
//! the common space and replays the resulting geometry onto every device,
//! so partitions sharing a request handle are identical across disks. Its
//! lifecycle is strictly forward: plan, write to the devices, announce to
//! the kernel. Each stage is idempotent; any adapter failure is fatal to
//! the partitioner.

use std::{
    collections::BTreeMap,
    path::PathBuf,
};

use anyhow::{ensure, Context, Error};
use log::{debug, info};

use recipe_api::{config::PartitionKind, Handle};

use crate::{
    recipe::Recipe,
    report::{DeviceReport, PartitionEntry},
    table::{PartitionSpec, PlannedPartition, SfdiskTable, TableAdapter},
};

pub struct Partitioner {
    recipe: Recipe,
    tables: Vec<Box<dyn TableAdapter>>,
    by_device: BTreeMap<PathBuf, Vec<PlannedPartition>>,
    by_handle: BTreeMap<Handle, Vec<PlannedPartition>>,
    planned: bool,
    saved_to_disk: bool,
    notified_to_os: bool,
}

impl Partitioner {
    /// Creates a partitioner backed by sfdisk tables, one per device.
    pub fn new(recipe: Recipe) -> Result<Self, Error> {
        let tables = recipe
            .devices
            .iter()
            .map(|device| {
                SfdiskTable::open(device, recipe.table)
                    .map(|table| Box::new(table) as Box<dyn TableAdapter>)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self::with_adapters(recipe, tables))
    }

    pub(crate) fn with_adapters(recipe: Recipe, tables: Vec<Box<dyn TableAdapter>>) -> Self {
        debug_assert_eq!(recipe.devices.len(), tables.len());
        Partitioner {
            recipe,
            tables,
            by_device: BTreeMap::new(),
            by_handle: BTreeMap::new(),
            planned: false,
            saved_to_disk: false,
            notified_to_os: false,
        }
    }

    /// Runs the planner and stages one partition per request on every
    /// device. Requests of kind `freespace` advance the offset without
    /// staging an entry.
    pub fn plan(&mut self) -> Result<(), Error> {
        if self.planned {
            return Ok(());
        }

        let chunks = self.recipe.plan_chunks()?;
        let block_size = self.recipe.common_block_size;

        for (device, table) in self.recipe.devices.iter().zip(self.tables.iter_mut()) {
            let mut offset = device.base_offset;
            for (chunk, request) in chunks.iter().zip(self.recipe.requests.iter()) {
                let length = chunk.size / block_size;

                if request.kind == PartitionKind::Freespace {
                    debug!(
                        "Reserving {length} sectors at {offset} on '{}' for '{}'",
                        device.path.display(),
                        request.handle
                    );
                    offset += length;
                    continue;
                }

                let partition = table
                    .add_partition(PartitionSpec {
                        handle: &request.handle,
                        start: offset,
                        length,
                        kind: request.kind,
                        flags: &request.flags,
                    })
                    .with_context(|| {
                        format!(
                            "Failed to stage partition '{}' on '{}'",
                            request.handle,
                            device.path.display()
                        )
                    })?;

                self.by_device
                    .entry(device.path.clone())
                    .or_default()
                    .push(partition.clone());
                self.by_handle
                    .entry(request.handle.clone())
                    .or_default()
                    .push(partition);

                offset += length;
            }
        }

        self.planned = true;
        info!(
            "Planned {} partition group(s) across {} device(s)",
            self.recipe.requests.len(),
            self.recipe.devices.len()
        );
        Ok(())
    }

    /// Flushes every staged table to its device.
    pub fn commit_to_devices(&mut self) -> Result<(), Error> {
        ensure!(self.planned, "Partitions have not been planned yet");
        if self.saved_to_disk {
            return Ok(());
        }

        for table in &mut self.tables {
            table.commit_to_device().with_context(|| {
                format!(
                    "Failed to write the table of '{}'",
                    table.device_path().display()
                )
            })?;
        }

        self.saved_to_disk = true;
        Ok(())
    }

    /// Asks the kernel to re-read every device's table.
    pub fn commit_to_os(&mut self) -> Result<(), Error> {
        ensure!(
            self.saved_to_disk,
            "Tables have not been written to the devices yet"
        );
        if self.notified_to_os {
            return Ok(());
        }

        for table in &mut self.tables {
            table.commit_to_os().with_context(|| {
                format!(
                    "Failed to notify the kernel about '{}'",
                    table.device_path().display()
                )
            })?;
        }

        self.notified_to_os = true;
        Ok(())
    }

    /// Both commit stages, in order.
    pub fn commit(&mut self) -> Result<(), Error> {
        self.commit_to_devices()?;
        self.commit_to_os()
    }

    pub fn is_planned(&self) -> bool {
        self.planned
    }

    pub fn is_saved_to_disk(&self) -> bool {
        self.saved_to_disk
    }

    pub fn is_notified_to_os(&self) -> bool {
        self.notified_to_os
    }

    /// The partitions staged for one request handle, in device order.
    pub fn partitions_by_handle(&self, handle: &Handle) -> &[PlannedPartition] {
        self.by_handle
            .get(handle)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The partitions staged on one device, in offset order.
    pub fn partitions_by_device(&self, device: &std::path::Path) -> &[PlannedPartition] {
        self.by_device
            .get(device)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn reports(&self) -> Vec<DeviceReport> {
        self.tables.iter().map(|table| table.describe()).collect()
    }

    pub fn partitions_report(&self) -> BTreeMap<String, Vec<PartitionEntry>> {
        self.by_handle
            .iter()
            .map(|(handle, partitions)| {
                (
                    handle.to_string(),
                    partitions.iter().map(Into::into).collect(),
                )
            })
            .collect()
    }
}

/// A group of partitioners committed as one unit, and the only object the
/// volume composer talks to. Its composite flags flip once every member has
/// completed the corresponding stage; `is_committed` is the barrier between
/// partitioning and volume construction.
#[derive(Default)]
pub struct PartitionSet {
    partitioners: Vec<Partitioner>,
    planned: bool,
    saved_to_disk: bool,
    notified_to_os: bool,
}

impl PartitionSet {
    pub fn new(partitioners: Vec<Partitioner>) -> Self {
        PartitionSet {
            partitioners,
            planned: false,
            saved_to_disk: false,
            notified_to_os: false,
        }
    }

    pub fn plan(&mut self) -> Result<(), Error> {
        for partitioner in &mut self.partitioners {
            partitioner.plan()?;
        }
        self.planned = true;
        Ok(())
    }

    pub fn commit_to_devices(&mut self) -> Result<(), Error> {
        for partitioner in &mut self.partitioners {
            partitioner.commit_to_devices()?;
        }
        self.saved_to_disk = true;
        Ok(())
    }

    pub fn commit_to_os(&mut self) -> Result<(), Error> {
        for partitioner in &mut self.partitioners {
            partitioner.commit_to_os()?;
        }
        self.notified_to_os = true;
        Ok(())
    }

    pub fn commit(&mut self) -> Result<(), Error> {
        self.commit_to_devices()?;
        self.commit_to_os()
    }

    pub fn is_planned(&self) -> bool {
        self.planned
    }

    /// Whether every table is on disk and the kernel has been told.
    pub fn is_committed(&self) -> bool {
        self.saved_to_disk && self.notified_to_os
    }

    /// All partitions carrying `handle`, across every partitioner, in
    /// insertion order.
    pub fn partitions_by_handle(&self, handle: &Handle) -> Vec<&PlannedPartition> {
        self.partitioners
            .iter()
            .flat_map(|partitioner| partitioner.partitions_by_handle(handle))
            .collect()
    }

    pub fn reports(&self) -> Vec<DeviceReport> {
        self.partitioners
            .iter()
            .flat_map(|partitioner| partitioner.reports())
            .collect()
    }

    pub fn partitions_report(&self) -> BTreeMap<String, Vec<PartitionEntry>> {
        let mut merged: BTreeMap<String, Vec<PartitionEntry>> = BTreeMap::new();
        for partitioner in &self.partitioners {
            for (handle, mut entries) in partitioner.partitions_report() {
                merged.entry(handle).or_default().append(&mut entries);
            }
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use recipe_api::config::{PartitionFlag, PartitionTableType};

    use crate::testutil::{flagged_request, request, synthetic_device, MockTable};

    use super::*;

    /// Two identical 80,000-sector disks and three requests; the middle one
    /// is a freespace gap.
    fn mock_partitioner() -> (
        Partitioner,
        std::rc::Rc<std::cell::RefCell<crate::testutil::MockState>>,
        std::rc::Rc<std::cell::RefCell<crate::testutil::MockState>>,
    ) {
        let recipe = Recipe::from_parts(
            vec![
                synthetic_device("/dev/sda", 80_000, 512, None),
                synthetic_device("/dev/sdb", 80_000, 512, None),
            ],
            vec![
                flagged_request(
                    "esp",
                    1_024_000,
                    1_024_000,
                    0,
                    PartitionKind::Normal,
                    &[PartitionFlag::Esp],
                ),
                flagged_request(
                    "gap",
                    512_000,
                    512_000,
                    0,
                    PartitionKind::Freespace,
                    &[],
                ),
                request("data", 10_000_000, 80_000_000, 10),
            ],
            PartitionTableType::Gpt,
            false,
        )
        .unwrap();

        let (table_a, state_a) = MockTable::new("/dev/sda");
        let (table_b, state_b) = MockTable::new("/dev/sdb");
        let partitioner = Partitioner::with_adapters(
            recipe,
            vec![Box::new(table_a), Box::new(table_b)],
        );
        (partitioner, state_a, state_b)
    }

    #[test]
    fn test_plan_emits_identical_geometry_on_every_device() {
        let (mut partitioner, state_a, state_b) = mock_partitioner();
        partitioner.plan().unwrap();

        let added_a = state_a.borrow().added.clone();
        let added_b = state_b.borrow().added.clone();
        assert_eq!(added_a.len(), 2, "the freespace request stages nothing");
        assert_eq!(added_b.len(), 2);

        for (a, b) in added_a.iter().zip(added_b.iter()) {
            assert_eq!(a.start, b.start);
            assert_eq!(a.length, b.length);
            assert_eq!(a.handle, b.handle);
        }

        // The first partition starts at the base offset; the next staged
        // entry sits past the freespace gap.
        assert_eq!(added_a[0].start, 2048);
        assert_eq!(added_a[0].length, 1_024_000 / 512);
        assert_eq!(added_a[1].start, 2048 + 2000 + 1000);

        // Handles resolve across devices; the gap is not addressable.
        let esp = Handle::new("esp").unwrap();
        assert_eq!(partitioner.partitions_by_handle(&esp).len(), 2);
        let gap = Handle::new("gap").unwrap();
        assert!(partitioner.partitions_by_handle(&gap).is_empty());

        // Node naming follows the kernel convention.
        assert_eq!(added_a[0].node, PathBuf::from("/dev/sda1"));
        assert_eq!(added_a[1].node, PathBuf::from("/dev/sda2"));
    }

    #[test]
    fn test_commit_ordering_is_enforced() {
        let (mut partitioner, _, _) = mock_partitioner();
        partitioner.commit_to_devices().unwrap_err();

        partitioner.plan().unwrap();
        partitioner.commit_to_os().unwrap_err();

        partitioner.commit_to_devices().unwrap();
        partitioner.commit_to_os().unwrap();
        assert!(partitioner.is_planned());
        assert!(partitioner.is_saved_to_disk());
        assert!(partitioner.is_notified_to_os());
    }

    #[test]
    fn test_commits_are_idempotent() {
        let (mut partitioner, state_a, _) = mock_partitioner();
        partitioner.plan().unwrap();
        partitioner.plan().unwrap();
        partitioner.commit().unwrap();
        partitioner.commit().unwrap();
        partitioner.commit_to_devices().unwrap();

        let state = state_a.borrow();
        assert_eq!(state.added.len(), 2, "replanning must not duplicate");
        assert_eq!(state.device_commits, 1);
        assert_eq!(state.os_commits, 1);
    }

    #[test]
    fn test_commit_failure_is_fatal_and_sticky() {
        let (mut partitioner, state_a, state_b) = mock_partitioner();
        partitioner.plan().unwrap();

        state_a.borrow_mut().fail_device_commit = true;
        partitioner.commit().unwrap_err();
        assert!(!partitioner.is_saved_to_disk());
        assert!(!partitioner.is_notified_to_os());
        assert_eq!(state_b.borrow().device_commits, 0, "first failure aborts");
    }

    #[test]
    fn test_partition_set_aggregates() {
        let (one, _, _) = mock_partitioner();
        let (two, _, _) = mock_partitioner();
        let mut set = PartitionSet::new(vec![one, two]);

        assert!(!set.is_committed());
        set.plan().unwrap();
        set.commit().unwrap();
        assert!(set.is_planned());
        assert!(set.is_committed());

        let data = Handle::new("data").unwrap();
        assert_eq!(set.partitions_by_handle(&data).len(), 4);

        let report = set.partitions_report();
        assert_eq!(report.get("data").map(Vec::len), Some(4));
        assert_eq!(set.reports().len(), 4);
    }
}
