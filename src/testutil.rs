//! Shared helpers for the unit tests: synthetic devices, requests and an
//! in-memory table adapter that never touch the host.

use std::{
    cell::RefCell,
    path::{Path, PathBuf},
    rc::Rc,
};

use anyhow::{bail, Error};

use recipe_api::{
    config::{PartitionFlag, PartitionKind, PartitionRequest, PartitionTableType},
    primitives::size::ByteSize,
    Handle,
};

use diskutils::sysblock;

use crate::{
    device::{BlockDevice, DEFAULT_BASE_OFFSET, DEFAULT_FOOTER},
    planner::ChunkSpace,
    report::DeviceReport,
    table::{PartitionSpec, PlannedPartition, TableAdapter},
};

pub(crate) fn synthetic_device(
    path: &str,
    sectors: u64,
    sector_size: u64,
    table_type: Option<PartitionTableType>,
) -> BlockDevice {
    let name = path.trim_start_matches("/dev/").to_string();
    BlockDevice {
        path: path.into(),
        sys_path: format!("../../devices/virtual/block/{name}").into(),
        name,
        model: None,
        addressable: ChunkSpace::new(sectors - DEFAULT_BASE_OFFSET - DEFAULT_FOOTER, sector_size),
        physical_sector_size: sector_size,
        length: sectors,
        base_offset: DEFAULT_BASE_OFFSET,
        footer: DEFAULT_FOOTER,
        table_type,
        keep_partitions: false,
    }
}

pub(crate) fn request(handle: &str, min: u64, max: u64, weight: u64) -> PartitionRequest {
    PartitionRequest {
        handle: Handle::new(handle).unwrap(),
        min_size: ByteSize(min),
        max_size: ByteSize(max),
        weight,
        kind: PartitionKind::Normal,
        flags: vec![],
    }
}

pub(crate) fn flagged_request(
    handle: &str,
    min: u64,
    max: u64,
    weight: u64,
    kind: PartitionKind,
    flags: &[PartitionFlag],
) -> PartitionRequest {
    PartitionRequest {
        flags: flags.to_vec(),
        kind,
        ..request(handle, min, max, weight)
    }
}

/// Observable state of a [`MockTable`], shared with the test body.
#[derive(Debug, Default)]
pub(crate) struct MockState {
    pub added: Vec<PlannedPartition>,
    pub device_commits: u64,
    pub os_commits: u64,
    pub fail_device_commit: bool,
}

/// Records every adapter call instead of touching a disk.
pub(crate) struct MockTable {
    path: PathBuf,
    next_number: u64,
    state: Rc<RefCell<MockState>>,
}

impl MockTable {
    pub fn new(path: &str) -> (Self, Rc<RefCell<MockState>>) {
        let state = Rc::new(RefCell::new(MockState::default()));
        (
            MockTable {
                path: path.into(),
                next_number: 1,
                state: Rc::clone(&state),
            },
            state,
        )
    }
}

impl TableAdapter for MockTable {
    fn device_path(&self) -> &Path {
        &self.path
    }

    fn add_partition(&mut self, spec: PartitionSpec<'_>) -> Result<PlannedPartition, Error> {
        let number = self.next_number;
        self.next_number += 1;

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
        self.state.borrow_mut().added.push(partition.clone());
        Ok(partition)
    }

    fn commit_to_device(&mut self) -> Result<(), Error> {
        if self.state.borrow().fail_device_commit {
            bail!("synthetic commit failure");
        }
        self.state.borrow_mut().device_commits += 1;
        Ok(())
    }

    fn commit_to_os(&mut self) -> Result<(), Error> {
        self.state.borrow_mut().os_commits += 1;
        Ok(())
    }

    fn describe(&self) -> DeviceReport {
        DeviceReport {
            table_type: "gpt".to_string(),
            model: String::new(),
            path: self.path.clone(),
            physical_sector_size: 512,
            sector_size: 512,
            length: 0,
            partitions_before: vec![],
            partitions_after: self.state.borrow().added.iter().map(Into::into).collect(),
        }
    }
}
