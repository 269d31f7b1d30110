//! Typed failure taxonomy shared by the engine and the tool adapters.
//!
//! Transport-level failures (a tool that could not be spawned, an I/O error
//! while probing a device) travel as `anyhow::Error` chains with context;
//! everything a caller may want to match on programmatically is one of the
//! enums below, attached as the source of the chain.

/// A user-supplied literal could not be decoded.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("bad size literal '{value}': {reason}")]
    BadSizeLiteral { value: String, reason: String },

    #[error("bad handle '{value}': handles must match '^[A-Za-z0-9_-]+$'")]
    BadHandle { value: String },
}

/// A device named by a recipe cannot be partitioned.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum DeviceError {
    #[error("device path '{path}' must start with /dev/")]
    BadDevicePath { path: String },

    #[error("device '{path}' not found")]
    DeviceNotFound { path: String },

    #[error("device '{path}' is not a partitionable block device")]
    NotPartitionable { path: String },

    #[error("devices do not share one partition table type: {details}")]
    HeterogeneousTables { details: String },
}

/// The chunk planner could not satisfy a request set.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum AllocError {
    #[error("not enough space: {needed} bytes needed at minimum, {available} available")]
    Insufficient { needed: u64, available: u64 },

    #[error("alignment residue of {excess} bytes exceeds every chunk's maximum")]
    ResidueOverflow { excess: u64 },

    #[error("chunk bounds are invalid: min {min} must satisfy 0 < min <= max ({max})")]
    BadChunkBounds { min: u64, max: u64 },
}

/// A partition request carried a value outside the closed enumerations.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum PartitionError {
    #[error("invalid partition type '{value}'")]
    InvalidPartitionType { value: String },

    #[error("invalid partition flag '{value}'")]
    InvalidPartitionFlag { value: String },
}

/// Volume configuration or construction failed.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum VolumeError {
    #[error("partitions have not been saved to disk and announced to the kernel yet")]
    PreconditionNotCommitted,

    #[error("volume handle '{handle}' is already in use")]
    DuplicateHandle { handle: String },

    #[error("no partition or volume found for handle '{handle}'")]
    HandleNotFound { handle: String },

    #[error("volume '{handle}' is a {found}, expected a {expected}")]
    WrongVolumeKind {
        handle: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("volume '{handle}' has not been built yet")]
    NotBuilt { handle: String },

    #[error("invalid RAID configuration: {reason}")]
    RaidConfigInvalid { reason: String },

    #[error("RAID device '{path}' already exists")]
    RaidDeviceExists { path: String },

    #[error("mdadm exited with status {exit}: {stderr}")]
    RaidCommandFailed { exit: i32, stderr: String },

    #[error("RAID device '{path}' was not created")]
    RaidDeviceMissing { path: String },

    #[error("physical volume '{device}' is already attached to volume group '{vg}'")]
    PvAlreadyInVg { device: String, vg: String },

    #[error("failed to create volume group '{vg}': {stderr}")]
    VgCreateFailed { vg: String, stderr: String },

    #[error("volume group has {available:.2}% free, {requested:.0}% requested")]
    VgInsufficientSpace { requested: f64, available: f64 },

    #[error("failed to create logical volume '{lv}': {stderr}")]
    LvCreateFailed { lv: String, stderr: String },
}
