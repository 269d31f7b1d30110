//! Thin adapters over the host tools the volume composer drives: `lsblk`,
//! `sfdisk`, `mdadm`, the LVM suite, `partx` and `udevadm`.
//!
//! Each module wraps exactly one tool, captures its output, and keeps any
//! output parsing in pure functions so it can be covered with fixtures.

pub mod exe;
pub mod lsblk;
pub mod lvm;
pub mod mdadm;
pub mod sfdisk;
pub mod sysblock;
pub mod udevadm;
