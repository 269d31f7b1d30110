use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Error};
use log::debug;

use crate::exe::{self, RunAndCheck};

/// The kernel's block device registry.
pub const SYS_BLOCK_PATH: &str = "/sys/class/block";

/// Lists the names registered under `/sys/class/block` (whole disks and
/// partitions alike).
pub fn device_names() -> Result<Vec<String>, Error> {
    names_in(Path::new(SYS_BLOCK_PATH))
}

fn names_in(registry: &Path) -> Result<Vec<String>, Error> {
    let entries = fs::read_dir(registry)
        .with_context(|| format!("Failed to list '{}'", registry.display()))?;

    Ok(entries
        .flatten()
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect())
}

/// Reads the registry link for entry `name`, which points into the kernel's
/// device tree.
pub fn registry_link(name: &str) -> Result<PathBuf, Error> {
    let link_path = Path::new(SYS_BLOCK_PATH).join(name);
    fs::read_link(&link_path)
        .with_context(|| format!("Failed to read registry link '{}'", link_path.display()))
}

/// Resolves the whole-disk entry backing the registry entry `name`.
///
/// The registry links every entry into the device tree, where the component
/// after `block` names the partitionable disk: a partition such as `sda1`
/// resolves to `sda`, a whole disk resolves to itself.
pub fn whole_disk_of(name: &str) -> Result<String, Error> {
    let target = registry_link(name)?;

    debug!("Registry entry '{name}' links to '{}'", target.display());

    whole_disk_from_link(&target.to_string_lossy()).with_context(|| {
        format!(
            "Registry link for '{name}' does not name a partitionable device: '{}'",
            target.display()
        )
    })
}

/// Extracts the path component following `block` from a registry link
/// target.
pub fn whole_disk_from_link(target: &str) -> Option<String> {
    let mut components = target.split('/');
    while let Some(component) = components.next() {
        if component == "block" {
            return components.next().map(str::to_string);
        }
    }
    None
}

/// Builds the kernel node path of partition `number` on `device`. Devices
/// whose name ends in a digit take a `p` infix (`/dev/loop0p1`,
/// `/dev/nvme0n1p2`); others concatenate directly (`/dev/sda1`).
pub fn partition_node_path(device: &Path, number: u64) -> PathBuf {
    let name = device.to_string_lossy();
    if name.ends_with(|c: char| c.is_ascii_digit()) {
        PathBuf::from(format!("{name}p{number}"))
    } else {
        PathBuf::from(format!("{name}{number}"))
    }
}

/// Forces the kernel to re-read the partition table of `device`.
///
/// The device must carry a table with at least one partition, otherwise
/// partx reports an error.
pub fn partx_update(device: impl AsRef<Path>) -> Result<(), Error> {
    exe::privileged("partx")
        .arg("--update")
        .arg(device.as_ref())
        .run_and_check()
        .with_context(|| {
            format!(
                "Failed to re-read partition table of '{}'",
                device.as_ref().display()
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whole_disk_from_link() {
        assert_eq!(
            whole_disk_from_link(
                "../../devices/pci0000:00/0000:00:1f.2/ata1/host0/target0:0:0/0:0:0:0/block/sda/sda1"
            ),
            Some("sda".to_string())
        );
        assert_eq!(
            whole_disk_from_link(
                "../../devices/pci0000:00/0000:00:1f.2/ata1/host0/target0:0:0/0:0:0:0/block/sda"
            ),
            Some("sda".to_string())
        );
        assert_eq!(
            whole_disk_from_link("../../devices/virtual/block/loop100"),
            Some("loop100".to_string())
        );
        assert_eq!(
            whole_disk_from_link("../../devices/virtual/block/loop100/loop100p1"),
            Some("loop100".to_string())
        );
        assert_eq!(whole_disk_from_link("../../devices/virtual/mem/null"), None);
    }

    #[test]
    fn test_names_in() {
        let registry = tempfile::tempdir().unwrap();
        fs::File::create(registry.path().join("sda")).unwrap();
        fs::File::create(registry.path().join("sda1")).unwrap();

        let mut names = names_in(registry.path()).unwrap();
        names.sort();
        assert_eq!(names, vec!["sda".to_string(), "sda1".to_string()]);

        names_in(&registry.path().join("missing")).unwrap_err();
    }

    #[test]
    fn test_partition_node_path() {
        assert_eq!(
            partition_node_path(Path::new("/dev/sda"), 1),
            PathBuf::from("/dev/sda1")
        );
        assert_eq!(
            partition_node_path(Path::new("/dev/loop100"), 2),
            PathBuf::from("/dev/loop100p2")
        );
        assert_eq!(
            partition_node_path(Path::new("/dev/nvme0n1"), 3),
            PathBuf::from("/dev/nvme0n1p3")
        );
    }
}
