use std::{
    path::{Path, PathBuf},
    process::Command,
};

use anyhow::{bail, Context, Error};
use log::info;

use recipe_api::{
    config::{RaidLevel, RaidMetadata},
    error::VolumeError,
};

use crate::exe::{self, OutputChecker, RunAndCheck};

/// Creates a software RAID array from `members`, with optional hot
/// `spares`.
///
/// The 1.x superblock formats make mdadm ask whether the array should
/// really be created (the metadata lives where a boot sector could be); the
/// prompt is answered affirmatively through stdin. Older formats get no
/// input at all.
pub fn create(
    array_path: &Path,
    level: RaidLevel,
    members: &[PathBuf],
    spares: &[PathBuf],
    metadata: RaidMetadata,
) -> Result<(), Error> {
    info!(
        "Creating RAID array '{}' ({level}, {} members, {} spares)",
        array_path.display(),
        members.len(),
        spares.len()
    );

    let mut command = create_command(array_path, level, members, spares, metadata);

    let answer = if metadata.needs_confirmation() { "y\n" } else { "" };
    let output = command
        .capture_with_input(answer)
        .context("Failed to run mdadm create")?;

    if !output.is_success() {
        bail!(VolumeError::RaidCommandFailed {
            exit: output.exit_code().unwrap_or(-1),
            stderr: output.error_output().trim().to_string(),
        });
    }

    Ok(())
}

fn create_command(
    array_path: &Path,
    level: RaidLevel,
    members: &[PathBuf],
    spares: &[PathBuf],
    metadata: RaidMetadata,
) -> Command {
    let mut command = exe::privileged("mdadm");
    command
        .arg("--create")
        .arg(array_path)
        .arg("--force")
        .arg(format!("--level={level}"))
        .arg(format!("--raid-devices={}", members.len()));
    if !spares.is_empty() {
        command.arg(format!("--spare-devices={}", spares.len()));
    }
    command.arg(format!("--metadata={metadata}"));
    command.args(members).args(spares);
    command
}
