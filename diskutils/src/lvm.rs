use std::path::Path;

use anyhow::{bail, ensure, Context, Error};
use log::{debug, info};

use recipe_api::error::VolumeError;

use crate::exe::{self, OutputChecker, RunAndCheck};

/// Checks whether `device` is already initialised as an LVM physical
/// volume. A non-zero `pvs` exit is the tool's way of saying "no".
pub fn pv_exists(device: impl AsRef<Path>) -> Result<bool, Error> {
    let output = exe::privileged("pvs")
        .arg(device.as_ref())
        .capture()
        .context("Failed to run pvs")?;
    Ok(output.is_success())
}

pub fn pv_create(device: impl AsRef<Path>) -> Result<(), Error> {
    info!(
        "Initialising physical volume on '{}'",
        device.as_ref().display()
    );

    exe::privileged("pvcreate")
        .arg("-f")
        .arg(device.as_ref())
        .run_and_check()
        .context("Failed to run pvcreate")
}

/// Returns the volume group `device` belongs to, or `None` when the
/// physical volume is unattached.
pub fn pv_volume_group(device: impl AsRef<Path>) -> Result<Option<String>, Error> {
    let output = exe::privileged("pvdisplay")
        .arg("-c")
        .arg(device.as_ref())
        .output_and_check()
        .context("Failed to run pvdisplay")?;

    parse_pv_volume_group(&output).with_context(|| {
        format!(
            "Failed to parse pvdisplay output for '{}'",
            device.as_ref().display()
        )
    })
}

/// Creates volume group `name` over `devices`.
pub fn vg_create(name: &str, devices: &[impl AsRef<Path>]) -> Result<(), Error> {
    info!("Creating volume group '{name}'");

    let mut command = exe::privileged("vgcreate");
    command.arg(name);
    for device in devices {
        command.arg(device.as_ref());
    }

    let output = command.capture().context("Failed to run vgcreate")?;
    if !output.is_success() {
        bail!(VolumeError::VgCreateFailed {
            vg: name.to_string(),
            stderr: flatten(&output.error_output()),
        });
    }

    Ok(())
}

/// Free space of a volume group as a percentage of its total extents.
pub fn vg_free_percent(group: impl AsRef<Path>) -> Result<f64, Error> {
    let output = exe::privileged("vgdisplay")
        .arg("-c")
        .arg(group.as_ref())
        .output_and_check()
        .context("Failed to run vgdisplay")?;

    let (free, total) = parse_vg_extents(&output).with_context(|| {
        format!(
            "Failed to parse vgdisplay output for '{}'",
            group.as_ref().display()
        )
    })?;

    debug!(
        "Volume group '{}' has {free} of {total} extents free",
        group.as_ref().display()
    );

    Ok(free as f64 / total as f64 * 100.0)
}

/// Creates logical volume `name` spanning `percent` of volume group
/// `group`. The percentage is rounded to the whole number `lvcreate`
/// accepts.
pub fn lv_create(name: &str, group: impl AsRef<Path>, percent: f64) -> Result<(), Error> {
    info!(
        "Creating logical volume '{name}' on '{}' ({percent:.0}% of the group)",
        group.as_ref().display()
    );

    let output = exe::privileged("lvcreate")
        .arg("-l")
        .arg(format!("{}%VG", percent.round() as u64))
        .arg("-n")
        .arg(name)
        .arg(group.as_ref())
        .capture()
        .context("Failed to run lvcreate")?;

    if !output.is_success() {
        bail!(VolumeError::LvCreateFailed {
            lv: name.to_string(),
            stderr: flatten(&output.error_output()),
        });
    }

    Ok(())
}

pub fn lv_remove(volume: impl AsRef<Path>) -> Result<(), Error> {
    exe::privileged("lvremove")
        .arg("-f")
        .arg(volume.as_ref())
        .run_and_check()
        .context("Failed to run lvremove")
}

pub fn vg_remove(group: &str) -> Result<(), Error> {
    exe::privileged("vgremove")
        .arg("-f")
        .arg(group)
        .run_and_check()
        .context("Failed to run vgremove")
}

pub fn pv_remove(device: impl AsRef<Path>) -> Result<(), Error> {
    exe::privileged("pvremove")
        .arg("-f")
        .arg(device.as_ref())
        .run_and_check()
        .context("Failed to run pvremove")
}

/// `pvdisplay -c` prints one colon-separated record per physical volume:
/// device, volume group, size, internal number, status, ... The volume
/// group field is empty for an unattached volume.
fn parse_pv_volume_group(output: &str) -> Result<Option<String>, Error> {
    let record = output
        .trim()
        .lines()
        .last()
        .context("pvdisplay printed nothing")?
        .trim();

    let fields: Vec<&str> = record.split(':').collect();
    ensure!(
        fields.len() > 2,
        "unexpected pvdisplay record: '{record}'"
    );

    let group = fields[1].trim();
    Ok((!group.is_empty()).then(|| group.to_string()))
}

/// `vgdisplay -c` prints one colon-separated record: name, access, status,
/// ..., total extents, allocated extents, free extents, uuid. Counted from
/// the end: free is the second-to-last numeric field, total the fourth.
fn parse_vg_extents(output: &str) -> Result<(u64, u64), Error> {
    let record = output
        .trim()
        .lines()
        .last()
        .context("vgdisplay printed nothing")?
        .trim();

    let fields: Vec<&str> = record.split(':').collect();
    ensure!(
        fields.len() >= 5,
        "unexpected vgdisplay record: '{record}'"
    );

    let numeric = |index_from_end: usize| -> Result<u64, Error> {
        let field = fields[fields.len() - index_from_end];
        field
            .trim()
            .parse()
            .with_context(|| format!("field '{field}' of '{record}' is not a count"))
    };

    let free = numeric(2)?;
    let total = numeric(4)?;
    ensure!(total > 0, "volume group reports zero extents");

    Ok((free, total))
}

fn flatten(stderr: &str) -> String {
    stderr.trim().replace('\n', " -> ")
}
