//! One-shot orchestration: everything a recipe document describes, applied
//! in order.

use anyhow::{Context, Error};
use log::info;

use recipe_api::config::RecipeConfig;

use crate::{
    partitioner::{PartitionSet, Partitioner},
    recipe::Recipe,
    report::RunReport,
    volume::VolumeRegistry,
};

/// Applies `config` to the host: introspect the devices, plan and write the
/// partition tables, announce them to the kernel, then build the volumes in
/// document order. Returns the run report.
pub fn apply(config: &RecipeConfig) -> Result<RunReport, Error> {
    config.validate().context("Invalid recipe document")?;

    let recipe = Recipe::compile(config).context("Failed to compile the recipe")?;
    let partitioner =
        Partitioner::new(recipe).context("Failed to open the partition tables")?;
    let mut partitions = PartitionSet::new(vec![partitioner]);

    partitions.plan().context("Failed to plan the partitions")?;
    partitions
        .commit()
        .context("Failed to commit the partitions")?;

    let mut volumes = VolumeRegistry::from_configs(&config.volumes)?;
    volumes
        .build(&partitions)
        .context("Failed to build the volumes")?;

    info!(
        "Recipe applied: {} device(s), {} volume(s)",
        config.devices.len(),
        volumes.len()
    );

    Ok(RunReport {
        devices: partitions.reports(),
        partitions: partitions.partitions_report(),
        volumes: volumes.device_map(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_rejects_invalid_documents() {
        let config = RecipeConfig::from_yaml(indoc::indoc! {r#"
            devices: [/dev/definitely-absent-93]
            partitions:
              - handle: data
                minSize: 1MiB
                maxSize: 2MiB
                weight: 1
            volumes:
              - kind: lvm-lv
                handle: lv
                group: ghost
                percent: 10
        "#})
        .unwrap();

        // Validation fails before any device is touched.
        let err = apply(&config).unwrap_err();
        assert_eq!(format!("{err}"), "Invalid recipe document");
    }

    #[test]
    fn test_apply_requires_real_devices() {
        let config = RecipeConfig::from_yaml(indoc::indoc! {r#"
            devices: [/dev/definitely-absent-93]
            partitions:
              - handle: data
                minSize: 1MiB
                maxSize: 2MiB
                weight: 1
        "#})
        .unwrap();

        let err = apply(&config).unwrap_err();
        assert_eq!(format!("{err}"), "Failed to compile the recipe");
    }
}
