use anyhow::{Context, Error};

use crate::exe::{self, RunAndCheck};

pub fn settle() -> Result<(), Error> {
    exe::privileged("udevadm")
        .arg("settle")
        .run_and_check()
        .context("Failed to settle udev")
}

pub fn trigger() -> Result<(), Error> {
    exe::privileged("udevadm")
        .arg("trigger")
        .run_and_check()
        .context("Failed to trigger udev")
}

#[cfg(all(test, feature = "functional-tests"))]
mod functional_tests {
    use super::*;

    #[test]
    fn test_settle_and_trigger() {
        settle().unwrap();
        trigger().unwrap();
    }
}
