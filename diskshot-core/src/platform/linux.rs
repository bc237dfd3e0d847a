use crate::config::EngineConfig;
use crate::device::BlockDevice;
use crate::inventory::{UsageQuery, parse_listing};
use std::path::Path;
use std::process::Command;
use tracing::{debug, warn};

/// Columns requested from the listing tool.
const LISTING_COLUMNS: &str = "NAME,SIZE,MODEL,FSTYPE,MOUNTPOINT,LABEL";

/// Filesystem usage backed by `sysinfo`'s view of mounted disks.
pub struct MountedDisks {
    disks: sysinfo::Disks,
}

impl MountedDisks {
    pub fn refreshed() -> Self {
        Self {
            disks: sysinfo::Disks::new_with_refreshed_list(),
        }
    }
}

impl UsageQuery for MountedDisks {
    fn usage(&self, mount_point: &Path) -> Option<(u64, u64)> {
        let disk = self
            .disks
            .iter()
            .find(|disk| disk.mount_point() == mount_point)?;
        let free = disk.available_space();
        Some((disk.total_space().saturating_sub(free), free))
    }
}

/// Enumerates disks, NVMe namespaces and MMC cards with their partitions.
///
/// The listing tool runs unprivileged. If it is missing, exits abnormally or
/// prints something that is not a listing, the failure is logged and the
/// inventory is empty; the caller can retry or pick a device manually.
pub fn list_block_devices(config: &EngineConfig) -> Vec<BlockDevice> {
    let output = match Command::new(&config.lister_tool)
        .args(["-J", "-o", LISTING_COLUMNS])
        .output()
    {
        Ok(output) => output,
        Err(e) => {
            warn!(tool = %config.lister_tool, error = %e, "Error getting drive information");
            return Vec::new();
        }
    };

    if !output.status.success() {
        warn!(
            tool = %config.lister_tool,
            status = %output.status,
            stderr = %String::from_utf8_lossy(&output.stderr).trim(),
            "Device listing failed"
        );
        return Vec::new();
    }

    let usage = MountedDisks::refreshed();
    match parse_listing(&String::from_utf8_lossy(&output.stdout), &usage) {
        Ok(devices) => {
            debug!(count = devices.len(), "Enumerated block devices");
            devices
        }
        Err(e) => {
            warn!(error = %e, "Device listing was not valid JSON");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_lister_yields_empty_inventory() {
        let config = EngineConfig {
            lister_tool: "/nonexistent/diskshot-lsblk".to_string(),
            ..Default::default()
        };
        assert!(list_block_devices(&config).is_empty());
    }

    #[test]
    fn failing_lister_yields_empty_inventory() {
        let config = EngineConfig {
            lister_tool: "false".to_string(),
            ..Default::default()
        };
        assert!(list_block_devices(&config).is_empty());
    }

    #[test]
    fn root_filesystem_usage_is_reported() {
        let disks = MountedDisks::refreshed();
        if let Some((used, free)) = disks.usage(Path::new("/")) {
            assert!(used > 0 || free > 0);
        }
    }
}
