//! Turns a hierarchical JSON device listing into [`BlockDevice`]s.
//!
//! The listing has the shape produced by `lsblk -J -o
//! NAME,SIZE,MODEL,FSTYPE,MOUNTPOINT,LABEL`: a `blockdevices` array whose
//! entries may carry a `children` array of partitions. Parsing is
//! best-effort; a partition that cannot be interpreted is skipped without
//! affecting its siblings.
use crate::device::{BlockDevice, DeviceKind, Partition};
use crate::size::parse_size;
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Per-mountpoint filesystem usage.
pub trait UsageQuery {
    /// Returns `(used, free)` bytes for the filesystem mounted at `mount_point`.
    fn usage(&self, mount_point: &Path) -> Option<(u64, u64)>;
}

#[derive(Deserialize)]
struct Listing {
    #[serde(default)]
    blockdevices: Vec<Value>,
}

/// Newer listing tools emit sizes as numbers when asked for bytes; older
/// ones always emit the human-readable form.
#[derive(Deserialize)]
#[serde(untagged)]
enum SizeField {
    Bytes(u64),
    Text(String),
}

impl SizeField {
    fn bytes(&self) -> u64 {
        match self {
            SizeField::Bytes(b) => *b,
            SizeField::Text(s) => parse_size(s),
        }
    }
}

#[derive(Deserialize)]
struct Entry {
    name: String,
    size: Option<SizeField>,
    model: Option<String>,
    fstype: Option<String>,
    mountpoint: Option<String>,
    label: Option<String>,
    #[serde(default)]
    children: Vec<Value>,
}

/// Parses a complete listing. A listing that is not valid JSON yields an
/// error; everything below the top level degrades instead.
pub fn parse_listing(json: &str, usage: &dyn UsageQuery) -> serde_json::Result<Vec<BlockDevice>> {
    let listing: Listing = serde_json::from_str(json)?;
    let mut devices = Vec::new();

    for raw in listing.blockdevices {
        let entry: Entry = match serde_json::from_value(raw) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "Skipping unreadable device record");
                continue;
            }
        };
        let Some(kind) = DeviceKind::from_name(&entry.name) else {
            debug!(name = %entry.name, "Ignoring unsupported device kind");
            continue;
        };

        let partitions = entry
            .children
            .into_iter()
            .filter_map(|child| parse_partition(child, usage))
            .collect();

        devices.push(BlockDevice {
            path: dev_path(&entry.name),
            kind,
            model: entry
                .model
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| "Unknown".to_string()),
            size: entry.size.as_ref().map_or(0, SizeField::bytes),
            partitions,
        });
    }

    Ok(devices)
}

fn parse_partition(raw: Value, usage: &dyn UsageQuery) -> Option<Partition> {
    let entry: Entry = match serde_json::from_value(raw) {
        Ok(entry) => entry,
        Err(e) => {
            warn!(error = %e, "Error parsing partition, skipping it");
            return None;
        }
    };

    let size = entry.size.as_ref().map_or(0, SizeField::bytes);
    let mount_point = entry.mountpoint.unwrap_or_default();
    let (mut used, mut free) = (0, 0);
    if !mount_point.is_empty() {
        match usage.usage(Path::new(&mount_point)) {
            Some((u, f)) => {
                used = u.min(size);
                free = f.min(size - used);
            }
            None => warn!(mount_point = %mount_point, "Usage query failed; reporting zero usage"),
        }
    }

    Some(Partition {
        path: dev_path(&entry.name),
        mount_point,
        fstype: entry.fstype.unwrap_or_default(),
        label: entry.label.unwrap_or_default(),
        size,
        used,
        free,
    })
}

fn dev_path(name: &str) -> PathBuf {
    PathBuf::from("/dev/").join(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const GIB: u64 = 1024 * 1024 * 1024;

    struct FakeUsage(HashMap<PathBuf, (u64, u64)>);

    impl UsageQuery for FakeUsage {
        fn usage(&self, mount_point: &Path) -> Option<(u64, u64)> {
            self.0.get(mount_point).copied()
        }
    }

    fn usage() -> FakeUsage {
        FakeUsage(HashMap::from([(PathBuf::from("/"), (10 * GIB, 20 * GIB))]))
    }

    const LISTING: &str = r#"{
        "blockdevices": [
            {"name": "loop0", "size": "63,3M", "model": null, "fstype": "squashfs", "mountpoint": "/snap/core", "label": null},
            {"name": "nvme0n1", "size": "476,9G", "model": "Samsung SSD 980  ", "fstype": null, "mountpoint": null, "label": null,
             "children": [
                {"name": "nvme0n1p1", "size": "512M", "model": null, "fstype": "vfat", "mountpoint": "/boot/efi", "label": "EFI"},
                {"name": "nvme0n1p2", "size": "476,4G", "model": null, "fstype": "ext4", "mountpoint": "/", "label": null},
                {"size": "1G"}
             ]},
            {"name": "sda", "size": 8053063680, "model": "Cruzer", "fstype": null, "mountpoint": null, "label": null,
             "children": [
                {"name": "sda1", "size": 8052015104, "model": null, "fstype": "exfat", "mountpoint": null, "label": "USB"}
             ]},
            {"name": "sr0", "size": "1024M", "model": "DVD", "fstype": null, "mountpoint": null, "label": null}
        ]
    }"#;

    #[test]
    fn keeps_only_recognised_device_kinds() {
        let devices = parse_listing(LISTING, &usage()).unwrap();
        let paths: Vec<_> = devices.iter().map(|d| d.path.clone()).collect();
        assert_eq!(paths, vec![PathBuf::from("/dev/nvme0n1"), PathBuf::from("/dev/sda")]);
    }

    #[test]
    fn parses_fields_and_sizes() {
        let devices = parse_listing(LISTING, &usage()).unwrap();
        let nvme = &devices[0];
        assert_eq!(nvme.kind, DeviceKind::Nvme);
        assert_eq!(nvme.model, "Samsung SSD 980");
        assert_eq!(nvme.size, (476.9 * GIB as f64) as u64);

        let efi = &nvme.partitions[0];
        assert_eq!(efi.path, PathBuf::from("/dev/nvme0n1p1"));
        assert_eq!(efi.fstype, "vfat");
        assert_eq!(efi.label, "EFI");
        assert_eq!(efi.size, 512 * 1024 * 1024);

        let usb = &devices[1];
        assert_eq!(usb.size, 8053063680);
        assert_eq!(usb.partitions[0].label, "USB");
        assert!(!usb.partitions[0].is_mounted());
    }

    #[test]
    fn broken_partition_is_skipped_siblings_kept() {
        let devices = parse_listing(LISTING, &usage()).unwrap();
        assert_eq!(devices[0].partitions.len(), 2);
    }

    #[test]
    fn mounted_partitions_get_usage_others_zero() {
        let devices = parse_listing(LISTING, &usage()).unwrap();
        let root = &devices[0].partitions[1];
        assert_eq!((root.used, root.free), (10 * GIB, 20 * GIB));

        // The usage query has no entry for /boot/efi.
        let efi = &devices[0].partitions[0];
        assert_eq!((efi.used, efi.free), (0, 0));

        let usb = &devices[1].partitions[0];
        assert_eq!((usb.used, usb.free), (0, 0));
    }

    #[test]
    fn usage_is_clamped_to_partition_size() {
        let json = r#"{"blockdevices": [{"name": "sdb", "size": "2G", "children": [
            {"name": "sdb1", "size": "1G", "mountpoint": "/"}
        ]}]}"#;
        let devices = parse_listing(json, &usage()).unwrap();
        let p = &devices[0].partitions[0];
        assert!(p.used + p.free <= p.size);
        assert_eq!(p.used, GIB);
        assert_eq!(p.free, 0);
    }

    #[test]
    fn missing_model_is_unknown() {
        let json = r#"{"blockdevices": [{"name": "mmcblk0", "size": "29,7G"}]}"#;
        let devices = parse_listing(json, &usage()).unwrap();
        assert_eq!(devices[0].model, "Unknown");
        assert!(devices[0].partitions.is_empty());
    }

    #[test]
    fn malformed_listing_is_an_error() {
        assert!(parse_listing("not json", &usage()).is_err());
    }
}
