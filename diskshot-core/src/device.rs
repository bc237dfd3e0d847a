use crate::size::{pretty_size, to_gb};
use std::fmt;
use std::path::{Path, PathBuf};

/// Kinds of block device the inventory reports. Anything else (loop, ram,
/// optical, device-mapper) is left out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceKind {
    /// Conventional SCSI/SATA/USB disk (`sdX`).
    Disk,
    /// NVMe namespace (`nvmeXnY`).
    Nvme,
    /// MMC/SD card (`mmcblkX`).
    Mmc,
}

impl DeviceKind {
    /// Classifies a kernel device name such as `sda` or `nvme0n1`.
    pub fn from_name(name: &str) -> Option<Self> {
        if name.starts_with("sd") {
            Some(Self::Disk)
        } else if name.starts_with("nvme") {
            Some(Self::Nvme)
        } else if name.starts_with("mmcblk") {
            Some(Self::Mmc)
        } else {
            None
        }
    }
}

/// A partition of a [`BlockDevice`] as seen at enumeration time.
///
/// `used` and `free` are only known for mounted partitions; they are zero
/// otherwise, and `used + free` never exceeds `size`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Partition {
    /// The system path of the partition (e.g., `/dev/sda1`).
    pub path: PathBuf,
    /// Where the partition is mounted, or empty.
    pub mount_point: String,
    pub fstype: String,
    pub label: String,
    pub size: u64,
    pub used: u64,
    pub free: u64,
}

impl Partition {
    pub fn is_mounted(&self) -> bool {
        !self.mount_point.is_empty()
    }

    pub fn size_gb(&self) -> f64 {
        to_gb(self.size)
    }

    pub fn used_gb(&self) -> f64 {
        to_gb(self.used)
    }

    pub fn usage_percent(&self) -> f64 {
        if self.size == 0 {
            return 0.0;
        }
        self.used as f64 / self.size as f64 * 100.0
    }

    pub fn pretty_size(&self) -> String {
        pretty_size(self.size)
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<15} {:<6} {:>9}", self.path.display(), self.fstype, self.pretty_size())?;
        if !self.label.is_empty() {
            write!(f, " {}", self.label)?;
        }
        if self.is_mounted() {
            write!(f, " [Mounted at {}, {:.0}% used]", self.mount_point, self.usage_percent())
        } else {
            write!(f, " [Not mounted]")
        }
    }
}

/// Represents a block device discovered on the system, together with its
/// partitions in listing order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockDevice {
    /// The system path to the device (e.g., `/dev/sda`).
    pub path: PathBuf,
    pub kind: DeviceKind,
    pub model: String,
    /// The total size of the device in bytes.
    pub size: u64,
    pub partitions: Vec<Partition>,
}

impl BlockDevice {
    pub fn size_gb(&self) -> f64 {
        to_gb(self.size)
    }

    pub fn partition(&self, path: &Path) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.path == path)
    }
}

impl fmt::Display for BlockDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<15} {} ({:.1} GB)",
            self.path.display(),
            self.model,
            self.size_gb()
        )
    }
}

/// Single-selection model over the partitions of one device.
///
/// Selecting a partition deselects whichever one was selected before, and
/// selecting the current partition again clears the selection, so at most
/// one partition is ever selected.
#[derive(Clone, Debug, Default)]
pub struct PartitionSelection {
    selected: Option<PathBuf>,
}

impl PartitionSelection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggles `partition`. Returns `true` if it is selected afterwards.
    pub fn toggle(&mut self, partition: &Partition) -> bool {
        if self.selected.as_deref() == Some(partition.path.as_path()) {
            self.selected = None;
            false
        } else {
            self.selected = Some(partition.path.clone());
            true
        }
    }

    pub fn clear(&mut self) {
        self.selected = None;
    }

    pub fn is_selected(&self, partition: &Partition) -> bool {
        self.selected.as_deref() == Some(partition.path.as_path())
    }

    /// The selected partition, looked up in `device`.
    pub fn selected<'a>(&self, device: &'a BlockDevice) -> Option<&'a Partition> {
        device.partition(self.selected.as_deref()?)
    }
}
