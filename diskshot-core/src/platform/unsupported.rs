use crate::config::EngineConfig;
use crate::device::BlockDevice;
use tracing::warn;

/// Device enumeration is only implemented for Linux; elsewhere the
/// inventory is always empty.
pub fn list_block_devices(_config: &EngineConfig) -> Vec<BlockDevice> {
    warn!("Block device enumeration is not supported on this platform");
    Vec::new()
}
