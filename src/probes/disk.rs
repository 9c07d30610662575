use crate::error::ProbeError;
use crate::snapshot::{DiskUsage, Domain};
use std::collections::BTreeMap;
use sysinfo::{DiskExt, System, SystemExt};
use tracing::debug;

const FIXED_DEVICE_PREFIXES: [&str; 7] = [
    "/dev/sd",
    "/dev/nvme",
    "/dev/hd",
    "/dev/vd",
    "/dev/xvd",
    "/dev/mmcblk",
    "/dev/mapper/",
];

const EXCLUDED_DEVICE_PREFIXES: [&str; 3] = ["/dev/loop", "/dev/ram", "/dev/zram"];

const VIRTUAL_OR_NETWORK_FS: [&str; 18] = [
    "tmpfs",
    "devtmpfs",
    "devfs",
    "nullfs",
    "overlay",
    "squashfs",
    "proc",
    "sysfs",
    "cgroup",
    "cgroup2",
    "autofs",
    "nfs",
    "nfs4",
    "cifs",
    "smbfs",
    "smb3",
    "sshfs",
    "9p",
];

/// Device naming scheme the fixed-storage filter applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Linux,
    MacOs,
    Windows,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Self::Windows
        } else if cfg!(target_os = "macos") {
            Self::MacOs
        } else {
            Self::Linux
        }
    }
}

/// A mounted partition as reported by the OS, before filtering.
#[derive(Debug, Clone)]
pub struct PartitionInfo {
    pub device: String,
    pub mount: String,
    pub fs_type: String,
    pub removable: bool,
    pub total: u64,
    pub available: u64,
}

pub struct DiskProbe {
    system: System,
}

impl DiskProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_disks_list();
        Self { system }
    }

    pub fn read(&mut self) -> Result<BTreeMap<String, DiskUsage>, ProbeError> {
        self.system.refresh_disks();
        let partitions: Vec<PartitionInfo> = self
            .system
            .disks()
            .iter()
            .map(|d| PartitionInfo {
                device: d.name().to_string_lossy().to_string(),
                mount: d.mount_point().to_string_lossy().to_string(),
                fs_type: String::from_utf8_lossy(d.file_system()).to_string(),
                removable: d.is_removable(),
                total: d.total_space(),
                available: d.available_space(),
            })
            .collect();

        if partitions.is_empty() {
            return Err(ProbeError::unavailable(Domain::Disk, "no partitions reported"));
        }

        let usage = fixed_disk_usage(&partitions);
        debug!(
            partitions = partitions.len(),
            fixed = usage.len(),
            "disk partitions filtered"
        );
        Ok(usage)
    }
}

impl Default for DiskProbe {
    fn default() -> Self {
        Self::new()
    }
}

/// Usage of every fixed partition, keyed by its raw mount path.
pub fn fixed_disk_usage(partitions: &[PartitionInfo]) -> BTreeMap<String, DiskUsage> {
    fixed_disk_usage_on(Platform::current(), partitions)
}

pub fn fixed_disk_usage_on(
    platform: Platform,
    partitions: &[PartitionInfo],
) -> BTreeMap<String, DiskUsage> {
    partitions
        .iter()
        .filter(|p| is_fixed_storage_on(platform, p))
        .filter(|p| p.total > 0)
        .map(|p| {
            (
                p.mount.clone(),
                DiskUsage::from_total_and_free(p.total, p.available.min(p.total)),
            )
        })
        .collect()
}

pub fn is_fixed_storage(p: &PartitionInfo) -> bool {
    is_fixed_storage_on(Platform::current(), p)
}

pub fn is_fixed_storage_on(platform: Platform, p: &PartitionInfo) -> bool {
    let fs_type = p.fs_type.to_ascii_lowercase();
    if fs_type.starts_with("fuse") || VIRTUAL_OR_NETWORK_FS.contains(&fs_type.as_str()) {
        return false;
    }
    if p.removable {
        return false;
    }
    match platform {
        Platform::Linux => {
            !EXCLUDED_DEVICE_PREFIXES.iter().any(|pre| p.device.starts_with(pre))
                && FIXED_DEVICE_PREFIXES.iter().any(|pre| p.device.starts_with(pre))
        }
        // APFS/HFS volumes all live on /dev/diskN[sM]; disk images are flagged removable.
        Platform::MacOs => p.device.starts_with("/dev/disk"),
        // Network shares surface as UNC paths; everything else left after the removable check is local.
        Platform::Windows => !p.device.starts_with(r"\\"),
    }
}
