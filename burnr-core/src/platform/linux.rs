use crate::collaborators::{DeviceCatalog, DeviceEjector, DevicePreparer};
use crate::device::Device;
use anyhow::{Context, Result, anyhow, bail};
use nix::mount::{MntFlags, umount2};
use nix::{ioctl_none, unistd};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::Command;

ioctl_none!(blkrrpart, 0x12, 95);
ioctl_none!(blkflsbuf, 0x12, 97);

/// Bytes zeroed at the start of the device to drop stale partition tables.
const WIPE_SIZE: usize = 1024 * 1024;

/// Strips a partition suffix from a kernel block device name:
/// `sda1` → `sda`, `mmcblk0p2` → `mmcblk0`, `nvme0n1p3` → `nvme0n1`.
fn parent_disk(name: &str) -> &str {
    if name.starts_with("mmcblk") || name.starts_with("nvme") || name.starts_with("loop") {
        if let Some(idx) = name.rfind('p') {
            let (head, tail) = name.split_at(idx);
            let digits = &tail[1..];
            if !digits.is_empty()
                && digits.chars().all(|c| c.is_ascii_digit())
                && head.ends_with(|c: char| c.is_ascii_digit())
            {
                return head;
            }
        }
        name
    } else {
        name.trim_end_matches(|c: char| c.is_ascii_digit())
    }
}

/// Whether `candidate` is the disk `disk` itself or one of its partitions.
fn belongs_to(candidate: &str, disk: &str) -> bool {
    candidate == disk || parent_disk(candidate) == disk
}

/// Picks the mounts backed by `disk` or its partitions out of
/// `(source, mount point)` pairs, deepest first so nested mounts are released
/// before their parents.
fn mounts_of<I>(mounts: I, disk: &str) -> Vec<(String, PathBuf)>
where
    I: IntoIterator<Item = (String, PathBuf)>,
{
    let mut mounts: Vec<(String, PathBuf)> = mounts
        .into_iter()
        .filter(|(source, target)| {
            !target.as_os_str().is_empty()
                && Path::new(source)
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| belongs_to(name, disk))
        })
        .collect();
    mounts.sort_by_key(|(_, target)| std::cmp::Reverse(target.components().count()));
    mounts
}

/// The filesystems currently mounted from `disk`, as `sysinfo` sees them.
fn disk_mounts(disk: &str) -> Vec<(String, PathBuf)> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    mounts_of(
        disks.iter().map(|d| {
            (
                d.name().to_string_lossy().into_owned(),
                d.mount_point().to_path_buf(),
            )
        }),
        disk,
    )
}

fn kernel_name(device_id: &str) -> Result<&str> {
    Path::new(device_id)
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("'{device_id}' is not a block device path"))
}

/// Enumerates removable block devices from `/sys/block`.
///
/// The filtering logic is as follows:
/// 1.  Find the disk hosting `/` and exclude it.
/// 2.  Skip any loop devices (e.g., `loop0`).
/// 3.  Keep only devices whose `removable` flag is set, the most reliable
///     indicator of a USB drive or SD card.
/// 4.  Skip devices reporting a size of zero, which are usually empty card
///     readers.
pub struct SysfsCatalog {
    sys_block: PathBuf,
}

impl Default for SysfsCatalog {
    fn default() -> Self {
        Self {
            sys_block: PathBuf::from("/sys/block"),
        }
    }
}

impl SysfsCatalog {
    /// Reads from an alternate sysfs tree instead of `/sys/block`.
    pub fn with_root(sys_block: impl Into<PathBuf>) -> Self {
        Self {
            sys_block: sys_block.into(),
        }
    }

    fn read_sys_file(&self, device_name: &str, file: &str) -> io::Result<String> {
        let path = self.sys_block.join(device_name).join(file);
        fs::read_to_string(path).map(|s| s.trim().to_string())
    }

    fn display_name(&self, device_name: &str) -> String {
        let parts: Vec<String> = ["device/vendor", "device/model"]
            .iter()
            .filter_map(|file| self.read_sys_file(device_name, file).ok())
            .filter(|s| !s.is_empty())
            .collect();
        if parts.is_empty() {
            device_name.to_string()
        } else {
            parts.join(" ")
        }
    }
}

/// The kernel name of the disk mounted at `/`, if it can be found.
fn system_disk() -> Option<String> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .iter()
        .find(|disk| disk.mount_point() == Path::new("/"))
        .and_then(|disk| {
            let name = Path::new(disk.name()).file_name()?.to_str()?;
            Some(parent_disk(name).to_string())
        })
}

impl DeviceCatalog for SysfsCatalog {
    fn enumerate(&self) -> Result<Vec<Device>> {
        let system_disk = system_disk();
        if system_disk.is_none() {
            tracing::warn!("could not determine the system drive; relying on the removable flag alone");
        }

        let mut devices = Vec::new();
        let block_dir = fs::read_dir(&self.sys_block)
            .with_context(|| format!("reading {}", self.sys_block.display()))?;

        for entry in block_dir.filter_map(Result::ok) {
            let device_name = entry.file_name().to_string_lossy().to_string();

            if device_name.starts_with("loop") || system_disk.as_deref() == Some(device_name.as_str()) {
                continue;
            }

            let is_removable = self
                .read_sys_file(&device_name, "removable")
                .map(|s| s == "1")
                .unwrap_or(false);
            if !is_removable {
                continue;
            }

            // sysfs reports size in 512-byte sectors regardless of block size.
            let size_sectors = self
                .read_sys_file(&device_name, "size")
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(0);
            if size_sectors == 0 {
                continue;
            }

            devices.push(Device {
                id: format!("/dev/{device_name}"),
                display_name: self.display_name(&device_name),
                size_bytes: size_sectors * 512,
            });
        }

        devices.sort_by(|a, b| a.id.cmp(&b.id));
        tracing::debug!(count = devices.len(), "enumerated removable devices");
        Ok(devices)
    }
}

/// Unmounts every filesystem on the device and clears its partition table.
#[derive(Default)]
pub struct LinuxPreparer;

impl DevicePreparer for LinuxPreparer {
    fn prepare(&self, device_id: &str, on_progress: &mut dyn FnMut(&str)) -> Result<()> {
        let disk = kernel_name(device_id)?;

        on_progress(&format!("Checking mounts on {device_id}"));
        for (source, target) in disk_mounts(disk) {
            on_progress(&format!("Unmounting {source} from {}", target.display()));
            umount2(&target, MntFlags::empty())
                .with_context(|| format!("unmounting {} ({source})", target.display()))?;
        }

        on_progress("Clearing partition table");
        let mut file = OpenOptions::new()
            .write(true)
            .open(device_id)
            .with_context(|| format!("opening {device_id}"))?;
        file.write_all(&vec![0u8; WIPE_SIZE])
            .with_context(|| format!("clearing the start of {device_id}"))?;
        file.sync_all()?;

        // The kernel may still hold the old table; a failed re-read is harmless
        // because the image's own table is read once it has been written.
        if let Err(e) = unsafe { blkrrpart(file.as_raw_fd()) } {
            tracing::debug!(device = %device_id, error = %e, "partition table re-read failed");
        }

        on_progress("Device ready");
        Ok(())
    }
}

/// Flushes and detaches the device with the system `eject` tool.
#[derive(Default)]
pub struct LinuxEjector;

impl DeviceEjector for LinuxEjector {
    fn eject(&self, device_id: &str) -> Result<()> {
        unistd::sync();

        let file = File::open(device_id).with_context(|| format!("opening {device_id}"))?;
        unsafe { blkflsbuf(file.as_raw_fd()) }
            .with_context(|| format!("flushing buffers of {device_id}"))?;
        drop(file);

        let status = Command::new("eject")
            .arg(device_id)
            .status()
            .context("running eject")?;
        if !status.success() {
            bail!("eject {device_id} exited with {status}");
        }
        tracing::info!(device = %device_id, "device ejected");
        Ok(())
    }
}

/// Fails unless the process can open block devices for writing.
pub fn request_elevated_privileges() -> Result<()> {
    if !unistd::geteuid().is_root() {
        bail!("root privileges are required to write to block devices; re-run with sudo");
    }
    Ok(())
}
