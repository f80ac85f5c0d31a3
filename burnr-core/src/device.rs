use std::fmt;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// A removable block device offered as a burn target.
///
/// This is a snapshot taken when the [`crate::collaborators::DeviceCatalog`]
/// enumerated the system. It is not re-validated once a run starts, so a device
/// that is unplugged mid-run surfaces as a collaborator error in whichever stage
/// touches it next.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Device {
    /// Platform handle for the device (e.g., `/dev/sdb`).
    pub id: String,
    /// Human-readable name, usually vendor and model.
    pub display_name: String,
    /// Capacity in bytes.
    pub size_bytes: u64,
}

impl Device {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            size_bytes,
        }
    }

    /// Capacity in gibibytes, for display.
    pub fn size_gb(&self) -> f64 {
        self.size_bytes as f64 / GIB
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<15} {:<25} {:.1} GB",
            self.id,
            self.display_name,
            self.size_gb()
        )
    }
}

/// Information about an image once it has been staged locally.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageInfo {
    /// Path of the staged image, inside the run's staging area.
    pub local_path: std::path::PathBuf,
    /// Size of the staged file in bytes.
    pub size_bytes: u64,
    /// Lowercase hex SHA-256 of the staged file, when it was validated.
    pub sha256: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_id_name_and_size() {
        let device = Device::new("/dev/sdb", "SanDisk Ultra", 16 * 1024 * 1024 * 1024);
        let rendered = device.to_string();
        assert!(rendered.starts_with("/dev/sdb"));
        assert!(rendered.contains("SanDisk Ultra"));
        assert!(rendered.ends_with("16.0 GB"));
    }
}
