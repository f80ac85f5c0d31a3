//! Capability interfaces the pipeline drives.
//!
//! Each trait is one stage's worth of platform or network work. The pipeline
//! calls them synchronously from its worker thread and treats each call as a
//! unit that cannot be interrupted; any internal suspension is the
//! implementation's business.

use crate::device::{Device, ImageInfo};
use anyhow::Result;
use std::path::Path;
use std::sync::Arc;

/// Lists candidate target devices. An empty list is a valid answer.
pub trait DeviceCatalog: Send + Sync {
    fn enumerate(&self) -> Result<Vec<Device>>;
}

/// Retrieves the OS image into the staging directory.
pub trait ImageFetcher: Send + Sync {
    /// `on_progress` receives a percentage in `0..=100` and a detail line.
    fn fetch(&self, dest_dir: &Path, on_progress: &mut dyn FnMut(u8, &str)) -> Result<ImageInfo>;
}

/// Makes a device safe for raw writes (unmount, clear).
pub trait DevicePreparer: Send + Sync {
    /// `on_progress` receives a description of each substep.
    fn prepare(&self, device_id: &str, on_progress: &mut dyn FnMut(&str)) -> Result<()>;
}

/// Streams a staged image onto a device.
pub trait ImageWriter: Send + Sync {
    fn write(
        &self,
        staging_dir: &Path,
        image: &ImageInfo,
        device_id: &str,
        on_progress: &mut dyn FnMut(u8, &str),
    ) -> Result<()>;
}

/// Finalizes and detaches a device.
pub trait DeviceEjector: Send + Sync {
    fn eject(&self, device_id: &str) -> Result<()>;
}

/// The full set of collaborators, chosen once at process start.
#[derive(Clone)]
pub struct Backend {
    pub catalog: Arc<dyn DeviceCatalog>,
    pub fetcher: Arc<dyn ImageFetcher>,
    pub preparer: Arc<dyn DevicePreparer>,
    pub writer: Arc<dyn ImageWriter>,
    pub ejector: Arc<dyn DeviceEjector>,
}

impl Backend {
    pub fn new(
        catalog: Arc<dyn DeviceCatalog>,
        fetcher: Arc<dyn ImageFetcher>,
        preparer: Arc<dyn DevicePreparer>,
        writer: Arc<dyn ImageWriter>,
        ejector: Arc<dyn DeviceEjector>,
    ) -> Self {
        Self {
            catalog,
            fetcher,
            preparer,
            writer,
            ejector,
        }
    }
}
