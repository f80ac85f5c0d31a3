//! Provides the platform-specific collaborators.
//!
//! Conditional compilation (`#[cfg]`) picks the implementation for the target
//! OS once, at build time. [`backend`] assembles the full set for the current
//! platform, so the pipeline never branches on the OS itself.

use crate::collaborators::{Backend, DeviceCatalog, ImageFetcher};
use crate::config::PipelineConfig;
use anyhow::Result;
use std::sync::Arc;

#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::{LinuxEjector, LinuxPreparer, SysfsCatalog, request_elevated_privileges};

/// The device catalog for this platform, for listing without a run.
#[cfg(target_os = "linux")]
pub fn catalog() -> Result<Arc<dyn DeviceCatalog>> {
    Ok(Arc::new(SysfsCatalog::default()))
}

/// Builds the backend for this platform around the given image fetcher.
#[cfg(target_os = "linux")]
pub fn backend(config: &PipelineConfig, fetcher: Arc<dyn ImageFetcher>) -> Result<Backend> {
    use crate::writer::RawImageWriter;

    Ok(Backend::new(
        Arc::new(SysfsCatalog::default()),
        fetcher,
        Arc::new(LinuxPreparer),
        Arc::new(RawImageWriter::new(config.verify)),
        Arc::new(LinuxEjector),
    ))
}

#[cfg(not(target_os = "linux"))]
pub fn catalog() -> Result<Arc<dyn DeviceCatalog>> {
    anyhow::bail!("this platform is not supported yet")
}

#[cfg(not(target_os = "linux"))]
pub fn backend(_config: &PipelineConfig, _fetcher: Arc<dyn ImageFetcher>) -> Result<Backend> {
    anyhow::bail!("this platform is not supported yet")
}

#[cfg(not(target_os = "linux"))]
pub fn request_elevated_privileges() -> Result<()> {
    anyhow::bail!("this platform is not supported yet")
}
