//! The core, UI-agnostic library for the `burnr` image provisioning utility.
//!
//! `burnr-core` downloads an OS image, prepares a removable device, burns the
//! image onto it and ejects it, reporting every step to whatever front end is
//! driving it. The front end only ever sees a [`BurnController`], the
//! [`Notification`] stream of a run, and a way to cancel.
//!
//! The library is structured into several key modules:
//! - [`pipeline`]: the state machine sequencing the four stages on a worker.
//! - [`controller`]: starts runs one at a time and hands back a [`RunHandle`].
//! - [`notification`]: the worker → caller event stream and the cancel channel.
//! - [`staging`]: the per-run working directory, removed on every exit path.
//! - [`collaborators`]: the capability traits each stage calls into.
//! - [`platform`], [`fetch`], [`mod@writer`]: the concrete collaborators.
//!
//! ## Example: burning an image with progress reporting
//!
//! ```rust,no_run
//! use burnr_core::{BurnController, Notification, PipelineConfig, fetch, platform};
//! use anyhow::Result;
//!
//! fn main() -> Result<()> {
//!     platform::request_elevated_privileges()?;
//!
//!     let config = PipelineConfig::default();
//!     let fetcher = fetch::fetcher_for("https://example.com/os.img.xz", None)?;
//!     let controller = BurnController::new(platform::backend(&config, fetcher)?, config);
//!
//!     let device = controller.candidate_devices()?.remove(0);
//!     let run = controller.start(device)?;
//!
//!     for notification in run.notifications().iter() {
//!         match notification {
//!             Notification::StageChanged(stage) => println!("== {stage}"),
//!             Notification::Progress { percent, detail } => {
//!                 println!("{:>4} {detail}", percent.map(|p| format!("{p}%")).unwrap_or_default())
//!             }
//!             Notification::Finished(outcome) => println!("finished: {:?}", outcome.error),
//!         }
//!     }
//!     run.wait();
//!     Ok(())
//! }
//! ```

pub mod collaborators;
pub mod config;
pub mod controller;
pub mod device;
pub mod error;
pub mod fetch;
pub mod notification;
pub mod pipeline;
pub mod platform;
pub mod staging;
pub mod writer;

pub use collaborators::{Backend, DeviceCatalog, DeviceEjector, DevicePreparer, ImageFetcher, ImageWriter};
pub use config::PipelineConfig;
pub use controller::{BurnController, RunHandle};
pub use device::{Device, ImageInfo};
pub use error::{BurnError, ErrorInfo, ErrorKind};
pub use notification::{CancelHandle, Notification, RunOutcome, Stage};
pub use pipeline::{BurnPipeline, PipelineState};
