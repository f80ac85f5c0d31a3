//! Caller-facing entry point: enumerate, start one run at a time, cancel.
use crate::collaborators::Backend;
use crate::config::PipelineConfig;
use crate::device::Device;
use crate::error::{BurnError, ErrorInfo, ErrorKind};
use crate::notification::{
    CancelHandle, Notification, RunOutcome, command_channel, notification_channel,
};
use crate::pipeline::BurnPipeline;
use crossbeam_channel::Receiver;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

/// Marks the controller as busy for as long as it is alive.
#[derive(Debug)]
pub(crate) struct RunSlot {
    active: Arc<AtomicBool>,
}

impl RunSlot {
    fn claim(active: &Arc<AtomicBool>) -> Option<Self> {
        active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self {
                active: Arc::clone(active),
            })
    }
}

impl Drop for RunSlot {
    fn drop(&mut self) {
        self.active.store(false, Ordering::Release);
    }
}

/// Starts burn runs against a fixed [`Backend`] and [`PipelineConfig`].
///
/// At most one run is active at a time. A run's worker releases the
/// controller just before it delivers `Finished`, so the caller may start the
/// next run as soon as it has seen the previous one end.
pub struct BurnController {
    backend: Backend,
    config: PipelineConfig,
    active: Arc<AtomicBool>,
}

impl BurnController {
    pub fn new(backend: Backend, config: PipelineConfig) -> Self {
        Self {
            backend,
            config,
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn is_busy(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Lists the devices a run could target.
    ///
    /// # Errors
    ///
    /// [`BurnError::NoDevices`] when enumeration succeeds but finds nothing,
    /// [`BurnError::Catalog`] when enumeration itself fails.
    pub fn candidate_devices(&self) -> Result<Vec<Device>, BurnError> {
        let devices = self.backend.catalog.enumerate().map_err(|e| {
            BurnError::Catalog(ErrorInfo::from_error(ErrorKind::NoDevicesError, &e))
        })?;
        if devices.is_empty() {
            tracing::info!("no candidate devices");
            return Err(BurnError::NoDevices);
        }
        tracing::debug!(count = devices.len(), "candidate devices found");
        Ok(devices)
    }

    /// Starts a run against `device` on a new worker thread.
    ///
    /// # Errors
    ///
    /// [`BurnError::AlreadyRunning`] if a run is active; the active run is not
    /// affected. [`BurnError::Spawn`] if the worker thread cannot be created.
    pub fn start(&self, device: Device) -> Result<RunHandle, BurnError> {
        let Some(slot) = RunSlot::claim(&self.active) else {
            tracing::warn!(device = %device.id, "start rejected: a burn is already in progress");
            return Err(BurnError::AlreadyRunning);
        };

        let (notifier, notifications) = notification_channel();
        let (cancel, commands) = command_channel();
        let pipeline = BurnPipeline::new(self.backend.clone(), self.config.clone(), notifier, commands)
            .holding(slot);

        // On spawn failure the closure, and with it the slot, is dropped.
        let worker = thread::Builder::new()
            .name("burnr-worker".into())
            .spawn(move || pipeline.run(&device))?;

        Ok(RunHandle {
            notifications,
            cancel,
            worker,
        })
    }
}

/// The caller's view of one run.
pub struct RunHandle {
    notifications: Receiver<Notification>,
    cancel: CancelHandle,
    worker: JoinHandle<RunOutcome>,
}

impl RunHandle {
    /// The run's notification stream. Iteration ends after `Finished`, once
    /// the worker has exited.
    pub fn notifications(&self) -> &Receiver<Notification> {
        &self.notifications
    }

    /// A cloneable handle for cancelling from another context, such as a
    /// signal handler.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn request_cancel(&self) {
        self.cancel.request_cancel();
    }

    /// Blocks until the worker exits and returns the terminal outcome.
    pub fn wait(self) -> RunOutcome {
        match self.worker.join() {
            Ok(outcome) => outcome,
            Err(_) => RunOutcome {
                error: Some(ErrorInfo::new(ErrorKind::Internal, "burn worker panicked")),
                advisories: Vec::new(),
            },
        }
    }
}
