//! The burn pipeline: Fetch → Prepare → Write → Eject on one worker thread.
//!
//! A [`BurnPipeline`] runs exactly once. It owns the staging area and the
//! staged image for the whole run, reports everything it does through a
//! [`Notifier`], and always ends with a single [`Notification::Finished`].
//!
//! Failure policy:
//! - staging, fetch, prepare and write errors end the run in
//!   [`PipelineState::Failed`] with no further stage attempted;
//! - a failed eject is recorded as an advisory and the run still succeeds;
//! - a panicking collaborator fails the run as `Internal`, or as
//!   `WriteIncomplete` if it panicked while burning;
//! - cancellation is only looked at between stages, so an in-flight
//!   collaborator call always runs to completion.
//!
//! [`Notification::Finished`]: crate::notification::Notification::Finished

use crate::collaborators::Backend;
use crate::config::PipelineConfig;
use crate::controller::RunSlot;
use crate::device::{Device, ImageInfo};
use crate::error::{ErrorInfo, ErrorKind};
use crate::notification::{CommandInbox, Notifier, RunOutcome, Stage};
use crate::staging::StagingArea;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::thread;
use tracing::{debug, error, info, warn};

/// Where a run currently is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PipelineState {
    Idle,
    Downloading,
    Preparing,
    Burning,
    Ejecting,
    Succeeded,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Succeeded | PipelineState::Failed)
    }

    /// Transitions only move forward, except that any non-terminal state may
    /// fail.
    pub fn can_transition_to(self, next: PipelineState) -> bool {
        use PipelineState::*;
        match (self, next) {
            (Idle, Downloading)
            | (Downloading, Preparing)
            | (Preparing, Burning)
            | (Burning, Ejecting)
            | (Ejecting, Succeeded) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Keeps a stage's percentages within `0..=100` and never decreasing.
#[derive(Debug, Default)]
struct ProgressGate {
    last: u8,
}

impl ProgressGate {
    fn admit(&mut self, percent: u8) -> u8 {
        self.last = percent.min(100).max(self.last);
        self.last
    }
}

/// A single burn run.
pub struct BurnPipeline {
    backend: Backend,
    config: PipelineConfig,
    notifier: Notifier,
    commands: CommandInbox,
    state: PipelineState,
    slot: Option<RunSlot>,
}

impl BurnPipeline {
    pub fn new(
        backend: Backend,
        config: PipelineConfig,
        notifier: Notifier,
        commands: CommandInbox,
    ) -> Self {
        Self {
            backend,
            config,
            notifier,
            commands,
            state: PipelineState::Idle,
            slot: None,
        }
    }

    /// Ties the controller's single-run slot to this pipeline. The slot is
    /// released just before `Finished` is sent.
    pub(crate) fn holding(mut self, slot: RunSlot) -> Self {
        self.slot = Some(slot);
        self
    }

    /// Runs every stage against `device` and returns the terminal outcome,
    /// which is also delivered as the last notification.
    pub fn run(mut self, device: &Device) -> RunOutcome {
        info!(device = %device.id, "burn started");

        let result = panic::catch_unwind(AssertUnwindSafe(|| self.execute(device)));
        let outcome = match result {
            Ok(Ok(advisories)) => RunOutcome {
                error: None,
                advisories,
            },
            Ok(Err(err)) => self.fail(err),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                // The device may already hold part of the image.
                let kind = match self.state {
                    PipelineState::Burning => ErrorKind::WriteIncomplete,
                    _ => ErrorKind::Internal,
                };
                self.fail(ErrorInfo::new(kind, message))
            }
        };

        if outcome.succeeded() {
            info!(device = %device.id, advisories = outcome.advisories.len(), "burn finished");
        }

        drop(self.slot.take());
        self.notifier.finished(outcome.clone());
        outcome
    }

    fn execute(&mut self, device: &Device) -> Result<Vec<ErrorInfo>, ErrorInfo> {
        let staging = StagingArea::create(&self.config.staging_dir)
            .map_err(|e| ErrorInfo::from_error(ErrorKind::StagingError, &e))?;

        self.boundary(Stage::Downloading)?;
        self.enter(PipelineState::Downloading, Stage::Downloading);
        let image = self.download(staging.path())?;

        self.boundary(Stage::Preparing)?;
        self.enter(PipelineState::Preparing, Stage::Preparing);
        self.prepare(device)?;

        self.boundary(Stage::Burning)?;
        self.enter(PipelineState::Burning, Stage::Burning);
        self.burn(staging.path(), &image, device)?;

        self.boundary(Stage::Ejecting)?;
        self.enter(PipelineState::Ejecting, Stage::Ejecting);
        let mut advisories = Vec::new();
        if let Some(advisory) = self.eject(device) {
            advisories.push(advisory);
        }

        self.transition(PipelineState::Succeeded);
        if let Err(e) = staging.teardown() {
            warn!(error = %format!("{e:#}"), "staging cleanup failed after a successful burn");
            advisories.push(ErrorInfo::from_error(ErrorKind::StagingError, &e));
        }
        self.notifier.stage(Stage::Done);
        Ok(advisories)
    }

    fn download(&self, staging_dir: &Path) -> Result<ImageInfo, ErrorInfo> {
        let notifier = &self.notifier;
        let mut gate = ProgressGate::default();
        let mut on_progress = |percent: u8, detail: &str| {
            notifier.progress(Some(gate.admit(percent)), detail);
        };
        let image = self
            .backend
            .fetcher
            .fetch(staging_dir, &mut on_progress)
            .map_err(|e| ErrorInfo::from_error(ErrorKind::FetchError, &e))?;
        debug!(path = %image.local_path.display(), bytes = image.size_bytes, "image staged");
        Ok(image)
    }

    fn prepare(&self, device: &Device) -> Result<(), ErrorInfo> {
        let notifier = &self.notifier;
        let mut on_progress = |detail: &str| notifier.progress(None, detail);
        self.backend
            .preparer
            .prepare(&device.id, &mut on_progress)
            .map_err(|e| ErrorInfo::from_error(ErrorKind::PrepareError, &e))
    }

    fn burn(&self, staging_dir: &Path, image: &ImageInfo, device: &Device) -> Result<(), ErrorInfo> {
        let notifier = &self.notifier;
        let mut gate = ProgressGate::default();
        let mut on_progress = |percent: u8, detail: &str| {
            notifier.progress(Some(gate.admit(percent)), detail);
        };
        self.backend
            .writer
            .write(staging_dir, image, &device.id, &mut on_progress)
            .map_err(|e| ErrorInfo::from_error(ErrorKind::WriteIncomplete, &e))
    }

    /// Waits for write buffers to settle, then ejects. Returns an advisory on
    /// failure instead of failing the run.
    fn eject(&self, device: &Device) -> Option<ErrorInfo> {
        // No portable "flush complete" signal exists; wait a fixed, capped time.
        let delay = self.config.settle_delay();
        if !delay.is_zero() {
            self.notifier.progress(
                None,
                format!("Waiting {:.1}s for write buffers to flush", delay.as_secs_f64()),
            );
            thread::sleep(delay);
        }

        match self.backend.ejector.eject(&device.id) {
            Ok(()) => {
                self.notifier.progress(None, "Device ejected");
                None
            }
            Err(e) => {
                let advisory = ErrorInfo::from_error(ErrorKind::EjectAdvisory, &e);
                warn!(device = %device.id, error = %advisory.message, "eject failed; image was written");
                self.notifier
                    .progress(None, format!("Eject failed, remove the device manually: {}", advisory.message));
                Some(advisory)
            }
        }
    }

    /// Stage boundary: the only place a cancellation request is honored.
    fn boundary(&mut self, next: Stage) -> Result<(), ErrorInfo> {
        if self.commands.cancel_requested() {
            info!(state = %self.state, next = %next, "honoring cancellation at stage boundary");
            let message = match next {
                Stage::Ejecting => "cancelled after burning; the device was written but not ejected".to_string(),
                _ => format!("cancelled before {next}"),
            };
            return Err(ErrorInfo::new(ErrorKind::Cancelled, message));
        }
        Ok(())
    }

    fn enter(&mut self, state: PipelineState, stage: Stage) {
        self.transition(state);
        info!(stage = %stage, "stage started");
        self.notifier.stage(stage);
    }

    fn transition(&mut self, next: PipelineState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {} -> {}",
            self.state,
            next
        );
        debug!(from = %self.state, to = %next, "state transition");
        self.state = next;
    }

    fn fail(&mut self, err: ErrorInfo) -> RunOutcome {
        error!(state = %self.state, kind = ?err.kind, message = %err.message, "burn failed");
        if !self.state.is_terminal() {
            self.transition(PipelineState::Failed);
        }
        RunOutcome {
            error: Some(err),
            advisories: Vec::new(),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("burn worker panicked: {detail}")
}
