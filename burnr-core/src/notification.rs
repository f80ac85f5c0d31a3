//! The notification stream from the burn worker to its caller.
//!
//! Two independent channels connect a run to the caller:
//! - worker → caller: an unbounded channel of [`Notification`]s. The worker
//!   never blocks on a slow consumer, and every run ends with exactly one
//!   [`Notification::Finished`].
//! - caller → worker: a channel of [`Command`]s, polled by the pipeline only at
//!   stage boundaries.

use crate::error::ErrorInfo;
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use std::fmt;

/// A named stage of a run, as announced by [`Notification::StageChanged`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    Downloading,
    Preparing,
    Burning,
    Ejecting,
    Done,
}

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Stage::Downloading => "downloading",
            Stage::Preparing => "preparing",
            Stage::Burning => "burning",
            Stage::Ejecting => "ejecting",
            Stage::Done => "done",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a run ended.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunOutcome {
    /// The terminal error, or `None` when the run succeeded.
    pub error: Option<ErrorInfo>,
    /// Problems that did not change the outcome: a failed eject, or a
    /// staging directory that could not be removed after a successful burn.
    pub advisories: Vec<ErrorInfo>,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// One event in a run's notification stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notification {
    StageChanged(Stage),
    /// `percent` is `None` for stages whose substeps are not measurable
    /// (device preparation); only `detail` is meaningful then.
    Progress {
        percent: Option<u8>,
        detail: String,
    },
    /// Always the last notification of a run.
    Finished(RunOutcome),
}

/// Requests from the caller to a running pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Cancel,
}

/// The worker's end of the notification channel.
#[derive(Clone, Debug)]
pub struct Notifier {
    tx: Sender<Notification>,
}

impl Notifier {
    pub fn send(&self, notification: Notification) {
        tracing::trace!(?notification, "notify");
        if self.tx.send(notification).is_err() {
            // The caller dropped its receiver. The run keeps going so cleanup
            // still happens; there is just nobody left to tell.
            tracing::debug!("notification receiver dropped");
        }
    }

    pub fn stage(&self, stage: Stage) {
        self.send(Notification::StageChanged(stage));
    }

    pub fn progress(&self, percent: Option<u8>, detail: impl Into<String>) {
        self.send(Notification::Progress {
            percent,
            detail: detail.into(),
        });
    }

    pub fn finished(&self, outcome: RunOutcome) {
        self.send(Notification::Finished(outcome));
    }
}

/// Creates the worker → caller notification channel.
pub fn notification_channel() -> (Notifier, Receiver<Notification>) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (Notifier { tx }, rx)
}

/// The caller's end of the command channel.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    tx: Sender<Command>,
}

impl CancelHandle {
    /// Best-effort: honored at the next stage boundary, never mid-stage.
    pub fn request_cancel(&self) {
        if self.tx.send(Command::Cancel).is_ok() {
            tracing::info!("cancellation requested");
        }
    }
}

/// The worker's end of the command channel.
#[derive(Debug)]
pub struct CommandInbox {
    rx: Receiver<Command>,
    cancelled: bool,
}

impl CommandInbox {
    /// Drains pending commands without blocking and reports whether a
    /// cancellation has been requested so far.
    pub fn cancel_requested(&mut self) -> bool {
        loop {
            match self.rx.try_recv() {
                Ok(Command::Cancel) => self.cancelled = true,
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
        self.cancelled
    }
}

/// Creates the caller → worker command channel.
pub fn command_channel() -> (CancelHandle, CommandInbox) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (
        CancelHandle { tx },
        CommandInbox {
            rx,
            cancelled: false,
        },
    )
}
