//! End-to-end runs of the burn pipeline against scripted collaborators.

use anyhow::{Result, anyhow, bail};
use burnr_core::{
    Backend, BurnController, BurnError, Device, DeviceCatalog, DeviceEjector, DevicePreparer,
    ErrorKind, ImageFetcher, ImageInfo, ImageWriter, Notification, PipelineConfig, RunOutcome,
    Stage,
};
use crossbeam_channel::{Receiver, Sender, bounded};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

const TWO_GB: u64 = 2 * 1024 * 1024 * 1024;

type CallLog = Arc<Mutex<Vec<&'static str>>>;

/// Lets a test hold a collaborator inside its call until released.
#[derive(Clone)]
struct Latch {
    entered_tx: Sender<()>,
    entered_rx: Receiver<()>,
    release_tx: Sender<()>,
    release_rx: Receiver<()>,
}

impl Latch {
    fn new() -> Self {
        let (entered_tx, entered_rx) = bounded(1);
        let (release_tx, release_rx) = bounded(1);
        Self {
            entered_tx,
            entered_rx,
            release_tx,
            release_rx,
        }
    }

    fn hold(&self) {
        self.entered_tx.send(()).unwrap();
        self.release_rx.recv().unwrap();
    }

    fn wait_entered(&self) {
        self.entered_rx.recv().unwrap();
    }

    fn release(&self) {
        self.release_tx.send(()).unwrap();
    }
}

struct FakeCatalog(Vec<Device>);

impl DeviceCatalog for FakeCatalog {
    fn enumerate(&self) -> Result<Vec<Device>> {
        Ok(self.0.clone())
    }
}

#[derive(Default)]
struct FakeFetcher {
    log: CallLog,
    fail: bool,
    panics: bool,
    latch: Option<Latch>,
}

impl ImageFetcher for FakeFetcher {
    fn fetch(&self, dest_dir: &Path, on_progress: &mut dyn FnMut(u8, &str)) -> Result<ImageInfo> {
        self.log.lock().unwrap().push("fetch");
        if let Some(latch) = &self.latch {
            latch.hold();
        }
        if self.panics {
            panic!("mirror list exploded");
        }
        let local_path = dest_dir.join("os.img");
        std::fs::write(&local_path, b"image")?;
        for percent in [0, 25, 50] {
            on_progress(percent, "downloading");
        }
        if self.fail {
            bail!("connection reset by peer");
        }
        on_progress(100, "downloaded");
        Ok(ImageInfo {
            local_path,
            size_bytes: TWO_GB,
            sha256: None,
        })
    }
}

#[derive(Default)]
struct FakePreparer {
    log: CallLog,
    fail: bool,
    latch: Option<Latch>,
}

impl DevicePreparer for FakePreparer {
    fn prepare(&self, _device_id: &str, on_progress: &mut dyn FnMut(&str)) -> Result<()> {
        self.log.lock().unwrap().push("prepare");
        on_progress("Unmounting /dev/sdz1");
        if let Some(latch) = &self.latch {
            latch.hold();
        }
        if self.fail {
            bail!("device or resource busy");
        }
        on_progress("Device ready");
        self.log.lock().unwrap().push("prepare-done");
        Ok(())
    }
}

enum WriteScript {
    Succeed(Vec<u8>),
    Fail,
    Panic,
}

struct FakeWriter {
    log: CallLog,
    script: WriteScript,
    latch: Option<Latch>,
}

impl ImageWriter for FakeWriter {
    fn write(
        &self,
        staging_dir: &Path,
        image: &ImageInfo,
        _device_id: &str,
        on_progress: &mut dyn FnMut(u8, &str),
    ) -> Result<()> {
        self.log.lock().unwrap().push("write");
        assert!(image.local_path.starts_with(staging_dir));
        assert!(image.local_path.exists());
        match &self.script {
            WriteScript::Succeed(percents) => {
                for &percent in percents {
                    on_progress(percent, "writing");
                    if let Some(latch) = &self.latch {
                        latch.hold();
                    }
                }
                self.log.lock().unwrap().push("write-done");
                Ok(())
            }
            WriteScript::Fail => {
                on_progress(10, "writing");
                Err(anyhow!("input/output error"))
            }
            WriteScript::Panic => {
                on_progress(40, "writing");
                panic!("writer exploded")
            }
        }
    }
}

#[derive(Default)]
struct FakeEjector {
    log: CallLog,
    fail: bool,
}

impl DeviceEjector for FakeEjector {
    fn eject(&self, _device_id: &str) -> Result<()> {
        self.log.lock().unwrap().push("eject");
        if self.fail {
            bail!("target is busy");
        }
        Ok(())
    }
}

struct Harness {
    controller: BurnController,
    staging_dir: PathBuf,
    log: CallLog,
    _root: TempDir,
}

#[derive(Default)]
struct Script {
    fetch_fails: bool,
    fetch_panics: bool,
    fetch_latch: Option<Latch>,
    prepare_fails: bool,
    prepare_latch: Option<Latch>,
    write: Option<WriteScript>,
    write_latch: Option<Latch>,
    eject_fails: bool,
    devices: Option<Vec<Device>>,
    staging_dir: Option<PathBuf>,
}

fn sd_card() -> Device {
    Device::new("/dev/sdz", "Test Card", 16 * 1024 * 1024 * 1024)
}

fn harness(script: Script) -> Harness {
    let root = tempfile::tempdir().unwrap();
    let staging_dir = script
        .staging_dir
        .unwrap_or_else(|| root.path().join("staging"));
    let log = CallLog::default();

    let backend = Backend::new(
        Arc::new(FakeCatalog(script.devices.unwrap_or_else(|| vec![sd_card()]))),
        Arc::new(FakeFetcher {
            log: log.clone(),
            fail: script.fetch_fails,
            panics: script.fetch_panics,
            latch: script.fetch_latch,
        }),
        Arc::new(FakePreparer {
            log: log.clone(),
            fail: script.prepare_fails,
            latch: script.prepare_latch,
        }),
        Arc::new(FakeWriter {
            log: log.clone(),
            script: script
                .write
                .unwrap_or_else(|| WriteScript::Succeed(vec![0, 50, 100])),
            latch: script.write_latch,
        }),
        Arc::new(FakeEjector {
            log: log.clone(),
            fail: script.eject_fails,
        }),
    );
    let config = PipelineConfig {
        staging_dir: staging_dir.clone(),
        settle_delay_ms: 0,
        verify: false,
    };

    Harness {
        controller: BurnController::new(backend, config),
        staging_dir,
        log,
        _root: root,
    }
}

/// Drains a run, checking that `Finished` is delivered exactly once and last.
fn run_to_end(h: &Harness) -> (Vec<Notification>, RunOutcome) {
    let run = h.controller.start(sd_card()).unwrap();
    let notifications: Vec<_> = run.notifications().iter().collect();
    let outcome = run.wait();

    let finished: Vec<_> = notifications
        .iter()
        .filter(|n| matches!(n, Notification::Finished(_)))
        .collect();
    assert_eq!(finished.len(), 1, "exactly one Finished: {notifications:?}");
    assert_eq!(
        notifications.last(),
        Some(&Notification::Finished(outcome.clone()))
    );
    (notifications, outcome)
}

fn stages(notifications: &[Notification]) -> Vec<Stage> {
    notifications
        .iter()
        .filter_map(|n| match n {
            Notification::StageChanged(stage) => Some(*stage),
            _ => None,
        })
        .collect()
}

/// Numeric progress reported while `stage` was current.
fn percents_during(notifications: &[Notification], stage: Stage) -> Vec<u8> {
    let mut current = None;
    let mut percents = Vec::new();
    for n in notifications {
        match n {
            Notification::StageChanged(s) => current = Some(*s),
            Notification::Progress {
                percent: Some(p), ..
            } if current == Some(stage) => percents.push(*p),
            _ => {}
        }
    }
    percents
}

fn calls(h: &Harness) -> Vec<&'static str> {
    h.log.lock().unwrap().clone()
}

#[test]
fn happy_path_on_a_two_gigabyte_image() {
    let h = harness(Script::default());
    let (notifications, outcome) = run_to_end(&h);

    assert!(outcome.succeeded());
    assert!(outcome.advisories.is_empty());
    assert_eq!(
        stages(&notifications),
        vec![
            Stage::Downloading,
            Stage::Preparing,
            Stage::Burning,
            Stage::Ejecting,
            Stage::Done
        ]
    );
    assert_eq!(
        calls(&h),
        vec!["fetch", "prepare", "prepare-done", "write", "write-done", "eject"]
    );
    assert!(!h.staging_dir.exists());
    assert!(!h.controller.is_busy());
}

#[test]
fn write_failure_produces_the_expected_trail() {
    let h = harness(Script {
        write: Some(WriteScript::Fail),
        ..Default::default()
    });
    let (notifications, outcome) = run_to_end(&h);

    // Collapse runs of progress into one marker to compare the shape.
    let mut shape: Vec<String> = Vec::new();
    for n in &notifications {
        let token = match n {
            Notification::StageChanged(stage) => format!("stage:{stage}"),
            Notification::Progress { .. } => "progress".to_string(),
            Notification::Finished(outcome) => {
                format!("finished:{:?}", outcome.error.as_ref().map(|e| e.kind))
            }
        };
        if shape.last() != Some(&token) {
            shape.push(token);
        }
    }
    assert_eq!(
        shape,
        vec![
            "stage:downloading",
            "progress",
            "stage:preparing",
            "progress",
            "stage:burning",
            "progress",
            "finished:Some(WriteIncomplete)",
        ]
    );

    let error = outcome.error.unwrap();
    assert_eq!(error.kind, ErrorKind::WriteIncomplete);
    assert!(!error.recoverable);
    assert!(error.message.contains("input/output error"));
    assert!(!calls(&h).contains(&"eject"));
    assert!(!h.staging_dir.exists());
}

#[test]
fn fetch_failure_stops_before_any_later_stage() {
    let h = harness(Script {
        fetch_fails: true,
        ..Default::default()
    });
    let (notifications, outcome) = run_to_end(&h);

    assert_eq!(outcome.error.unwrap().kind, ErrorKind::FetchError);
    assert_eq!(stages(&notifications), vec![Stage::Downloading]);
    assert_eq!(calls(&h), vec!["fetch"]);
    assert!(!h.staging_dir.exists());
}

#[test]
fn prepare_failure_never_writes_the_device() {
    let h = harness(Script {
        prepare_fails: true,
        ..Default::default()
    });
    let (notifications, outcome) = run_to_end(&h);

    let error = outcome.error.unwrap();
    assert_eq!(error.kind, ErrorKind::PrepareError);
    assert!(error.recoverable);
    assert_eq!(
        stages(&notifications),
        vec![Stage::Downloading, Stage::Preparing]
    );
    assert!(!calls(&h).contains(&"write"));
    assert!(!h.staging_dir.exists());
}

#[test]
fn preparing_progress_is_descriptive_only() {
    let h = harness(Script::default());
    let (notifications, _) = run_to_end(&h);

    let mut in_preparing = false;
    let mut details = Vec::new();
    for n in &notifications {
        match n {
            Notification::StageChanged(stage) => in_preparing = *stage == Stage::Preparing,
            Notification::Progress { percent, detail } if in_preparing => {
                assert_eq!(*percent, None);
                details.push(detail.clone());
            }
            _ => {}
        }
    }
    assert_eq!(details, vec!["Unmounting /dev/sdz1", "Device ready"]);
}

#[test]
fn eject_failure_is_advisory_and_the_run_succeeds() {
    let h = harness(Script {
        eject_fails: true,
        ..Default::default()
    });
    let (notifications, outcome) = run_to_end(&h);

    assert!(outcome.error.is_none());
    assert_eq!(outcome.advisories.len(), 1);
    let advisory = &outcome.advisories[0];
    assert_eq!(advisory.kind, ErrorKind::EjectAdvisory);
    assert!(advisory.kind.is_advisory());
    assert!(advisory.message.contains("target is busy"));
    assert_eq!(stages(&notifications).last(), Some(&Stage::Done));
    assert!(!h.staging_dir.exists());
}

#[test]
fn progress_is_monotonic_and_bounded_per_stage() {
    let h = harness(Script {
        write: Some(WriteScript::Succeed(vec![10, 50, 30, 120, 90])),
        ..Default::default()
    });
    let (notifications, _) = run_to_end(&h);

    assert_eq!(
        percents_during(&notifications, Stage::Downloading),
        vec![0, 25, 50, 100]
    );
    let burning = percents_during(&notifications, Stage::Burning);
    assert_eq!(burning, vec![10, 50, 50, 100, 100]);
    for stage in [Stage::Downloading, Stage::Burning] {
        let percents = percents_during(&notifications, stage);
        assert!(percents.windows(2).all(|w| w[0] <= w[1]));
        assert!(percents.iter().all(|p| *p <= 100));
    }
}

#[test]
fn cancel_during_prepare_lets_it_finish_then_fails_at_the_boundary() {
    let latch = Latch::new();
    let h = harness(Script {
        prepare_latch: Some(latch.clone()),
        ..Default::default()
    });

    let run = h.controller.start(sd_card()).unwrap();
    latch.wait_entered();
    run.request_cancel();
    latch.release();

    let notifications: Vec<_> = run.notifications().iter().collect();
    let outcome = run.wait();

    let error = outcome.error.unwrap();
    assert_eq!(error.kind, ErrorKind::Cancelled);
    assert_eq!(calls(&h), vec!["fetch", "prepare", "prepare-done"]);
    assert_eq!(
        stages(&notifications),
        vec![Stage::Downloading, Stage::Preparing]
    );
    assert!(!h.staging_dir.exists());
}

#[test]
fn cancel_during_burning_waits_for_the_write_and_skips_eject() {
    let latch = Latch::new();
    let h = harness(Script {
        write: Some(WriteScript::Succeed(vec![60])),
        write_latch: Some(latch.clone()),
        ..Default::default()
    });

    let run = h.controller.start(sd_card()).unwrap();
    latch.wait_entered();
    run.request_cancel();
    latch.release();

    let notifications: Vec<_> = run.notifications().iter().collect();
    let outcome = run.wait();

    let error = outcome.error.unwrap();
    assert_eq!(error.kind, ErrorKind::Cancelled);
    assert!(error.message.contains("not ejected"));
    assert_eq!(
        calls(&h),
        vec!["fetch", "prepare", "prepare-done", "write", "write-done"]
    );
    assert_eq!(stages(&notifications).last(), Some(&Stage::Burning));
    assert_eq!(percents_during(&notifications, Stage::Burning), vec![60]);
    assert!(!h.staging_dir.exists());
    assert!(!h.controller.is_busy());
}

#[test]
fn second_start_is_rejected_while_a_run_is_active() {
    let latch = Latch::new();
    let h = harness(Script {
        fetch_latch: Some(latch.clone()),
        ..Default::default()
    });

    let first = h.controller.start(sd_card()).unwrap();
    latch.wait_entered();
    assert!(h.controller.is_busy());
    assert!(matches!(
        h.controller.start(sd_card()),
        Err(BurnError::AlreadyRunning)
    ));
    latch.release();

    let notifications: Vec<_> = first.notifications().iter().collect();
    let outcome = first.wait();
    assert!(outcome.succeeded());
    assert_eq!(stages(&notifications).last(), Some(&Stage::Done));
    assert_eq!(calls(&h).iter().filter(|c| **c == "fetch").count(), 1);
    assert!(!h.controller.is_busy());
}

#[test]
fn a_new_run_may_start_once_finished_is_seen() {
    let h = harness(Script::default());
    let run = h.controller.start(sd_card()).unwrap();
    let last = run.notifications().iter().last();
    assert!(matches!(last, Some(Notification::Finished(_))));

    let again = h.controller.start(sd_card()).unwrap();
    assert!(again.wait().succeeded());
    run.wait();
}

#[test]
fn empty_enumeration_reports_no_devices_and_starts_nothing() {
    let h = harness(Script {
        devices: Some(Vec::new()),
        ..Default::default()
    });

    let err = h.controller.candidate_devices().unwrap_err();
    assert!(matches!(err, BurnError::NoDevices));
    assert_eq!(err.info().unwrap().kind, ErrorKind::NoDevicesError);
    assert!(!h.controller.is_busy());
    assert!(calls(&h).is_empty());
}

#[test]
fn unusable_staging_location_fails_before_any_stage() {
    let blocker = tempfile::NamedTempFile::new().unwrap();
    let h = harness(Script {
        staging_dir: Some(blocker.path().join("staging")),
        ..Default::default()
    });
    let (notifications, outcome) = run_to_end(&h);

    let error = outcome.error.unwrap();
    assert_eq!(error.kind, ErrorKind::StagingError);
    assert!(!error.recoverable);
    assert_eq!(notifications.len(), 1);
    assert!(calls(&h).is_empty());
}

#[test]
fn existing_user_directory_is_never_used_as_staging() {
    let user_dir = tempfile::tempdir().unwrap();
    let keep = user_dir.path().join("thesis.pdf");
    std::fs::write(&keep, b"keep me").unwrap();
    let h = harness(Script {
        staging_dir: Some(user_dir.path().to_path_buf()),
        ..Default::default()
    });
    let (notifications, outcome) = run_to_end(&h);

    assert_eq!(outcome.error.unwrap().kind, ErrorKind::StagingError);
    assert_eq!(notifications.len(), 1);
    assert!(calls(&h).is_empty());
    assert_eq!(std::fs::read(&keep).unwrap(), b"keep me");
    assert!(user_dir.path().is_dir());
}

#[test]
fn panicking_fetcher_is_an_internal_error_and_still_cleans_up() {
    let h = harness(Script {
        fetch_panics: true,
        ..Default::default()
    });
    let (notifications, outcome) = run_to_end(&h);

    let error = outcome.error.unwrap();
    assert_eq!(error.kind, ErrorKind::Internal);
    assert!(error.message.contains("mirror list exploded"));
    assert_eq!(stages(&notifications), vec![Stage::Downloading]);
    assert!(!h.staging_dir.exists());
    assert!(!h.controller.is_busy());
}

#[test]
fn panic_after_a_partial_write_reports_write_incomplete() {
    let h = harness(Script {
        write: Some(WriteScript::Panic),
        ..Default::default()
    });
    let (notifications, outcome) = run_to_end(&h);

    let error = outcome.error.unwrap();
    assert_eq!(error.kind, ErrorKind::WriteIncomplete);
    assert!(!error.recoverable);
    assert!(error.message.contains("writer exploded"));
    assert_eq!(percents_during(&notifications, Stage::Burning), vec![40]);
    assert!(!calls(&h).contains(&"eject"));
    assert!(!h.staging_dir.exists());
    assert!(!h.controller.is_busy());
}
