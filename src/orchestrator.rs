//! Backup run state machine
//!
//! ```text
//! INIT → DISCOVER_DEVICE → MEASURE_FOLDERS → CLEAR_TRANSFER → SCAN_SLOTS
//!      → ALLOCATE → SNAPSHOT_CREATE → (LOAD_TAPE → WRITE_ARCHIVE → UNLOAD_TAPE)*
//!      → SNAPSHOT_REMOVE → REPORT → DONE
//! ```
//!
//! Any error (or SIGINT/SIGTERM) leaves the happy path for CLEANUP, which
//! empties the drive and removes the snapshot, then FAILED_TERMINAL, which
//! notifies the operator. The plan is complete before the first cartridge
//! moves, and the drive never holds more than one cartridge.

use crate::allocation::{AllocationEngine, AllocationPlan, SlotAssignment};
use crate::archive::{ArchiveOutcome, ArchiveWriter, ContentIndex, TarWriter};
use crate::catalog::{Catalog, DiskUsageCatalog, FolderCatalog};
use crate::changer::{ChangerDevice, MediaChanger, MtxChanger, SlotStatus};
use crate::config::BackupConfig;
use crate::error::{Result, TapeBackupError};
use crate::notify::{Notifier, SendmailNotifier};
use crate::report::RunReport;
use crate::run_state::{FolderSize, RunState, RunStatus, SlotResult};
use crate::shell::{CommandRunner, DiagnosticLog};
use crate::snapshot::{LvmSnapshot, SnapshotManager};
use chrono::{DateTime, Local};
use std::fmt;
use std::future::Future;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Init,
    DiscoverDevice,
    MeasureFolders,
    ClearTransfer,
    ScanSlots,
    Allocate,
    SnapshotCreate,
    LoadTape(u32),
    WriteArchive(u32),
    UnloadTape(u32),
    SnapshotRemove,
    Report,
    Done,
    Cleanup,
    FailedTerminal,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunPhase::Init => write!(f, "INIT"),
            RunPhase::DiscoverDevice => write!(f, "DISCOVER_DEVICE"),
            RunPhase::MeasureFolders => write!(f, "MEASURE_FOLDERS"),
            RunPhase::ClearTransfer => write!(f, "CLEAR_TRANSFER"),
            RunPhase::ScanSlots => write!(f, "SCAN_SLOTS"),
            RunPhase::Allocate => write!(f, "ALLOCATE"),
            RunPhase::SnapshotCreate => write!(f, "SNAPSHOT_CREATE"),
            RunPhase::LoadTape(slot) => write!(f, "LOAD_TAPE({})", slot),
            RunPhase::WriteArchive(slot) => write!(f, "WRITE_ARCHIVE({})", slot),
            RunPhase::UnloadTape(slot) => write!(f, "UNLOAD_TAPE({})", slot),
            RunPhase::SnapshotRemove => write!(f, "SNAPSHOT_REMOVE"),
            RunPhase::Report => write!(f, "REPORT"),
            RunPhase::Done => write!(f, "DONE"),
            RunPhase::Cleanup => write!(f, "CLEANUP"),
            RunPhase::FailedTerminal => write!(f, "FAILED_TERMINAL"),
        }
    }
}

/// How a run ended
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The run reached DONE; `status` may still be degraded
    Completed { status: RunStatus, report: String },
    /// The run was aborted through CLEANUP
    Fatal { phase: RunPhase, error: String },
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Completed {
                status: RunStatus::Success,
                ..
            } => 0,
            _ => 1,
        }
    }
}

/// External systems the run drives
pub struct Collaborators {
    pub changer: Box<dyn MediaChanger>,
    pub catalog: Box<dyn FolderCatalog>,
    pub snapshot: Box<dyn SnapshotManager>,
    pub writer: Box<dyn ArchiveWriter>,
    pub notifier: Box<dyn Notifier>,
}

impl Collaborators {
    /// Production wiring: `mtx`/`mt`, disk usage, LVM, `tar`, sendmail
    pub fn from_config(config: &BackupConfig, runner: CommandRunner) -> Self {
        Self {
            changer: Box::new(MtxChanger::new(runner.clone(), config.changer.clone())),
            catalog: Box::new(DiskUsageCatalog::from_config(&config.source)),
            snapshot: Box::new(LvmSnapshot::new(runner.clone(), config.snapshot.clone())),
            writer: Box::new(TarWriter::new(runner.clone(), config)),
            notifier: Box::new(SendmailNotifier::new(runner, config.mail.clone())),
        }
    }
}

pub struct BackupOrchestrator {
    config: BackupConfig,
    parts: Collaborators,
    engine: AllocationEngine,
    content_index: ContentIndex,
    diagnostics: DiagnosticLog,
    phase: RunPhase,
    history: Vec<RunPhase>,
    device: Option<ChangerDevice>,
    /// Set before creation starts so a half-created snapshot is cleaned up
    snapshot_active: bool,
}

impl BackupOrchestrator {
    pub fn new(config: BackupConfig, parts: Collaborators, diagnostics: DiagnosticLog) -> Self {
        Self {
            engine: AllocationEngine::from_config(&config),
            content_index: ContentIndex::from_config(&config),
            config,
            parts,
            diagnostics,
            phase: RunPhase::Init,
            history: vec![RunPhase::Init],
            device: None,
            snapshot_active: false,
        }
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    /// Every phase entered so far, in order
    pub fn history(&self) -> &[RunPhase] {
        &self.history
    }

    /// Run to completion, routing SIGINT/SIGTERM through cleanup
    pub async fn run(&mut self) -> RunOutcome {
        self.run_until(shutdown_signal()).await
    }

    /// Run until done or until `shutdown` resolves, whichever comes first
    pub async fn run_until<F>(&mut self, shutdown: F) -> RunOutcome
    where
        F: Future<Output = ()>,
    {
        info!("Starting tape backup process");
        if self.config.dry_run {
            info!("Running in try mode: the archive writer will not be invoked");
        }

        let run_start = Local::now();
        let mut state = RunState::new();

        let result = tokio::select! {
            biased;
            () = shutdown => Err(TapeBackupError::Interrupted),
            res = self.execute(&mut state) => res,
        };

        match result {
            Ok(()) => self.finish(state, run_start).await,
            Err(e) => self.fail(e).await,
        }
    }

    fn enter(&mut self, phase: RunPhase) {
        debug!("Phase {} -> {}", self.phase, phase);
        self.phase = phase;
        self.history.push(phase);
    }

    async fn execute(&mut self, state: &mut RunState) -> Result<()> {
        self.enter(RunPhase::DiscoverDevice);
        let device = self.parts.changer.discover_device().await?;
        self.device = Some(device.clone());

        self.enter(RunPhase::MeasureFolders);
        let catalog = self.parts.catalog.measure().await?;

        self.enter(RunPhase::ClearTransfer);
        self.ensure_transfer_empty(&device).await?;

        self.enter(RunPhase::ScanSlots);
        let slots = self
            .parts
            .changer
            .scan_slots(&device, &self.config.process_slots)
            .await?;
        let available: Vec<u32> = slots.iter().filter(|s| s.occupied).map(|s| s.id).collect();
        info!("Tape slots with cartridges: {:?}", available);

        self.enter(RunPhase::Allocate);
        let (plan, unallocated) = self.engine.allocate(&catalog, &available);
        state.set_unallocated(unallocated);

        self.enter(RunPhase::SnapshotCreate);
        self.snapshot_active = true;
        self.parts.snapshot.create().await?;
        state.absorb_errors(self.diagnostics.drain());

        self.backup_loop(&device, &plan, &slots, &catalog, state)
            .await?;

        self.enter(RunPhase::SnapshotRemove);
        if let Err(e) = self.parts.snapshot.remove().await {
            error!("Removing the snapshot failed: {}", e);
            state.record_error(format!("Snapshot removal failed: {}", e));
            state.degrade(RunStatus::Failed);
        }
        self.snapshot_active = false;
        Ok(())
    }

    async fn backup_loop(
        &mut self,
        device: &ChangerDevice,
        plan: &AllocationPlan,
        slots: &[SlotStatus],
        catalog: &Catalog,
        state: &mut RunState,
    ) -> Result<()> {
        info!("Starting backup loop");

        for assignment in &plan.slots {
            if assignment.is_empty() {
                debug!("Slot {} has nothing assigned, skipping", assignment.slot_id);
                continue;
            }
            let slot_id = assignment.slot_id;
            let label = slots
                .iter()
                .find(|s| s.id == slot_id)
                .map(|s| s.label.clone())
                .unwrap_or_default();

            self.enter(RunPhase::LoadTape(slot_id));
            self.ensure_transfer_empty(device).await?;
            match self.parts.changer.load_tape(device, slot_id).await {
                Ok(()) => {}
                Err(e @ TapeBackupError::HardwareCommandFailed { .. }) => {
                    error!("Loading slot {} failed, skipping it: {}", slot_id, e);
                    state.record_error(format!("Slot {}: loading failed: {}", slot_id, e));
                    state.degrade(RunStatus::Failed);
                    self.parts.changer.unload_transfer(device).await?;
                    continue;
                }
                Err(e) => return Err(e),
            }

            info!(
                "Backing-up to tape in slot '{}' with label '{}'",
                slot_id, label
            );
            self.enter(RunPhase::WriteArchive(slot_id));
            let result = self.write_slot(assignment, label, catalog, state).await?;
            state.record_slot(result);

            self.enter(RunPhase::UnloadTape(slot_id));
            self.parts.changer.unload_transfer(device).await?;
            state.absorb_errors(self.diagnostics.drain());
        }

        info!("Finished backup loop");
        Ok(())
    }

    async fn write_slot(
        &mut self,
        assignment: &SlotAssignment,
        label: String,
        catalog: &Catalog,
        state: &mut RunState,
    ) -> Result<SlotResult> {
        let index = self
            .content_index
            .build(assignment.slot_id, &assignment.folders, Local::now())
            .await?;
        for entry in &index.skipped {
            state.record_error(format!(
                "Slot {}: content index skipped {}",
                assignment.slot_id, entry
            ));
        }
        let sources = self.content_index.sources(index.path, &assignment.folders);
        let folders = assignment
            .folders
            .iter()
            .map(|name| FolderSize {
                name: name.clone(),
                size_mb: catalog.size_of(name),
            })
            .collect();

        let start_time = Local::now();
        let outcome = if self.config.dry_run {
            tokio::time::sleep(self.config.dry_run_delay()).await;
            ArchiveOutcome::default()
        } else {
            self.parts.writer.write(&sources).await?
        };
        let stop_time = Local::now();

        if outcome.exit_code != 0 {
            error!(
                "Archive writer exited with code {} for slot {}",
                outcome.exit_code, assignment.slot_id
            );
            let detail = outcome.stderr.trim();
            state.record_error(if detail.is_empty() {
                format!(
                    "Slot {}: archive writer exited with code {}",
                    assignment.slot_id, outcome.exit_code
                )
            } else {
                format!(
                    "Slot {}: archive writer exited with code {}: {}",
                    assignment.slot_id, outcome.exit_code, detail
                )
            });
        }

        Ok(SlotResult {
            slot_id: assignment.slot_id,
            label,
            start_time,
            stop_time,
            exit_code: outcome.exit_code,
            folders,
        })
    }

    /// Confirm the drive is empty, unloading a cartridge left behind
    async fn ensure_transfer_empty(&self, device: &ChangerDevice) -> Result<()> {
        let transfer = self.parts.changer.transfer_status(device).await?;
        if transfer.empty {
            debug!("Transfer element is empty");
            return Ok(());
        }
        warn!(
            "Drive still holds tape '{}', unloading it first",
            transfer.label
        );
        self.parts.changer.unload_transfer(device).await
    }

    async fn finish(&mut self, mut state: RunState, run_start: DateTime<Local>) -> RunOutcome {
        self.enter(RunPhase::Report);
        state.absorb_errors(self.diagnostics.drain());

        let report = RunReport::from_state(&state, self.config.mode_label(), run_start, Local::now());
        let text = report.render();
        info!("Finished tape backup process");
        info!("Backup job stati:\n{}", text);

        if let Err(e) = self
            .parts
            .notifier
            .notify(&report.subject(), &format!("Backup job stati:\n\n{}", text))
            .await
        {
            error!("Sending the report failed: {}", e);
        }

        self.enter(RunPhase::Done);
        RunOutcome::Completed {
            status: state.status(),
            report: text,
        }
    }

    async fn fail(&mut self, error: TapeBackupError) -> RunOutcome {
        let phase = self.phase;
        error!("Backup run failed during {}: {}", phase, error);

        self.cleanup().await;
        self.enter(RunPhase::FailedTerminal);

        let message = format!("An error occurred during {}:\n{}", phase, error);
        if let Err(e) = self.parts.notifier.notify("ERROR", &message).await {
            error!("Sending the failure notification failed: {}", e);
        }

        RunOutcome::Fatal {
            phase,
            error: error.to_string(),
        }
    }

    /// Best effort: both steps run, their errors are only logged
    async fn cleanup(&mut self) {
        self.enter(RunPhase::Cleanup);

        match self.device.clone() {
            Some(device) => {
                if let Err(e) = self.ensure_transfer_empty(&device).await {
                    error!("Cleanup: emptying the drive failed: {}", e);
                }
            }
            None => debug!("Cleanup: no changer discovered, nothing to unload"),
        }

        if self.snapshot_active {
            if let Err(e) = self.parts.snapshot.remove().await {
                error!("Cleanup: removing the snapshot failed: {}", e);
            }
            self.snapshot_active = false;
        }
    }
}

/// Resolves on SIGINT or SIGTERM. A handler that cannot be installed never
/// resolves.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => warn!("Received SIGINT, aborting the run"),
        () = terminate => warn!("Received SIGTERM, aborting the run"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Folder;
    use crate::changer::TransferStatus;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    type Events = Arc<Mutex<Vec<String>>>;

    struct MockChanger {
        events: Events,
        full: HashSet<u32>,
        loaded: Mutex<Option<u32>>,
        discover_fails: bool,
        unload_fails: bool,
        failing_loads: HashSet<u32>,
    }

    #[async_trait]
    impl MediaChanger for MockChanger {
        async fn discover_device(&self) -> Result<ChangerDevice> {
            self.events.lock().push("discover".to_string());
            if self.discover_fails {
                return Err(TapeBackupError::configuration("no changer answered below /dev"));
            }
            Ok(ChangerDevice::new("/dev/sg3"))
        }

        async fn scan_slots(&self, _: &ChangerDevice, ids: &[u32]) -> Result<Vec<SlotStatus>> {
            self.events.lock().push("scan".to_string());
            Ok(ids
                .iter()
                .map(|id| SlotStatus {
                    id: *id,
                    occupied: self.full.contains(id),
                    label: format!("00000{}L8", id),
                })
                .collect())
        }

        async fn transfer_status(&self, _: &ChangerDevice) -> Result<TransferStatus> {
            let loaded = *self.loaded.lock();
            Ok(TransferStatus {
                empty: loaded.is_none(),
                label: loaded.map(|s| format!("00000{}L8", s)).unwrap_or_default(),
            })
        }

        async fn unload_transfer(&self, _: &ChangerDevice) -> Result<()> {
            let mut loaded = self.loaded.lock();
            let Some(slot) = *loaded else {
                return Ok(());
            };
            if self.unload_fails {
                self.events.lock().push(format!("unload-failed {}", slot));
                return Err(TapeBackupError::hardware("mtx unload", "Drive 0 jammed"));
            }
            *loaded = None;
            self.events.lock().push(format!("unload {}", slot));
            Ok(())
        }

        async fn load_tape(&self, _: &ChangerDevice, slot_id: u32) -> Result<()> {
            let mut loaded = self.loaded.lock();
            if loaded.is_some() {
                return Err(TapeBackupError::hardware("load", "drive already holds a cartridge"));
            }
            if self.failing_loads.contains(&slot_id) {
                self.events.lock().push(format!("load-failed {}", slot_id));
                // a half-finished move leaves the cartridge in the drive
                *loaded = Some(slot_id);
                return Err(TapeBackupError::hardware(
                    format!("mtx load {}", slot_id),
                    "Source Element Address is Empty",
                ));
            }
            *loaded = Some(slot_id);
            self.events.lock().push(format!("load {}", slot_id));
            Ok(())
        }
    }

    struct MockCatalog(Catalog);

    #[async_trait]
    impl FolderCatalog for MockCatalog {
        async fn measure(&self) -> Result<Catalog> {
            Ok(self.0.clone())
        }
    }

    struct MockSnapshot {
        events: Events,
        create_fails: bool,
        remove_fails: bool,
    }

    #[async_trait]
    impl SnapshotManager for MockSnapshot {
        async fn create(&self) -> Result<()> {
            self.events.lock().push("snapshot create".to_string());
            if self.create_fails {
                return Err(TapeBackupError::hardware("lvcreate", "Insufficient free space"));
            }
            Ok(())
        }

        async fn remove(&self) -> Result<()> {
            self.events.lock().push("snapshot remove".to_string());
            if self.remove_fails {
                return Err(TapeBackupError::hardware("umount /snap_tape", "target is busy"));
            }
            Ok(())
        }
    }

    enum WriterBehaviour {
        ExitCode(i32),
        Error,
        Hang,
    }

    struct MockWriter {
        events: Events,
        /// Behaviour per call, `ExitCode(0)` once exhausted
        script: Mutex<Vec<WriterBehaviour>>,
        sources: Arc<Mutex<Vec<Vec<PathBuf>>>>,
    }

    #[async_trait]
    impl ArchiveWriter for MockWriter {
        async fn write(&self, sources: &[PathBuf]) -> Result<ArchiveOutcome> {
            self.events.lock().push("write".to_string());
            self.sources.lock().push(sources.to_vec());
            let behaviour = {
                let mut script = self.script.lock();
                if script.is_empty() {
                    WriterBehaviour::ExitCode(0)
                } else {
                    script.remove(0)
                }
            };
            match behaviour {
                WriterBehaviour::ExitCode(code) => Ok(ArchiveOutcome {
                    exit_code: code,
                    stderr: if code == 0 {
                        String::new()
                    } else {
                        "tar: Error is not recoverable".to_string()
                    },
                }),
                WriterBehaviour::Error => Err(TapeBackupError::archive("tape device vanished")),
                WriterBehaviour::Hang => std::future::pending().await,
            }
        }
    }

    struct MockNotifier {
        events: Events,
        sent: Arc<Mutex<Vec<(String, String)>>>,
    }

    #[async_trait]
    impl Notifier for MockNotifier {
        async fn notify(&self, subject: &str, body: &str) -> Result<()> {
            self.events.lock().push(format!("notify {}", subject));
            self.sent.lock().push((subject.to_string(), body.to_string()));
            Ok(())
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        root: PathBuf,
        config: BackupConfig,
        folders: Vec<(String, u64)>,
        full: HashSet<u32>,
        initially_loaded: Option<u32>,
        discover_fails: bool,
        unload_fails: bool,
        create_fails: bool,
        remove_fails: bool,
        failing_loads: HashSet<u32>,
        writer_script: Vec<WriterBehaviour>,
        events: Events,
        sent: Arc<Mutex<Vec<(String, String)>>>,
        sources: Arc<Mutex<Vec<Vec<PathBuf>>>>,
    }

    impl Harness {
        fn new(folders: &[(&str, u64)], process_slots: &[u32], full: &[u32]) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = dir.path().to_path_buf();
            let mut config = BackupConfig::default();
            config.process_slots = process_slots.to_vec();
            config.tape_capacity_tb = 1;
            config.source.path = root.join("source");
            config.snapshot.mount = root.join("snap");
            config.archive.index_tmp_file = root.join("tmp_index.txt");
            config.archive.dry_run_delay_secs = 0;

            for (name, _) in folders {
                let folder = root.join("snap").join(name);
                std::fs::create_dir_all(&folder).unwrap();
                std::fs::write(folder.join("file.bin"), b"data").unwrap();
            }

            Self {
                _dir: dir,
                root,
                config,
                folders: folders.iter().map(|(n, s)| (n.to_string(), *s)).collect(),
                full: full.iter().copied().collect(),
                initially_loaded: None,
                discover_fails: false,
                unload_fails: false,
                create_fails: false,
                remove_fails: false,
                failing_loads: HashSet::new(),
                writer_script: Vec::new(),
                events: Arc::new(Mutex::new(Vec::new())),
                sent: Arc::new(Mutex::new(Vec::new())),
                sources: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn orchestrator(&mut self) -> BackupOrchestrator {
            let catalog = self
                .folders
                .iter()
                .map(|(name, size)| Folder::new(name.clone(), *size))
                .collect();
            let parts = Collaborators {
                changer: Box::new(MockChanger {
                    events: self.events.clone(),
                    full: self.full.clone(),
                    loaded: Mutex::new(self.initially_loaded),
                    discover_fails: self.discover_fails,
                    unload_fails: self.unload_fails,
                    failing_loads: self.failing_loads.clone(),
                }),
                catalog: Box::new(MockCatalog(catalog)),
                snapshot: Box::new(MockSnapshot {
                    events: self.events.clone(),
                    create_fails: self.create_fails,
                    remove_fails: self.remove_fails,
                }),
                writer: Box::new(MockWriter {
                    events: self.events.clone(),
                    script: Mutex::new(std::mem::take(&mut self.writer_script)),
                    sources: self.sources.clone(),
                }),
                notifier: Box::new(MockNotifier {
                    events: self.events.clone(),
                    sent: self.sent.clone(),
                }),
            };
            BackupOrchestrator::new(self.config.clone(), parts, DiagnosticLog::new())
        }

        async fn run(&mut self) -> (RunOutcome, BackupOrchestrator) {
            let mut orchestrator = self.orchestrator();
            let outcome = orchestrator.run_until(std::future::pending()).await;
            (outcome, orchestrator)
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().clone()
        }

        fn hardware_events(&self) -> Vec<String> {
            self.events()
                .into_iter()
                .filter(|e| e.starts_with("load") || e.starts_with("unload"))
                .collect()
        }

        fn last_mail(&self) -> (String, String) {
            self.sent.lock().last().cloned().expect("a notification was sent")
        }
    }

    fn report_of(outcome: &RunOutcome) -> &str {
        match outcome {
            RunOutcome::Completed { report, .. } => report,
            other => panic!("run did not complete: {:?}", other),
        }
    }

    fn status_of(outcome: &RunOutcome) -> RunStatus {
        match outcome {
            RunOutcome::Completed { status, .. } => *status,
            other => panic!("run did not complete: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_three_folders_over_two_tapes() {
        let mut h = Harness::new(
            &[("a", 400_000), ("b", 400_000), ("c", 400_000)],
            &[1, 2],
            &[1, 2],
        );
        let (outcome, orchestrator) = h.run().await;

        assert_eq!(status_of(&outcome), RunStatus::Success);
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(
            h.events(),
            vec![
                "discover",
                "scan",
                "snapshot create",
                "load 1",
                "write",
                "unload 1",
                "load 2",
                "write",
                "unload 2",
                "snapshot remove",
                "notify SUCCESS",
            ]
        );

        let sources = h.sources.lock().clone();
        let snap = h.root.join("snap");
        assert_eq!(
            sources[0],
            vec![h.root.join("tmp_index.txt"), snap.join("a"), snap.join("b")]
        );
        assert_eq!(sources[1], vec![h.root.join("tmp_index.txt"), snap.join("c")]);

        let index_dir = h.root.join("source").join("tape_content_index");
        assert_eq!(std::fs::read_dir(index_dir).unwrap().count(), 2);

        let report = report_of(&outcome);
        assert!(report.contains("slot '1' with label '000001L8'"));
        assert!(report.contains("Folder 'c' size: 400.00 GB"));
        assert_eq!(orchestrator.phase(), RunPhase::Done);
        assert!(orchestrator
            .history()
            .starts_with(&[RunPhase::Init, RunPhase::DiscoverDevice, RunPhase::MeasureFolders]));
    }

    #[tokio::test]
    async fn test_oversized_folder_degrades_to_error() {
        let mut h = Harness::new(&[("huge", 2_000_000)], &[1, 2, 3], &[1, 2, 3]);
        let (outcome, orchestrator) = h.run().await;

        assert_eq!(status_of(&outcome), RunStatus::Error);
        assert_eq!(outcome.exit_code(), 1);
        assert!(h.hardware_events().is_empty());
        assert!(!orchestrator
            .history()
            .iter()
            .any(|p| matches!(p, RunPhase::LoadTape(_))));

        let (subject, body) = h.last_mail();
        assert_eq!(subject, "ERROR");
        assert!(body.contains("Unprocessed folders"));
        assert!(body.contains("'huge'"));
    }

    #[tokio::test]
    async fn test_failed_write_continues_with_next_slot() {
        let mut h = Harness::new(&[("a", 600_000), ("b", 600_000)], &[1, 2], &[1, 2]);
        h.writer_script = vec![WriterBehaviour::ExitCode(2)];
        let (outcome, _) = h.run().await;

        assert_eq!(status_of(&outcome), RunStatus::Failed);
        assert_eq!(
            h.hardware_events(),
            vec!["load 1", "unload 1", "load 2", "unload 2"]
        );
        let report = report_of(&outcome);
        assert!(report.contains("Exit code: 2"));
        assert!(report.contains("Slot 1: archive writer exited with code 2: tar: Error is not recoverable"));
        assert_eq!(h.last_mail().0, "FAILED");
    }

    #[tokio::test]
    async fn test_write_error_runs_cleanup_before_notifying() {
        let mut h = Harness::new(&[("a", 1), ("b", 600_000), ("c", 600_000)], &[1, 2], &[1, 2]);
        h.writer_script = vec![WriterBehaviour::Error];
        let (outcome, orchestrator) = h.run().await;

        assert_eq!(
            outcome,
            RunOutcome::Fatal {
                phase: RunPhase::WriteArchive(1),
                error: "Archive error: tape device vanished".to_string(),
            }
        );
        assert_eq!(outcome.exit_code(), 1);

        let events = h.events();
        let tail = &events[events.len() - 3..];
        assert_eq!(tail, &["unload 1", "snapshot remove", "notify ERROR"]);
        // slot 2 is never touched
        assert!(!events.contains(&"load 2".to_string()));

        let (_, body) = h.last_mail();
        assert!(body.starts_with("An error occurred during WRITE_ARCHIVE(1):"));
        assert_eq!(
            &orchestrator.history()[orchestrator.history().len() - 2..],
            &[RunPhase::Cleanup, RunPhase::FailedTerminal]
        );
    }

    #[tokio::test]
    async fn test_no_full_slots_moves_nothing() {
        let mut h = Harness::new(&[("a", 10), ("b", 20)], &[1, 2, 3], &[]);
        let (outcome, _) = h.run().await;

        assert_eq!(status_of(&outcome), RunStatus::Error);
        assert!(h.hardware_events().is_empty());
        assert!(!h.events().contains(&"write".to_string()));
        assert!(h.events().contains(&"snapshot remove".to_string()));
        assert!(report_of(&outcome).contains("'a', 'b'"));
    }

    #[tokio::test]
    async fn test_tape_left_in_drive_is_unloaded_first() {
        let mut h = Harness::new(&[("a", 10)], &[1], &[1]);
        h.initially_loaded = Some(5);
        let (outcome, _) = h.run().await;

        assert_eq!(status_of(&outcome), RunStatus::Success);
        assert_eq!(h.hardware_events(), vec!["unload 5", "load 1", "unload 1"]);
    }

    #[tokio::test]
    async fn test_dry_run_skips_writer_but_moves_tapes() {
        let mut h = Harness::new(&[("a", 10)], &[1], &[1]);
        h.config.dry_run = true;
        let (outcome, _) = h.run().await;

        assert_eq!(status_of(&outcome), RunStatus::Success);
        assert!(!h.events().contains(&"write".to_string()));
        assert_eq!(h.hardware_events(), vec!["load 1", "unload 1"]);
        let (subject, body) = h.last_mail();
        assert_eq!(subject, "TRY-MODE - SUCCESS");
        assert!(body.contains("Exit code: 0"));
    }

    #[tokio::test]
    async fn test_missing_changer_aborts_before_any_mutation() {
        let mut h = Harness::new(&[("a", 10)], &[1], &[1]);
        h.discover_fails = true;
        let (outcome, _) = h.run().await;

        match &outcome {
            RunOutcome::Fatal { phase, error } => {
                assert_eq!(*phase, RunPhase::DiscoverDevice);
                assert!(error.starts_with("Configuration error"));
            }
            other => panic!("expected fatal outcome, got {:?}", other),
        }
        assert_eq!(h.events(), vec!["discover", "notify ERROR"]);
    }

    #[tokio::test]
    async fn test_snapshot_failure_still_removes_snapshot() {
        let mut h = Harness::new(&[("a", 10)], &[1], &[1]);
        h.create_fails = true;
        let (outcome, _) = h.run().await;

        assert!(matches!(
            outcome,
            RunOutcome::Fatal {
                phase: RunPhase::SnapshotCreate,
                ..
            }
        ));
        assert_eq!(
            h.events(),
            vec!["discover", "scan", "snapshot create", "snapshot remove", "notify ERROR"]
        );
    }

    #[tokio::test]
    async fn test_failed_cleanup_unload_still_removes_snapshot() {
        let mut h = Harness::new(&[("a", 10)], &[1], &[1]);
        h.writer_script = vec![WriterBehaviour::Error];
        h.unload_fails = true;
        let (outcome, _) = h.run().await;

        // the cleanup failure does not replace the original error
        assert_eq!(
            outcome,
            RunOutcome::Fatal {
                phase: RunPhase::WriteArchive(1),
                error: "Archive error: tape device vanished".to_string(),
            }
        );
        let events = h.events();
        assert_eq!(
            &events[events.len() - 3..],
            &["unload-failed 1", "snapshot remove", "notify ERROR"]
        );
        assert!(h.last_mail().1.contains("tape device vanished"));
    }

    #[tokio::test]
    async fn test_failed_cleanup_remove_keeps_original_error() {
        let mut h = Harness::new(&[("a", 10)], &[1], &[1]);
        h.create_fails = true;
        h.remove_fails = true;
        let (outcome, _) = h.run().await;

        match &outcome {
            RunOutcome::Fatal { phase, error } => {
                assert_eq!(*phase, RunPhase::SnapshotCreate);
                assert!(error.contains("Insufficient free space"));
            }
            other => panic!("expected fatal outcome, got {:?}", other),
        }
        assert_eq!(
            h.events(),
            vec!["discover", "scan", "snapshot create", "snapshot remove", "notify ERROR"]
        );
    }

    #[tokio::test]
    async fn test_snapshot_removal_failure_after_loop_is_reported() {
        let mut h = Harness::new(&[("a", 10)], &[1], &[1]);
        h.remove_fails = true;
        let (outcome, orchestrator) = h.run().await;

        assert_eq!(status_of(&outcome), RunStatus::Failed);
        assert!(report_of(&outcome).contains("Snapshot removal failed"));
        assert!(report_of(&outcome).contains("target is busy"));
        // not retried through cleanup
        assert_eq!(
            h.events().iter().filter(|e| *e == "snapshot remove").count(),
            1
        );
        assert_eq!(h.last_mail().0, "FAILED");
        assert_eq!(orchestrator.phase(), RunPhase::Done);
    }

    #[tokio::test]
    async fn test_unlistable_folder_is_reported_and_run_continues() {
        let mut h = Harness::new(&[("a", 10), ("b", 10)], &[1], &[1]);
        std::fs::remove_dir_all(h.root.join("snap").join("b")).unwrap();
        let (outcome, _) = h.run().await;

        assert_eq!(h.hardware_events(), vec!["load 1", "unload 1"]);
        assert!(h.events().contains(&"write".to_string()));
        let report = report_of(&outcome);
        assert!(report.contains("Slot 1: content index skipped"));
        assert!(report.contains("snap/b"));
    }

    #[tokio::test]
    async fn test_load_failure_skips_slot_and_continues() {
        let mut h = Harness::new(&[("a", 600_000), ("b", 600_000)], &[1, 2], &[1, 2]);
        h.failing_loads = [1].into_iter().collect();
        let (outcome, _) = h.run().await;

        assert_eq!(status_of(&outcome), RunStatus::Failed);
        assert_eq!(
            h.hardware_events(),
            vec!["load-failed 1", "unload 1", "load 2", "unload 2"]
        );
        assert_eq!(h.events().iter().filter(|e| *e == "write").count(), 1);
        assert!(report_of(&outcome).contains("Slot 1: loading failed"));
    }

    #[tokio::test]
    async fn test_interrupt_during_write_cleans_up() {
        let mut h = Harness::new(&[("a", 10)], &[1], &[1]);
        h.writer_script = vec![WriterBehaviour::Hang];
        let mut orchestrator = h.orchestrator();
        let outcome = orchestrator
            .run_until(tokio::time::sleep(Duration::from_millis(50)))
            .await;

        assert_eq!(
            outcome,
            RunOutcome::Fatal {
                phase: RunPhase::WriteArchive(1),
                error: "Interrupted by signal".to_string(),
            }
        );
        let events = h.events();
        assert_eq!(
            &events[events.len() - 3..],
            &["unload 1", "snapshot remove", "notify ERROR"]
        );
    }

    #[tokio::test]
    async fn test_prefix_groups_and_exclusions_through_the_run() {
        let mut h = Harness::new(
            &[("docs", 10), ("vm_a", 10), ("lost+found", 10), ("vm_b", 10)],
            &[3, 4, 5],
            &[3, 4, 5],
        );
        h.config.source.special_tape_prefixes = vec!["vm".to_string()];
        let (outcome, _) = h.run().await;

        assert_eq!(status_of(&outcome), RunStatus::Success);
        assert_eq!(
            h.hardware_events(),
            vec!["load 3", "unload 3", "load 4", "unload 4"]
        );
        let snap = h.root.join("snap");
        let written: Vec<Vec<PathBuf>> = h
            .sources
            .lock()
            .iter()
            .map(|s| s[1..].to_vec())
            .collect();
        assert_eq!(
            written,
            vec![vec![snap.join("vm_a"), snap.join("vm_b")], vec![snap.join("docs")]]
        );
        assert!(!report_of(&outcome).contains("lost+found"));
    }

    #[test]
    fn test_exit_codes() {
        let ok = RunOutcome::Completed {
            status: RunStatus::Success,
            report: String::new(),
        };
        assert_eq!(ok.exit_code(), 0);
        let degraded = RunOutcome::Completed {
            status: RunStatus::Error,
            report: String::new(),
        };
        assert_eq!(degraded.exit_code(), 1);
        let fatal = RunOutcome::Fatal {
            phase: RunPhase::Init,
            error: String::new(),
        };
        assert_eq!(fatal.exit_code(), 1);
    }
}
