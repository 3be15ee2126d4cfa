pub mod fingerprint;
pub mod registry;
pub mod runner;

pub use fingerprint::{compute_fingerprint, Fingerprint, FingerprintEntry};
pub use registry::{subscription, Mailbox, Subscriber, SubscriberId, SubscriberRegistry};
pub use runner::{UpdateRunner, UpdateToolError};

use std::{
    io,
    path::PathBuf,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use anyhow::Result;
use crossbeam_channel::{after, bounded, never, Receiver, Select, Sender, TrySendError};
use log::*;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::{
    config::Settings,
    data_type::{UpdateEvent, UpdateResult, UpdateStatus},
    now_secs,
};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("definition updater stopped")]
pub struct UpdaterStopped;

#[derive(Debug, Clone)]
pub struct UpdaterConfig {
    pub database_path: PathBuf,
    pub interval: Duration,
    pub tool: PathBuf,
    pub config_file: Option<PathBuf>,
    pub update_on_start: bool,
    pub timeout: Duration,
}

impl UpdaterConfig {
    /// `None` when no update tool is configured.
    pub fn from_settings(settings: &Settings) -> Option<Self> {
        let tool = settings.update_tool.clone()?;
        Some(Self {
            database_path: settings.database_path.clone(),
            interval: settings.update_interval(),
            tool,
            config_file: settings.update_config_file.clone(),
            update_on_start: settings.update_on_start,
            timeout: settings.update_timeout(),
        })
    }
}

enum Command {
    Subscribe(Subscriber, Sender<bool>),
    Unsubscribe(SubscriberId, Sender<bool>),
    Stop,
}

/// Owns the update schedule. Runs the update tool on a timer, on start-up
/// if asked, and on [`trigger_now`](Self::trigger_now); compares database
/// fingerprints and broadcasts the outcome to subscribers.
///
/// Clones share the same worker thread.
#[derive(Clone)]
pub struct DefinitionUpdateCoordinator {
    commands: Sender<Command>,
    trigger: Sender<()>,
    status: Arc<RwLock<UpdateStatus>>,
    worker: Arc<Mutex<Option<thread::JoinHandle<()>>>>,
}

impl DefinitionUpdateCoordinator {
    pub fn start(config: UpdaterConfig) -> Result<Self> {
        let fingerprint = compute_fingerprint(&config.database_path);
        info!(
            "[Updater] watching {} every {:?}, current set: [{}]",
            config.database_path.display(),
            config.interval,
            fingerprint.version()
        );
        let status = Arc::new(RwLock::new(UpdateStatus {
            database_path: config.database_path.clone(),
            interval_secs: config.interval.as_secs(),
            subscriber_count: 0,
            updating: false,
            last_update_at: None,
            last_result: None,
            fingerprint: fingerprint.clone(),
        }));

        let (commands_s, commands_r) = bounded(64);
        // one pending trigger is enough, the rest coalesce into it
        let (trigger_s, trigger_r) = bounded(1);
        let worker = UpdateWorker {
            runner: UpdateRunner::new(
                &config.tool,
                config.config_file.as_deref(),
                config.timeout,
            ),
            registry: SubscriberRegistry::new(),
            status: status.clone(),
            fingerprint,
            next_run: Instant::now() + config.interval,
            in_flight: None,
            rerun: false,
            config,
        };
        let handle = thread::Builder::new()
            .name("definition-updater".to_string())
            .spawn(move || worker.work(commands_r, trigger_r))?;

        Ok(Self {
            commands: commands_s,
            trigger: trigger_s,
            status,
            worker: Arc::new(Mutex::new(Some(handle))),
        })
    }

    /// Asks for an update cycle and returns at once. The pending timer is
    /// rescheduled from the end of that cycle. While a run is in flight,
    /// any number of triggers queue exactly one more run.
    pub fn trigger_now(&self) -> Result<(), UpdaterStopped> {
        match self.trigger.try_send(()) {
            Ok(_) | Err(TrySendError::Full(_)) => Ok(()),
            Err(TrySendError::Disconnected(_)) => Err(UpdaterStopped),
        }
    }

    /// Idempotent; succeeds when already subscribed.
    pub fn subscribe(&self, subscriber: Subscriber) -> Result<(), UpdaterStopped> {
        let (s, r) = bounded(1);
        self.request(Command::Subscribe(subscriber, s), r)
    }

    /// Idempotent; succeeds when not subscribed.
    pub fn unsubscribe(&self, id: SubscriberId) -> Result<(), UpdaterStopped> {
        let (s, r) = bounded(1);
        self.request(Command::Unsubscribe(id, s), r)
    }

    /// Subscribes a fresh [`Mailbox`]; dropping it unsubscribes.
    pub fn mailbox(&self) -> Result<Mailbox, UpdaterStopped> {
        let (subscriber, mailbox) = subscription();
        self.subscribe(subscriber)?;
        Ok(mailbox)
    }

    pub fn status(&self) -> UpdateStatus {
        self.status.read().clone()
    }

    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                error!("[Updater] worker panicked");
            }
        }
    }

    fn request(&self, cmd: Command, reply: Receiver<bool>) -> Result<(), UpdaterStopped> {
        self.commands.send(cmd).map_err(|_| UpdaterStopped)?;
        reply.recv().map(|_| ()).map_err(|_| UpdaterStopped)
    }
}

struct UpdateWorker {
    config: UpdaterConfig,
    runner: UpdateRunner,
    registry: SubscriberRegistry,
    status: Arc<RwLock<UpdateStatus>>,
    fingerprint: Fingerprint,
    next_run: Instant,
    /// result of the tool run currently on the `update-tool` thread
    in_flight: Option<Receiver<Result<String, UpdateToolError>>>,
    rerun: bool,
}

impl UpdateWorker {
    fn work(mut self, commands: Receiver<Command>, trigger: Receiver<()>) {
        if self.config.update_on_start {
            self.begin_cycle();
        }
        loop {
            let monitors = self.registry.monitors();
            // the timer is paused while a run is in flight
            let (timer, running) = match &self.in_flight {
                Some(running) => (never(), running.clone()),
                None => (
                    after(self.next_run.saturating_duration_since(Instant::now())),
                    never(),
                ),
            };

            let mut sel = Select::new();
            sel.recv(&commands);
            sel.recv(&trigger);
            sel.recv(&timer);
            sel.recv(&running);
            for (_, monitor) in &monitors {
                sel.recv(monitor);
            }

            let op = sel.select();
            match op.index() {
                0 => match op.recv(&commands) {
                    Ok(Command::Subscribe(subscriber, reply)) => {
                        let added = self.registry.subscribe(subscriber);
                        self.sync_subscriber_count();
                        let _ = reply.send(added);
                    }
                    Ok(Command::Unsubscribe(id, reply)) => {
                        let removed = self.registry.unsubscribe(id);
                        self.sync_subscriber_count();
                        let _ = reply.send(removed);
                    }
                    // every client handle is gone
                    Ok(Command::Stop) | Err(_) => break,
                },
                1 => match op.recv(&trigger) {
                    Ok(_) if self.in_flight.is_some() => {
                        debug!("[Updater] update in progress, one more run queued");
                        self.rerun = true;
                    }
                    Ok(_) => {
                        info!("[Updater] manual update triggered");
                        self.begin_cycle();
                    }
                    Err(_) => break,
                },
                2 => {
                    let _ = op.recv(&timer);
                    self.begin_cycle();
                }
                3 => {
                    let result = op.recv(&running).unwrap_or_else(|_| {
                        Err(UpdateToolError::Io(io::Error::new(
                            io::ErrorKind::Other,
                            "update tool thread exited without a result",
                        )))
                    });
                    self.finish_cycle(result);
                }
                i => {
                    let (id, monitor) = &monitors[i - 4];
                    // lifelines never carry a message, only hang up
                    let _ = op.recv(monitor);
                    self.registry.on_liveness_lost(*id);
                    self.sync_subscriber_count();
                }
            }
        }
        if self.in_flight.is_some() {
            // the tool thread finishes on its own, nobody reads its result
            warn!("[Updater] stopped while {} was running", self.runner.tool().display());
        }
        info!("[Updater] stopped");
    }

    fn begin_cycle(&mut self) {
        self.status.write().updating = true;
        let (done_s, done_r) = bounded(1);
        let runner = self.runner.clone();
        let database_path = self.config.database_path.clone();
        let spawned = thread::Builder::new()
            .name("update-tool".to_string())
            .spawn(move || {
                let _ = done_s.send(runner.run(&database_path));
            });
        match spawned {
            Ok(_) => self.in_flight = Some(done_r),
            Err(e) => self.finish_cycle(Err(UpdateToolError::Spawn(e))),
        }
    }

    fn finish_cycle(&mut self, run: Result<String, UpdateToolError>) {
        self.in_flight = None;
        let database_path = self.config.database_path.clone();
        let previous_fingerprint = self.fingerprint.clone();

        let result = match run {
            Err(e) => {
                let reason = e.to_string();
                warn!("[Updater] update failed: {}", reason);
                self.registry.broadcast(&UpdateEvent::UpdateFailed {
                    database_path,
                    reason: reason.clone(),
                    timestamp: now_secs(),
                });
                UpdateResult::Error(reason)
            }
            Ok(output) => {
                debug!("[Updater] update tool output: {}", output);
                let fingerprint = compute_fingerprint(&database_path);
                if fingerprint == previous_fingerprint {
                    info!("[Updater] database up to date");
                    UpdateResult::UpToDate
                } else {
                    info!(
                        "[Updater] database changed: [{}] -> [{}]",
                        previous_fingerprint.version(),
                        fingerprint.version()
                    );
                    self.fingerprint = fingerprint.clone();
                    let delivered = self.registry.broadcast(&UpdateEvent::Updated {
                        database_path,
                        fingerprint,
                        previous_fingerprint,
                        timestamp: now_secs(),
                    });
                    debug!("[Updater] update event delivered to {} subscribers", delivered);
                    UpdateResult::Updated
                }
            }
        };

        {
            let mut status = self.status.write();
            // stays set across a queued rerun
            status.updating = self.rerun;
            status.last_update_at = Some(now_secs());
            status.last_result = Some(result);
            status.fingerprint = self.fingerprint.clone();
        }
        self.next_run = Instant::now() + self.config.interval;
        if self.rerun {
            self.rerun = false;
            self.begin_cycle();
        }
    }

    fn sync_subscriber_count(&self) {
        self.status.write().subscriber_count = self.registry.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::updater::runner::tests::script;
    use crossbeam_channel::RecvTimeoutError;
    use std::{fs, path::Path};

    const DEADLINE: Duration = Duration::from_secs(10);
    const QUIET: Duration = Duration::from_millis(300);

    fn config(db: &Path, tool: PathBuf) -> UpdaterConfig {
        UpdaterConfig {
            database_path: db.to_path_buf(),
            interval: Duration::from_secs(3600),
            tool,
            config_file: None,
            update_on_start: false,
            timeout: Duration::from_secs(10),
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let started = Instant::now();
        while started.elapsed() < DEADLINE {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    fn wait_result(updater: &DefinitionUpdateCoordinator) -> UpdateResult {
        assert!(wait_until(|| updater.status().last_result.is_some()));
        updater.status().last_result.unwrap()
    }

    // database dir plus a separate dir for fake tools
    fn dirs() -> (tempfile::TempDir, tempfile::TempDir) {
        let db = tempfile::tempdir().unwrap();
        fs::write(db.path().join("daily.ndb"), "Old-Sig:0:*:deadbeef\n").unwrap();
        (db, tempfile::tempdir().unwrap())
    }

    #[test]
    fn unchanged_database_is_up_to_date() {
        let (db, bin) = dirs();
        let tool = script(bin.path(), "noop.sh", "exit 0");
        let updater = DefinitionUpdateCoordinator::start(config(db.path(), tool)).unwrap();
        let mailbox = updater.mailbox().unwrap();

        updater.trigger_now().unwrap();
        assert_eq!(wait_result(&updater), UpdateResult::UpToDate);
        assert_eq!(mailbox.recv_timeout(QUIET), Err(RecvTimeoutError::Timeout));
        let status = updater.status();
        assert!(status.last_update_at.is_some());
        assert!(!status.updating);
        assert_eq!(status.version(), "daily.ndb");
        updater.stop();
    }

    #[test]
    fn new_file_is_broadcast_as_update() {
        let (db, bin) = dirs();
        let tool = script(
            bin.path(),
            "fetch.sh",
            "echo 'New-Sig:0:*:cafebabe' > \"${1#--datadir=}/extra.ndb\"",
        );
        let updater = DefinitionUpdateCoordinator::start(config(db.path(), tool)).unwrap();
        let mailbox = updater.mailbox().unwrap();

        updater.trigger_now().unwrap();
        match mailbox.recv_timeout(DEADLINE).unwrap() {
            UpdateEvent::Updated {
                database_path,
                fingerprint,
                previous_fingerprint,
                ..
            } => {
                assert_eq!(database_path, db.path());
                assert_ne!(fingerprint, previous_fingerprint);
                assert_eq!(fingerprint.version(), "daily.ndb,extra.ndb");
                assert_eq!(previous_fingerprint.version(), "daily.ndb");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(wait_result(&updater), UpdateResult::Updated);
        assert_eq!(updater.status().fingerprint, compute_fingerprint(db.path()));
        updater.stop();
    }

    #[test]
    fn failing_tool_is_broadcast_as_failure() {
        let (db, bin) = dirs();
        let tool = script(bin.path(), "fail.sh", "echo 'mirror unreachable' >&2; exit 2");
        let updater = DefinitionUpdateCoordinator::start(config(db.path(), tool)).unwrap();
        let before = updater.status().fingerprint;
        let mailbox = updater.mailbox().unwrap();

        updater.trigger_now().unwrap();
        match mailbox.recv_timeout(DEADLINE).unwrap() {
            UpdateEvent::UpdateFailed {
                database_path,
                reason,
                ..
            } => {
                assert_eq!(database_path, db.path());
                assert!(reason.contains("mirror unreachable"), "{}", reason);
            }
            other => panic!("unexpected {:?}", other),
        }
        match wait_result(&updater) {
            UpdateResult::Error(reason) => assert!(reason.contains("exit code 2"), "{}", reason),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(updater.status().fingerprint, before);
        updater.stop();
    }

    #[test]
    fn runs_on_start_and_on_timer() {
        let (db, bin) = dirs();
        let runs = bin.path().join("runs");
        let tool = script(
            bin.path(),
            "count.sh",
            &format!("echo run >> {}", runs.display()),
        );
        let mut cfg = config(db.path(), tool);
        cfg.update_on_start = true;
        cfg.interval = Duration::from_millis(100);
        let updater = DefinitionUpdateCoordinator::start(cfg).unwrap();

        let count = || {
            fs::read_to_string(&runs)
                .map(|s| s.lines().count())
                .unwrap_or(0)
        };
        assert!(wait_until(|| count() >= 3));
        updater.stop();
    }

    #[test]
    fn triggers_coalesce_while_updating() {
        let (db, bin) = dirs();
        let runs = bin.path().join("runs");
        let tool = script(
            bin.path(),
            "slow.sh",
            &format!("echo run >> {}; sleep 0.3", runs.display()),
        );
        let updater = DefinitionUpdateCoordinator::start(config(db.path(), tool)).unwrap();
        for _ in 0..10 {
            updater.trigger_now().unwrap();
        }
        assert_eq!(wait_result(&updater), UpdateResult::UpToDate);
        assert!(wait_until(|| !updater.status().updating));
        thread::sleep(Duration::from_millis(800));
        let runs = fs::read_to_string(&runs).unwrap().lines().count();
        assert!((1..=2).contains(&runs), "{} runs", runs);
        updater.stop();
    }

    #[test]
    fn trigger_during_run_queues_one_more() {
        let (db, bin) = dirs();
        let runs = bin.path().join("runs");
        let tool = script(
            bin.path(),
            "slow.sh",
            &format!("echo run >> {}; sleep 0.3", runs.display()),
        );
        let updater = DefinitionUpdateCoordinator::start(config(db.path(), tool)).unwrap();
        updater.trigger_now().unwrap();
        assert!(wait_until(|| updater.status().updating));
        for _ in 0..5 {
            updater.trigger_now().unwrap();
        }
        let count = || {
            fs::read_to_string(&runs)
                .map(|s| s.lines().count())
                .unwrap_or(0)
        };
        assert!(wait_until(|| count() == 2));
        assert!(wait_until(|| !updater.status().updating));
        thread::sleep(Duration::from_millis(600));
        assert_eq!(count(), 2);
        updater.stop();
    }

    #[test]
    fn long_update_keeps_commands_responsive() {
        let (db, bin) = dirs();
        let tool = script(bin.path(), "slow.sh", "sleep 2");
        let mut cfg = config(db.path(), tool);
        cfg.update_on_start = true;
        let updater = DefinitionUpdateCoordinator::start(cfg).unwrap();
        assert!(wait_until(|| updater.status().updating));

        let started = Instant::now();
        let mailbox = updater.mailbox().unwrap();
        assert!(started.elapsed() < Duration::from_millis(500), "{:?}", started.elapsed());
        let status = updater.status();
        assert!(status.updating);
        assert_eq!(status.subscriber_count, 1);

        drop(mailbox);
        assert!(wait_until(|| updater.status().subscriber_count == 0));
        assert_eq!(wait_result(&updater), UpdateResult::UpToDate);
        updater.stop();
    }

    #[test]
    fn stop_does_not_wait_for_running_tool() {
        let (db, bin) = dirs();
        let tool = script(bin.path(), "slow.sh", "sleep 5");
        let mut cfg = config(db.path(), tool);
        cfg.update_on_start = true;
        let updater = DefinitionUpdateCoordinator::start(cfg).unwrap();
        assert!(wait_until(|| updater.status().updating));

        let started = Instant::now();
        updater.stop();
        assert!(started.elapsed() < Duration::from_secs(1), "{:?}", started.elapsed());
        assert_eq!(updater.trigger_now(), Err(UpdaterStopped));
    }

    #[test]
    fn duplicate_subscribe_counts_once() {
        let (db, bin) = dirs();
        let tool = script(bin.path(), "noop.sh", "exit 0");
        let updater = DefinitionUpdateCoordinator::start(config(db.path(), tool)).unwrap();
        let (subscriber, _mailbox) = subscription();

        updater.subscribe(subscriber.clone()).unwrap();
        updater.subscribe(subscriber.clone()).unwrap();
        assert_eq!(updater.status().subscriber_count, 1);
        updater.unsubscribe(subscriber.id()).unwrap();
        updater.unsubscribe(subscriber.id()).unwrap();
        assert_eq!(updater.status().subscriber_count, 0);
        updater.stop();
    }

    #[test]
    fn terminated_subscriber_is_removed() {
        let (db, bin) = dirs();
        let tool = script(bin.path(), "noop.sh", "exit 0");
        let updater = DefinitionUpdateCoordinator::start(config(db.path(), tool)).unwrap();
        let keep = updater.mailbox().unwrap();
        let gone = updater.mailbox().unwrap();
        assert_eq!(updater.status().subscriber_count, 2);

        // a subscriber thread that exits without unsubscribing
        thread::spawn(move || drop(gone)).join().unwrap();
        assert!(wait_until(|| updater.status().subscriber_count == 1));
        drop(keep);
        assert!(wait_until(|| updater.status().subscriber_count == 0));
        updater.stop();
    }

    #[test]
    fn stopped_updater_rejects_commands() {
        let (db, bin) = dirs();
        let tool = script(bin.path(), "noop.sh", "exit 0");
        let updater = DefinitionUpdateCoordinator::start(config(db.path(), tool)).unwrap();
        let other = updater.clone();
        updater.stop();
        assert_eq!(other.trigger_now(), Err(UpdaterStopped));
        assert!(other.mailbox().is_err());
        // second stop is a no-op
        other.stop();
    }

    #[test]
    fn settings_without_tool_disable_updates() {
        let mut settings = Settings::default();
        settings.update_tool = None;
        assert!(UpdaterConfig::from_settings(&settings).is_none());
        settings.update_tool = Some(PathBuf::from("/usr/bin/freshclam"));
        settings.update_interval_secs = 60;
        let cfg = UpdaterConfig::from_settings(&settings).unwrap();
        assert_eq!(cfg.interval, Duration::from_secs(60));
        assert_eq!(cfg.tool, PathBuf::from("/usr/bin/freshclam"));
    }
}
