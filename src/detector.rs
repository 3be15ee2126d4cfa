use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use crossbeam_channel::{bounded, select, Receiver, RecvTimeoutError, Sender};
use log::*;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    config::{Settings, SCAN_QUEUE_SIZE},
    data_type::UpdateEvent,
    model::{
        engine::{EngineError, EngineHandle, NativeLibrary, ScanOptions, ScanVerdict},
        updater::{DefinitionUpdateCoordinator, Mailbox},
    },
};

type Reply<T> = Sender<Result<T, EngineError>>;

enum Request {
    ScanFile {
        path: PathBuf,
        options: ScanOptions,
        reply: Reply<ScanVerdict>,
    },
    ScanBuffer {
        data: Vec<u8>,
        options: ScanOptions,
        reply: Reply<ScanVerdict>,
    },
    Reload {
        path: PathBuf,
        reply: Option<Reply<u32>>,
    },
    DatabaseVersion {
        reply: Reply<u64>,
    },
    Stop,
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub database_path: PathBuf,
    pub queue_size: usize,
    /// Reload on `Updated` events from the updater passed to `start`.
    pub auto_reload: bool,
}

impl CoordinatorConfig {
    pub fn new(database_path: &Path) -> Self {
        Self {
            database_path: database_path.to_path_buf(),
            queue_size: SCAN_QUEUE_SIZE,
            auto_reload: true,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            database_path: settings.database_path.clone(),
            queue_size: settings.scan_queue_size,
            auto_reload: settings.auto_reload,
        }
    }
}

#[derive(Debug, Default)]
struct ReloadStats {
    succeeded: AtomicU64,
    failed: AtomicU64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReloadCounters {
    pub succeeded: u64,
    pub failed: u64,
}

/// Pending reply to a queued scan.
#[derive(Debug)]
pub struct ScanTicket {
    reply: Receiver<Result<ScanVerdict, EngineError>>,
}

impl ScanTicket {
    pub fn wait(self) -> Result<ScanVerdict, EngineError> {
        self.reply.recv().map_err(|_| EngineError::Unavailable)?
    }

    /// `None` if the scan is still queued or running after `timeout`; the
    /// native call itself is never interrupted.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<ScanVerdict, EngineError>> {
        match self.reply.recv_timeout(timeout) {
            Ok(res) => Some(res),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(EngineError::Unavailable)),
        }
    }
}

/// Serialized access to one engine.
///
/// A single worker thread owns the [`EngineHandle`] and serves requests in
/// arrival order, so a reload always lands between two scans, never during
/// one. Update events enter that same queue as reload requests. Clients are
/// cheap clones sharing the queue. For parallel throughput run several
/// coordinators, each with its own engine.
#[derive(Clone)]
pub struct ScanCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    requests: Sender<Request>,
    // worker first, then the reload forwarder if any
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    stats: Arc<ReloadStats>,
    library_version: String,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // the forwarder keeps a sender, so the queue never disconnects on
        // its own when the last client goes away
        let _ = self.requests.send(Request::Stop);
    }
}

impl ScanCoordinator {
    /// Builds the engine from `config.database_path` on a new worker thread.
    /// Any create/load/compile failure is returned here and nothing keeps
    /// running.
    pub fn start<L: NativeLibrary>(
        config: CoordinatorConfig,
        updater: Option<&DefinitionUpdateCoordinator>,
    ) -> Result<Self, EngineError> {
        let mailbox = match updater {
            Some(updater) if config.auto_reload => match updater.mailbox() {
                Ok(mailbox) => Some(mailbox),
                Err(e) => {
                    warn!("[ScanCoordinator] auto reload disabled: {}", e);
                    None
                }
            },
            _ => None,
        };

        let (requests_s, requests_r) = bounded(config.queue_size.max(1));
        let (ready_s, ready_r) = bounded(1);
        // disconnects when the worker exits
        let (alive_s, alive_r) = bounded::<()>(0);
        let stats = Arc::new(ReloadStats::default());
        let worker_stats = stats.clone();
        let handle = thread::Builder::new()
            .name("scan-coordinator".to_string())
            .spawn(move || {
                let _alive = alive_s;
                // the handle is !Send, so it is built where it lives
                let engine = match EngineHandle::<L>::build(&config.database_path) {
                    Ok(engine) => engine,
                    Err(e) => {
                        let _ = ready_s.send(Err(e));
                        return;
                    }
                };
                let _ = ready_s.send(Ok(()));
                ScanWorker {
                    engine,
                    database_path: config.database_path,
                    stats: worker_stats,
                }
                .work(requests_r);
            })
            .map_err(|e| EngineError::Allocation(format!("spawn scan worker: {}", e)))?;

        let started = ready_r.recv().unwrap_or(Err(EngineError::Unavailable));
        if let Err(e) = started {
            error!("[ScanCoordinator] start failed: {}", e);
            let _ = handle.join();
            return Err(e);
        }
        let mut threads = vec![handle];
        if let Some(mailbox) = mailbox {
            let requests = requests_s.clone();
            let spawned = thread::Builder::new()
                .name("scan-reload-forwarder".to_string())
                .spawn(move || forward_updates(mailbox, requests, alive_r));
            match spawned {
                Ok(forwarder) => threads.push(forwarder),
                Err(e) => warn!("[ScanCoordinator] auto reload disabled: {}", e),
            }
        }
        info!("[ScanCoordinator] ready, libclamav {}", L::version());
        Ok(Self {
            inner: Arc::new(Inner {
                requests: requests_s,
                threads: Mutex::new(threads),
                stats,
                library_version: L::version(),
            }),
        })
    }

    pub fn submit_file(
        &self,
        path: &Path,
        options: ScanOptions,
    ) -> Result<ScanTicket, EngineError> {
        let (reply, ticket) = bounded(1);
        self.send(Request::ScanFile {
            path: path.to_path_buf(),
            options,
            reply,
        })?;
        Ok(ScanTicket { reply: ticket })
    }

    pub fn submit_buffer(
        &self,
        data: Vec<u8>,
        options: ScanOptions,
    ) -> Result<ScanTicket, EngineError> {
        let (reply, ticket) = bounded(1);
        self.send(Request::ScanBuffer {
            data,
            options,
            reply,
        })?;
        Ok(ScanTicket { reply: ticket })
    }

    /// Blocks until every earlier request is served and this scan returns.
    pub fn scan_file(
        &self,
        path: &Path,
        options: ScanOptions,
    ) -> Result<ScanVerdict, EngineError> {
        self.submit_file(path, options)?.wait()
    }

    pub fn scan_buffer(
        &self,
        data: &[u8],
        options: ScanOptions,
    ) -> Result<ScanVerdict, EngineError> {
        self.submit_buffer(data.to_vec(), options)?.wait()
    }

    /// Queues a reload and returns. Failure is logged and counted; the
    /// current engine keeps serving.
    pub fn request_reload(&self, database_path: &Path) -> Result<(), EngineError> {
        self.send(Request::Reload {
            path: database_path.to_path_buf(),
            reply: None,
        })
    }

    /// Queued like a scan; returns the new engine's signature count.
    pub fn reload(&self, database_path: &Path) -> Result<u32, EngineError> {
        let (reply, r) = bounded(1);
        self.send(Request::Reload {
            path: database_path.to_path_buf(),
            reply: Some(reply),
        })?;
        r.recv().map_err(|_| EngineError::Unavailable)?
    }

    pub fn database_version(&self) -> Result<u64, EngineError> {
        let (reply, r) = bounded(1);
        self.send(Request::DatabaseVersion { reply })?;
        r.recv().map_err(|_| EngineError::Unavailable)?
    }

    pub fn reload_stats(&self) -> ReloadCounters {
        ReloadCounters {
            succeeded: self.inner.stats.succeeded.load(Ordering::Relaxed),
            failed: self.inner.stats.failed.load(Ordering::Relaxed),
        }
    }

    pub fn library_version(&self) -> &str {
        &self.inner.library_version
    }

    /// Serves what is already queued, then releases the engine and joins
    /// the worker and the reload forwarder.
    pub fn stop(&self) {
        let _ = self.inner.requests.send(Request::Stop);
        let threads: Vec<_> = self.inner.threads.lock().drain(..).collect();
        for handle in threads {
            if handle.join().is_err() {
                error!("[ScanCoordinator] worker panicked");
            }
        }
    }

    fn send(&self, request: Request) -> Result<(), EngineError> {
        self.inner
            .requests
            .send(request)
            .map_err(|_| EngineError::Unavailable)
    }
}

// Turns update events into reload requests behind whatever is queued.
fn forward_updates(mailbox: Mailbox, requests: Sender<Request>, worker_alive: Receiver<()>) {
    let events = mailbox.events().clone();
    loop {
        select! {
            recv(events) -> event => match event {
                Ok(UpdateEvent::Updated { database_path, .. }) => {
                    debug!(
                        "[ScanCoordinator] definitions updated, queueing reload of {}",
                        database_path.display()
                    );
                    let reload = Request::Reload {
                        path: database_path,
                        reply: None,
                    };
                    if requests.send(reload).is_err() {
                        break;
                    }
                }
                Ok(UpdateEvent::UpdateFailed { reason, .. }) => {
                    warn!(
                        "[ScanCoordinator] definition update failed, keeping current engine: {}",
                        reason
                    );
                }
                Err(_) => {
                    info!("[ScanCoordinator] updater gone, auto reload off");
                    break;
                }
            },
            recv(worker_alive) -> _ => break,
        }
    }
}

struct ScanWorker<L: NativeLibrary> {
    engine: EngineHandle<L>,
    database_path: PathBuf,
    stats: Arc<ReloadStats>,
}

impl<L: NativeLibrary> ScanWorker<L> {
    fn work(mut self, requests: Receiver<Request>) {
        for request in requests.iter() {
            match request {
                Request::ScanFile {
                    path,
                    options,
                    reply,
                } => {
                    let _ = reply.send(self.engine.scan_path(&path, options));
                }
                Request::ScanBuffer {
                    data,
                    options,
                    reply,
                } => {
                    let _ = reply.send(self.engine.scan_bytes(&data, options));
                }
                Request::Reload { path, reply } => {
                    let res = self.reload(&path);
                    if let Some(reply) = reply {
                        let _ = reply.send(res);
                    }
                }
                Request::DatabaseVersion { reply } => {
                    let _ = reply.send(self.engine.database_version());
                }
                Request::Stop => break,
            }
        }
        self.engine.release();
        info!("[ScanCoordinator] stopped");
    }

    // The new engine is complete before the current one is touched.
    fn reload(&mut self, db_path: &Path) -> Result<u32, EngineError> {
        info!("[ScanCoordinator] reloading from {}", db_path.display());
        match EngineHandle::<L>::build(db_path) {
            Ok(engine) => {
                let mut old = std::mem::replace(&mut self.engine, engine);
                old.release();
                self.database_path = db_path.to_path_buf();
                self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
                Ok(self.engine.signatures())
            }
            Err(e) => {
                error!(
                    "[ScanCoordinator] reload failed, still serving {}: {}",
                    self.database_path.display(),
                    e
                );
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }
}
