use std::{
    fs::File,
    io::{self, BufRead, Write},
    path::{Path, PathBuf},
    process::exit,
    thread,
};

use anyhow::{anyhow, Context, Result};
use clap::{arg, command, value_parser, ArgMatches};
use crossbeam_channel::{bounded, Sender};
use fs2::FileExt;
use log::*;
use signal_hook::{
    consts::{SIGINT, SIGTERM, SIGUSR1},
    iterator::Signals,
};

use clamguard::{
    config::{self, Settings},
    data_type::ScanReport,
    logger::{self, Logger},
    ClamavLibrary, CoordinatorConfig, DefinitionUpdateCoordinator, ScanCoordinator, ScanOptions,
    ScanVerdict, UpdaterConfig,
};

struct ProcessLock {
    _file: File,
}

impl ProcessLock {
    fn acquire(path: &Path) -> Result<Self> {
        let file = File::create(path).with_context(|| format!("create lock {}", path.display()))?;
        file.try_lock_exclusive()
            .map_err(|_| anyhow!("clamguard already running, lock {} is held", path.display()))?;
        Ok(Self { _file: file })
    }
}

fn args() -> ArgMatches {
    command!()
        .arg(
            arg!(-c --config <FILE> "json config file")
                .value_parser(value_parser!(PathBuf))
                .required(false),
        )
        .arg(
            arg!(--datadir <DIR> "signature database directory")
                .value_parser(value_parser!(PathBuf))
                .required(false),
        )
        .arg(
            arg!(--"update-tool" <TOOL> "definition update tool, freshclam compatible")
                .value_parser(value_parser!(PathBuf))
                .required(false),
        )
        .arg(arg!(--"no-update" "never run the update tool"))
        .arg(arg!(--"update-on-start" "run an update before the first timer tick"))
        .arg(
            arg!(--interval <SECS> "seconds between updates")
                .value_parser(value_parser!(u64))
                .required(false),
        )
        .arg(arg!(--"log-level" <LEVEL> "file log level").required(false))
        .arg(
            arg!(--lock <FILE> "single instance lock file")
                .value_parser(value_parser!(PathBuf))
                .default_value(config::SERVICE_PID_LOCK_PATH),
        )
        .arg(arg!(-v --verbose "mirror logs to stderr"))
        .get_matches()
}

fn settings(matches: &ArgMatches) -> Result<Settings> {
    let mut settings = Settings::load(matches.get_one::<PathBuf>("config").map(PathBuf::as_path))?;
    if let Some(dir) = matches.get_one::<PathBuf>("datadir") {
        settings.database_path = dir.clone();
    }
    if let Some(tool) = matches.get_one::<PathBuf>("update-tool") {
        settings.update_tool = Some(tool.clone());
    }
    if matches.get_flag("no-update") {
        settings.update_tool = None;
    }
    if matches.get_flag("update-on-start") {
        settings.update_on_start = true;
    }
    if let Some(secs) = matches.get_one::<u64>("interval") {
        settings.update_interval_secs = *secs;
    }
    if let Some(level) = matches.get_one::<String>("log-level") {
        settings.log_level = level.clone();
    }
    settings.validate()?;
    Ok(settings)
}

fn report(out: &mut impl Write, path: &str, res: &Result<ScanVerdict, clamguard::EngineError>) {
    let report = match res {
        Ok(ScanVerdict::Clean) => ScanReport {
            path,
            verdict: "clean",
            name: None,
            error: None,
        },
        Ok(ScanVerdict::Infected(name)) => ScanReport {
            path,
            verdict: "infected",
            name: Some(name.as_str()),
            error: None,
        },
        Err(e) => ScanReport {
            path,
            verdict: "error",
            name: None,
            error: Some(e.to_string()),
        },
    };
    if let Ok(line) = serde_json::to_string(&report) {
        let _ = writeln!(out, "{}", line);
        let _ = out.flush();
    }
}

fn serve_stdin(scanner: ScanCoordinator, options: ScanOptions, stop: Sender<&'static str>) {
    let stdin = io::stdin();
    let mut out = io::stdout();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                error!("[Main] read stdin: {}", e);
                break;
            }
        };
        let target = line.trim();
        if target.is_empty() {
            continue;
        }
        let res = scanner.scan_file(Path::new(target), options);
        if let Ok(ScanVerdict::Infected(name)) = &res {
            warn!("[Main] {} infected: {}", target, name);
        }
        report(&mut out, target, &res);
    }
    let _ = stop.send("stdin closed");
}

fn run() -> Result<()> {
    let matches = args();
    let settings = settings(&matches)?;
    let stderr_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    };
    Logger::new(logger::Config::from_settings(&settings, stderr_level)?).install()?;

    let lock_path = matches
        .get_one::<PathBuf>("lock")
        .cloned()
        .unwrap_or_else(|| PathBuf::from(config::SERVICE_PID_LOCK_PATH));
    let _lock = ProcessLock::acquire(&lock_path)?;
    info!(
        "[Main] {} {} pid {}",
        config::NAME,
        config::VERSION,
        std::process::id()
    );

    let updater = match UpdaterConfig::from_settings(&settings) {
        Some(cfg) => Some(DefinitionUpdateCoordinator::start(cfg)?),
        None => {
            info!("[Main] no update tool configured, definitions stay as they are");
            None
        }
    };
    let scanner = ScanCoordinator::start::<ClamavLibrary>(
        CoordinatorConfig::from_settings(&settings),
        updater.as_ref(),
    )
    .context("scan coordinator failed to start")?;

    let db_version = scanner.database_version()?;
    match &updater {
        Some(updater) => {
            let status = updater.status();
            info!(
                "[Main] database [{}] version {}, last result {:?}, {} subscribers, libclamav {}",
                status.version(),
                db_version,
                status.last_result,
                status.subscriber_count,
                scanner.library_version()
            );
        }
        None => info!(
            "[Main] database version {}, libclamav {}",
            db_version,
            scanner.library_version()
        ),
    }

    let (stop_s, stop_r) = bounded(2);
    let mut signals = Signals::new([SIGTERM, SIGINT, SIGUSR1])?;
    let signal_updater = updater.clone();
    let signal_stop = stop_s.clone();
    thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            for sig in signals.forever() {
                if sig == SIGUSR1 {
                    match &signal_updater {
                        Some(updater) => {
                            if let Err(e) = updater.trigger_now() {
                                warn!("[Main] update trigger: {}", e);
                            }
                        }
                        None => warn!("[Main] SIGUSR1 ignored, updates disabled"),
                    }
                    continue;
                }
                let _ = signal_stop.send("signal");
                break;
            }
        })?;

    let options = ScanOptions(settings.scan_options);
    let stdin_scanner = scanner.clone();
    thread::Builder::new()
        .name("stdin".to_string())
        .spawn(move || serve_stdin(stdin_scanner, options, stop_s))?;

    let reason = stop_r.recv().unwrap_or("channel closed");
    info!("[Main] stopping: {}", reason);
    scanner.stop();
    if let Some(updater) = updater {
        updater.stop();
    }
    let counters = scanner.reload_stats();
    info!(
        "[Main] exit, {} reloads ok, {} failed",
        counters.succeeded, counters.failed
    );
    log::logger().flush();
    Ok(())
}

fn main() {
    if let Err(e) = run() {
        error!("[Main] {:#}", e);
        eprintln!("clamguard: {:#}", e);
        exit(1);
    }
}
