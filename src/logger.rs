use std::{
    ffi::{OsStr, OsString},
    fs::{self, File, OpenOptions},
    io::{self, BufReader, Read, Write},
    os::unix::fs::OpenOptionsExt,
    path::{Path, PathBuf},
    process, thread,
    time::SystemTime,
};

use chrono::{DateTime, Local};
use crossbeam_channel::{bounded, Receiver, Sender};
use flate2::{bufread::GzEncoder, Compression};
use log::{LevelFilter, Log, Metadata, Record};
use parking_lot::Mutex;

use crate::config::Settings;

pub struct Config {
    pub path: PathBuf,
    pub max_size: u64,
    pub max_backups: usize,
    pub compress: bool,
    pub file_level: LevelFilter,
    /// mirror to stderr; `Off` disables
    pub stderr_level: LevelFilter,
}

impl Config {
    pub fn from_settings(settings: &Settings, stderr_level: LevelFilter) -> anyhow::Result<Self> {
        Ok(Self {
            path: settings.log_path.clone(),
            max_size: settings.log_max_size,
            max_backups: settings.log_max_backups,
            compress: true,
            file_level: settings.level()?,
            stderr_level,
        })
    }
}

struct Output {
    file: Option<File>,
    size: u64,
}

/// Size-rotated file logger. Rotated files get an RFC3339 suffix; a
/// background thread prunes them to `max_backups` and gzips the rest.
pub struct Logger {
    max_size: u64,
    dir: PathBuf,
    filename: OsString,
    output: Mutex<Output>,
    file_level: LevelFilter,
    stderr_level: LevelFilter,
    tx_mill: Sender<()>,
}

impl Logger {
    pub fn new(config: Config) -> Self {
        let dir = config
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
            .to_path_buf();
        let _ = fs::create_dir_all(&dir);
        let filename = config
            .path
            .file_name()
            .map(OsStr::to_os_string)
            .unwrap_or_else(|| OsString::from(format!("{}.log", process::id())));

        let file = match open_log(&dir.join(&filename), false) {
            Ok(f) => Some(f),
            Err(e) => {
                eprintln!("create log file failed: {}", e);
                None
            }
        };
        let size = file
            .as_ref()
            .and_then(|f| f.metadata().ok())
            .map_or(0, |m| m.len());

        let (tx_mill, rx_mill) = bounded::<()>(1);
        let (mill_dir, mill_name) = (dir.clone(), filename.clone());
        let (max_backups, compress) = (config.max_backups, config.compress);
        let _ = thread::Builder::new()
            .name("log-mill".to_string())
            .spawn(move || mill(rx_mill, &mill_dir, &mill_name, max_backups, compress));

        Self {
            max_size: config.max_size,
            dir,
            filename,
            output: Mutex::new(Output { file, size }),
            file_level: config.file_level,
            stderr_level: config.stderr_level,
            tx_mill,
        }
    }

    /// Installs the logger as the global `log` backend.
    pub fn install(self) -> Result<(), log::SetLoggerError> {
        let level = self.file_level.max(self.stderr_level);
        log::set_boxed_logger(Box::new(self))?;
        log::set_max_level(level);
        Ok(())
    }

    fn rotate(&self, output: &mut Output) {
        if !self.dir.exists() {
            let _ = fs::create_dir_all(&self.dir);
        }
        let path = self.dir.join(&self.filename);
        if output.file.is_some() {
            let datetime: DateTime<Local> = SystemTime::now().into();
            let mut rotated = self.filename.clone();
            rotated.push("-");
            rotated.push(datetime.to_rfc3339());
            output.file = match fs::rename(&path, self.dir.join(rotated)) {
                Ok(_) => open_log(&path, true).ok(),
                Err(_) => None,
            };
        } else {
            output.file = open_log(&path, false).ok();
        }
        output.size = 0;
        let _ = self.tx_mill.try_send(());
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.file_level.max(self.stderr_level)
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let datetime: DateTime<Local> = SystemTime::now().into();
        let line = format!(
            "{}\t{}\t{}\t{}:{}\t{}\n",
            datetime.format("%+"),
            record.level().as_str(),
            record.target(),
            record.file().unwrap_or_default(),
            record.line().unwrap_or_default(),
            record.args()
        );
        if record.level() <= self.file_level {
            let mut output = self.output.lock();
            if output.file.is_none() || line.len() as u64 + output.size > self.max_size {
                self.rotate(&mut output);
            }
            if let Some(file) = output.file.as_mut() {
                if file.write_all(line.as_bytes()).is_ok() {
                    output.size += line.len() as u64;
                }
            }
        }
        if record.level() <= self.stderr_level {
            let _ = io::stderr().write_all(line.as_bytes());
        }
    }

    fn flush(&self) {
        if let Some(file) = self.output.lock().file.as_mut() {
            let _ = file.flush();
        }
    }
}

fn open_log(path: &Path, truncate: bool) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.create(true).mode(0o600);
    if truncate {
        options.write(true).truncate(true);
    } else {
        options.append(true);
    }
    options.open(path)
}

// Prunes and compresses rotated files each time a rotation is signalled.
fn mill(rx: Receiver<()>, dir: &Path, filename: &OsStr, max_backups: usize, compress: bool) {
    let prefix = filename.to_string_lossy().to_string();
    for _ in rx {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        let mut backups = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let stamp = match name.strip_prefix(&prefix) {
                Some(rest) => rest.trim_start_matches('-').trim_end_matches(".gz"),
                None => continue,
            };
            if let Ok(datetime) = DateTime::parse_from_rfc3339(stamp) {
                backups.push((entry.path(), datetime));
            }
        }
        backups.sort_by(|a, b| a.1.cmp(&b.1));
        if max_backups > 0 && backups.len() > max_backups {
            let expired = backups.len() - max_backups;
            for (path, _) in backups.drain(..expired) {
                let _ = fs::remove_file(path);
            }
        }
        if compress {
            for (path, _) in &backups {
                if path.extension().map_or(true, |ext| ext != "gz") {
                    let _ = gzip(path);
                }
            }
        }
    }
}

fn gzip(path: &Path) -> io::Result<()> {
    let mut gz = GzEncoder::new(BufReader::new(File::open(path)?), Compression::fast());
    let mut buffer = Vec::new();
    gz.read_to_end(&mut buffer)?;
    let mut target = path.as_os_str().to_os_string();
    target.push(".gz");
    File::create(&target)?.write_all(&buffer)?;
    fs::remove_file(path)
}
