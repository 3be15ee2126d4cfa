use std::{path::Path, time::UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

// signed containers first, then the plain signature formats
pub const DB_EXTENSIONS: &[&str] = &[
    "cvd", "cld", "cud", "hdb", "hsb", "hdu", "hsu", "mdb", "msb", "mdu", "msu", "ndb", "ndu",
    "ldb", "ldu", "idb", "cdb", "cfg", "crb", "cat", "ftm", "fp", "sfp", "ign", "ign2", "pdb",
    "gdb", "wdb", "yar", "yara", "pwdb", "info",
];

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FingerprintEntry {
    pub name: String,
    pub size: u64,
    /// nanoseconds since the Unix epoch
    pub modified: u64,
}

/// Name/size/mtime of every recognized database file, sorted by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(Vec<FingerprintEntry>);

impl Fingerprint {
    pub fn new(mut entries: Vec<FingerprintEntry>) -> Self {
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Fingerprint(entries)
    }

    pub fn entries(&self) -> &[FingerprintEntry] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Human readable database "version": the current file set.
    pub fn version(&self) -> String {
        self.0
            .iter()
            .map(|e| e.name.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }
}

pub fn is_db_file(fname: &str) -> bool {
    if fname.starts_with('.') {
        return false;
    }
    match Path::new(fname).extension().and_then(|ext| ext.to_str()) {
        Some(ext) => DB_EXTENSIONS.contains(&ext),
        None => false,
    }
}

/// Top-level scan of `db_path`. A missing directory gives an empty print.
pub fn compute_fingerprint(db_path: &Path) -> Fingerprint {
    let mut entries = Vec::new();
    let walker = WalkDir::new(db_path)
        .min_depth(1)
        .max_depth(1)
        .follow_links(true)
        .into_iter();
    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        let name = entry.file_name().to_string_lossy().to_string();
        if !is_db_file(&name) {
            continue;
        }
        let meta = match entry.metadata() {
            Ok(m) if m.is_file() => m,
            _ => continue,
        };
        let modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        entries.push(FingerprintEntry {
            name,
            size: meta.len(),
            modified,
        });
    }
    Fingerprint::new(entries)
}
