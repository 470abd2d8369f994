//! OB status store: PENDING / DONE / SKIP per OB output location.
//!
//! File format (whitespace-separated, one OB per line):
//! # longslit-redux OB status v1
//! spectra/SN2023abc/Grism_#4_Slit1.0/ob1   DONE
//! spectra/SN2023abc/Grism_#4_Slit1.0/ob2   SKIP
//! spectra/SN2023abc/Grism_#4_Slit1.0/ob3
//!
//! A key without a status is PENDING, so clearing a status by hand is just
//! deleting the word. The file is the only source of truth: every query
//! reloads it and every update rewrites it in full.

use crate::database::write_atomic;
use crate::error::{PipelineError, Result};

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const HEADER: &str = "# longslit-redux OB status v1";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ObStatus {
    #[default]
    Pending,
    Done,
    Skip,
}

impl ObStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObStatus::Pending => "PENDING",
            ObStatus::Done => "DONE",
            ObStatus::Skip => "SKIP",
        }
    }
}

impl fmt::Display for ObStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PENDING" => Ok(ObStatus::Pending),
            "DONE" => Ok(ObStatus::Done),
            "SKIP" => Ok(ObStatus::Skip),
            _ => Err(format!("unknown OB status {:?}", s)),
        }
    }
}

pub type StatusMap = BTreeMap<String, ObStatus>;

#[derive(Debug, Clone)]
pub struct ObStatusStore {
    path: PathBuf,
}

impl ObStatusStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Full status map. A missing file is an empty map.
    pub fn load(&self) -> Result<StatusMap> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(StatusMap::new()),
            Err(e) => return Err(e.into()),
        };
        parse_status_file(&text).map_err(|e| PipelineError::database(&self.path, e))
    }

    /// Status of `key`; unknown keys are PENDING.
    pub fn status(&self, key: &str) -> Result<ObStatus> {
        Ok(self.load()?.get(key).copied().unwrap_or_default())
    }

    /// Overwrite the status of `key` and flush the whole map.
    pub fn update(&self, key: &str, status: ObStatus) -> Result<()> {
        let mut map = self.load()?;
        map.insert(key.to_string(), status);
        self.flush(&map)
    }

    /// Record newly seen OBs as PENDING. Returns how many were new.
    pub fn register<'k>(&self, keys: impl IntoIterator<Item = &'k str>) -> Result<usize> {
        let mut map = self.load()?;
        let mut added = 0;
        for key in keys {
            if !map.contains_key(key) {
                map.insert(key.to_string(), ObStatus::Pending);
                added += 1;
            }
        }
        if added > 0 || !self.exists() {
            self.flush(&map)?;
        }
        Ok(added)
    }

    /// DONE and SKIP are terminal; `force` reopens DONE but never SKIP.
    pub fn should_process(&self, key: &str, force: bool) -> Result<bool> {
        Ok(match self.status(key)? {
            ObStatus::Pending => true,
            ObStatus::Done => force,
            ObStatus::Skip => false,
        })
    }

    fn flush(&self, map: &StatusMap) -> Result<()> {
        let width = map.keys().map(String::len).max().unwrap_or(0);
        let mut out = String::from(HEADER);
        out.push('\n');
        for (key, status) in map {
            out.push_str(&format!("{:<width$}  {}\n", key, status, width = width));
        }
        write_atomic(&self.path, out.as_bytes())?;
        Ok(())
    }
}

fn parse_status_file(text: &str) -> std::result::Result<StatusMap, String> {
    let mut out = StatusMap::new();
    for (lineno, line) in text.lines().enumerate() {
        let lno = lineno + 1;
        let line = line.trim();

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (key, status) = match line.rsplit_once(char::is_whitespace) {
            Some((key, word)) => {
                let status = word
                    .parse::<ObStatus>()
                    .map_err(|e| format!("line {}: {}", lno, e))?;
                (key.trim_end(), status)
            }
            None => (line, ObStatus::Pending),
        };

        if out.insert(key.to_string(), status).is_some() {
            return Err(format!("line {}: duplicate OB {}", lno, key));
        }
    }
    Ok(out)
}
