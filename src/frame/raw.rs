use chrono::NaiveDateTime;
use std::fmt;
use std::path::{Path, PathBuf};

/// Header attributes of one frame on disk. Immutable once classified.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    pub path: PathBuf,
    pub object: String,
    pub image_type: String,
    pub obs_mode: String,
    pub grism: String,
    pub slit: String,
    pub filter: String,
    pub exptime: f64,
    pub dispaxis: u8,
    pub date_obs: Option<NaiveDateTime>,
    pub shape: (usize, usize),
}

impl RawFrame {
    /// Copy of these attributes describing a product written at `path`.
    pub fn derived(&self, path: impl Into<PathBuf>) -> RawFrame {
        RawFrame {
            path: path.into(),
            ..self.clone()
        }
    }

    /// Object name usable as a directory and file name component.
    pub fn target_name(&self) -> String {
        let name: String = self
            .object
            .trim()
            .chars()
            .map(|c| match c {
                c if c.is_whitespace() => '_',
                '/' | '\\' => '-',
                c => c,
            })
            .collect();
        if name.is_empty() {
            "unknown".to_string()
        } else {
            name
        }
    }

    /// File stem, used to key products made from this frame.
    pub fn stem(&self) -> String {
        file_stem(&self.path)
    }
}

pub fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Instrument configuration deciding calibration compatibility.
///
/// The filter only takes part when it is not one of the "no filter"
/// sentinels (open/free/none by default).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstrumentSetup {
    pub grism: String,
    pub slit: String,
    pub filter: Option<String>,
}

impl InstrumentSetup {
    pub fn of(frame: &RawFrame, no_filter: &[String]) -> Self {
        Self {
            grism: frame.grism.clone(),
            slit: frame.slit.clone(),
            filter: active_filter(&frame.filter, no_filter),
        }
    }
}

impl fmt::Display for InstrumentSetup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.grism, self.slit.replace('_', ""))?;
        if let Some(filter) = &self.filter {
            write!(f, "_{}", filter)?;
        }
        Ok(())
    }
}

/// `None` when `filter` is a "no filter" sentinel.
pub fn active_filter(filter: &str, no_filter: &[String]) -> Option<String> {
    let trimmed = filter.trim();
    if trimmed.is_empty() || no_filter.iter().any(|s| s.eq_ignore_ascii_case(trimmed)) {
        None
    } else {
        Some(trimmed.to_string())
    }
}
