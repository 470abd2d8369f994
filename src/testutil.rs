//! Fixtures shared by the unit tests.

use crate::error::{PipelineError, Result};
use crate::frame::{HeaderSource, RawFrame};
use crate::tasks::{ReductionTasks, TaskError, TaskRequest, TaskResult};

use chrono::{NaiveDate, NaiveDateTime};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// 2023-03-01 at `hour`:00.
pub fn at(hour: u32) -> Option<NaiveDateTime> {
    NaiveDate::from_ymd_opt(2023, 3, 1).and_then(|d| d.and_hms_opt(hour, 0, 0))
}

/// A spectroscopic frame with Grism_#4 / Slit_1.0 / no filter.
pub fn frame(path: &str, object: &str) -> RawFrame {
    RawFrame {
        path: PathBuf::from(path),
        object: object.to_string(),
        image_type: "OBJECT".into(),
        obs_mode: "SPECTROSCOPY".into(),
        grism: "Grism_#4".into(),
        slit: "Slit_1.0".into(),
        filter: "Open".into(),
        exptime: 300.0,
        dispaxis: 2,
        date_obs: at(21),
        shape: (2052, 400),
    }
}

/// Header source backed by a fixed set of frames.
#[derive(Debug, Default)]
pub struct MemoryHeaders {
    frames: BTreeMap<PathBuf, RawFrame>,
}

impl MemoryHeaders {
    pub fn new(frames: Vec<RawFrame>) -> Self {
        Self {
            frames: frames.into_iter().map(|f| (f.path.clone(), f)).collect(),
        }
    }
}

impl HeaderSource for MemoryHeaders {
    fn frame(&self, path: &Path) -> Result<RawFrame> {
        self.frames
            .get(path)
            .cloned()
            .ok_or_else(|| PipelineError::classification(path, "no such file"))
    }
}

/// Fake collaborator: writes a placeholder for every output and records
/// which tasks ran. Tasks listed in `failures` fail instead.
#[derive(Default)]
pub struct RecordingTasks {
    pub calls: Vec<&'static str>,
    pub requests: Vec<TaskRequest>,
    failures: BTreeMap<&'static str, fn(&'static str) -> TaskError>,
}

impl RecordingTasks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(mut self, task: &'static str, make: fn(&'static str) -> TaskError) -> Self {
        self.failures.insert(task, make);
        self
    }

    pub fn count(&self, task: &str) -> usize {
        self.calls.iter().filter(|c| **c == task).count()
    }
}

impl ReductionTasks for RecordingTasks {
    fn run(&mut self, request: &TaskRequest) -> TaskResult<()> {
        let task = request.name();
        self.calls.push(task);
        self.requests.push(request.clone());
        if let Some(make) = self.failures.get(task) {
            return Err(make(task));
        }
        if let Some(parent) = request.output().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(request.output(), task)?;
        Ok(())
    }
}
