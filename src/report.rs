//! Human-readable run log.
//!
//! Every message goes to `tracing` as it happens and is also buffered, so
//! the lines belonging to one OB (or to the run setup) can be written to a
//! `pipeline.log` next to the products they describe. Fatal paths call
//! [`Report::fatal`], which records the error and flushes the buffer.

use crate::database::write_atomic;
use crate::error::{PipelineError, Result};
use crate::policy::{Policy, Step, policy_for};

use chrono::Local;
use std::fmt::Display;
use std::path::PathBuf;
use tracing::{error, info, warn};

pub const LOG_NAME: &str = "pipeline.log";

#[derive(Debug, Default)]
pub struct Report {
    file: Option<PathBuf>,
    lines: Vec<String>,
    warnings: usize,
}

impl Report {
    pub fn new() -> Self {
        Self::default()
    }

    /// Where the next `save` writes.
    pub fn set_file(&mut self, path: impl Into<PathBuf>) {
        self.file = Some(path.into());
    }

    /// Start a fresh buffer. The warning count is kept for the run summary.
    pub fn clear(&mut self) {
        self.lines.clear();
    }

    pub fn write(&mut self, msg: impl Display) {
        info!("{}", msg);
        self.push("", msg);
    }

    pub fn warn(&mut self, msg: impl Display) {
        warn!("{}", msg);
        self.warnings += 1;
        self.push("[WARNING] ", msg);
    }

    pub fn error(&mut self, msg: impl Display) {
        error!("{}", msg);
        self.push("[ERROR] ", msg);
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn warnings(&self) -> usize {
        self.warnings
    }

    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.file else {
            return Ok(());
        };
        let mut text = self.lines.join("\n");
        text.push('\n');
        write_atomic(path, text.as_bytes())?;
        Ok(())
    }

    /// Keep going after `err` at `step` when the failure policy allows it,
    /// recording a warning; hand the error back otherwise.
    pub fn tolerate(&mut self, step: Step, err: PipelineError) -> Result<()> {
        match policy_for(step, &err) {
            Policy::WarnContinue => {
                self.warn(&err);
                Ok(())
            }
            Policy::AbortRun => Err(err),
        }
    }

    /// Record a fatal error and flush what has been logged so far.
    pub fn fatal(&mut self, err: impl Display) {
        self.error(err);
        self.error("reduction aborted");
        if let Err(e) = self.save() {
            error!("cannot write log: {}", e);
        }
    }

    fn push(&mut self, prefix: &str, msg: impl Display) {
        let stamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        self.lines.push(format!("{} {}{}", stamp, prefix, msg));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn fatal_flushes_the_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ob1").join(LOG_NAME);

        let mut report = Report::new();
        report.set_file(&path);
        report.write("Running task: rectify");
        report.warn("no response function");
        report.fatal("rectify failed: exit status 1");

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].ends_with("Running task: rectify"));
        assert!(lines[1].contains("[WARNING] no response function"));
        assert!(lines[2].contains("[ERROR] rectify failed"));
        assert_eq!(report.warnings(), 1);
    }

    #[test]
    fn only_tolerable_errors_become_warnings() {
        use crate::tasks::TaskError;

        let mut report = Report::new();
        let degenerate = PipelineError::stage(Step::Extraction, TaskError::Degenerate("no trace".into()));
        report.tolerate(Step::Extraction, degenerate).unwrap();
        assert_eq!(report.warnings(), 1);

        let failed = PipelineError::stage(
            Step::Rectify,
            TaskError::Failed {
                task: "rectify",
                message: "exit status 1".into(),
            },
        );
        let err = report.tolerate(Step::Rectify, failed).unwrap_err();
        assert!(matches!(err, PipelineError::Stage { step: Step::Rectify, .. }));
        assert_eq!(report.warnings(), 1);
    }

    #[test]
    fn clear_keeps_the_warning_count() {
        let mut report = Report::new();
        report.warn("one");
        report.clear();
        assert!(report.lines().is_empty());
        assert_eq!(report.warnings(), 1);
        // No file set: nothing to write, not an error.
        report.save().unwrap();
    }
}
