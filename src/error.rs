//! Error taxonomy for the reduction pipeline.
//!
//! Library code returns [`Result`]; the CLI wraps it in `anyhow` for context.
//! Whether an error aborts the run or is only recorded as a warning is
//! decided by [`crate::policy::policy_for`].

use crate::frame::Tag;
use crate::policy::Step;
use crate::tasks::TaskError;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Missing or invalid dataset root, options file or object selection.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A frame header could not be read or fits no classification rule.
    #[error("cannot classify {}: {reason}", path.display())]
    Classification { path: PathBuf, reason: String },

    /// No calibration product of `tag` is compatible with the science frame.
    #[error("no {tag} frame matches {} ({})", science.display(), if *mandatory { "mandatory" } else { "optional" })]
    Matching {
        tag: Tag,
        science: PathBuf,
        mandatory: bool,
    },

    /// A collaborator task failed while running `step`.
    #[error("{step} failed: {source}")]
    Stage {
        step: Step,
        #[source]
        source: TaskError,
    },

    /// No solvable dispersion model; needs manual re-identification.
    #[error("wavelength calibration impossible: {0}")]
    Wavelength(String),

    /// A persisted catalog or status file is malformed.
    #[error("malformed {}: {reason}", path.display())]
    Database { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn config<E: std::fmt::Display>(e: E) -> Self {
        Self::Configuration(e.to_string())
    }

    pub fn classification<E: std::fmt::Display>(path: impl Into<PathBuf>, e: E) -> Self {
        Self::Classification {
            path: path.into(),
            reason: e.to_string(),
        }
    }

    pub fn database<E: std::fmt::Display>(path: impl Into<PathBuf>, e: E) -> Self {
        Self::Database {
            path: path.into(),
            reason: e.to_string(),
        }
    }

    /// Wrap a task failure; a failed dispersion solution keeps its own kind.
    pub fn stage(step: Step, source: TaskError) -> Self {
        match source {
            TaskError::Wavelength(msg) => Self::Wavelength(msg),
            source => Self::Stage { step, source },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rectify_wavelength_failure_keeps_its_kind() {
        let err = PipelineError::stage(Step::Rectify, TaskError::Wavelength("rms 4.2".into()));
        assert!(matches!(err, PipelineError::Wavelength(ref m) if m == "rms 4.2"));

        let err = PipelineError::stage(
            Step::SkySubtraction,
            TaskError::Failed {
                task: "subtract-background",
                message: "exit 1".into(),
            },
        );
        assert!(matches!(err, PipelineError::Stage { step: Step::SkySubtraction, .. }));
    }

    #[test]
    fn matching_message_names_the_policy_class() {
        let err = PipelineError::Matching {
            tag: Tag::Response,
            science: PathBuf::from("sci.fits"),
            mandatory: false,
        };
        assert_eq!(
            err.to_string(),
            "no RESPONSE frame matches sci.fits (optional)"
        );
    }
}
