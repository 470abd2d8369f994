//! Failure policy: maps (step, error kind) onto what the scheduler does next.

use crate::error::PipelineError;
use std::fmt;

/// Every place the scheduler can fail, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Step {
    MasterBias,
    CombineFlat,
    NormalizeFlat,
    PrepareArcs,
    Identify,
    Response,
    CorrectRaw,
    Rectify,
    SkySubtraction,
    CosmicRays,
    FluxCalibration,
    Extraction,
    Combination,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::MasterBias => "bias combination",
            Step::CombineFlat => "flat combination",
            Step::NormalizeFlat => "flat normalization",
            Step::PrepareArcs => "arc preparation",
            Step::Identify => "arc line identification",
            Step::Response => "response function",
            Step::CorrectRaw => "bias and flat correction",
            Step::Rectify => "2D rectification",
            Step::SkySubtraction => "background subtraction",
            Step::CosmicRays => "cosmic ray rejection",
            Step::FluxCalibration => "flux calibration",
            Step::Extraction => "1D extraction",
            Step::Combination => "spectral combination",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Flush the log and stop the whole run.
    AbortRun,
    /// Record a warning and carry on with degraded output.
    WarnContinue,
}

/// Decide what an error at `step` means for the run.
pub fn policy_for(step: Step, err: &PipelineError) -> Policy {
    match (step, err) {
        (_, PipelineError::Matching { mandatory: false, .. }) => Policy::WarnContinue,
        (Step::Extraction, PipelineError::Stage { .. }) => Policy::WarnContinue,
        _ => Policy::AbortRun,
    }
}
