//! Collaborator tasks: the numeric work the pipeline delegates.
//!
//! The core never touches pixels. Each reduction step is described as a
//! [`TaskRequest`] and handed to a [`ReductionTasks`] implementation, which
//! must write the request's output file or fail with a [`TaskError`].

pub mod command;

pub use command::CommandTasks;

use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("{task} failed: {message}")]
    Failed { task: &'static str, message: String },

    /// Rectification found no valid dispersion solution.
    #[error("no valid dispersion solution: {0}")]
    Wavelength(String),

    /// Extraction could not trace the object.
    #[error("degenerate trace: {0}")]
    Degenerate(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type TaskResult<T> = std::result::Result<T, TaskError>;

#[derive(Debug, Clone, PartialEq)]
pub enum TaskRequest {
    /// Sigma-clipped combination of raw frames (bias or flats).
    CombineFrames {
        inputs: Vec<PathBuf>,
        kappa: f64,
        bias: Option<PathBuf>,
        output: PathBuf,
    },
    NormalizeFlat {
        input: PathBuf,
        order: u32,
        sigma: f64,
        lower: u32,
        upper: u32,
        output: PathBuf,
    },
    PrepareArc {
        input: PathBuf,
        bias: PathBuf,
        output: PathBuf,
    },
    /// Interactive arc-line identification producing a pixel table.
    IdentifyArc {
        arc: PathBuf,
        grism: String,
        reference: Option<PathBuf>,
        order_wl: u32,
        output: PathBuf,
    },
    BuildResponse {
        input: PathBuf,
        arc: PathBuf,
        pixtable: PathBuf,
        bias: PathBuf,
        flat: PathBuf,
        output: PathBuf,
    },
    CorrectRaw {
        input: PathBuf,
        bias: PathBuf,
        flat: PathBuf,
        output: PathBuf,
    },
    Rectify {
        input: PathBuf,
        arc: PathBuf,
        pixtable: PathBuf,
        order_wl: u32,
        order_2d: u32,
        dispaxis: u8,
        output: PathBuf,
    },
    SubtractBackground {
        input: PathBuf,
        order_bg: u32,
        width: u32,
        output: PathBuf,
    },
    RejectCosmics {
        input: PathBuf,
        niter: u32,
        gain: f64,
        read_noise: f64,
        output: PathBuf,
    },
    FluxCalibrate {
        input: PathBuf,
        response: PathBuf,
        output: PathBuf,
    },
    Extract1d {
        input: PathBuf,
        interactive: bool,
        output: PathBuf,
    },
    Combine2d {
        inputs: Vec<PathBuf>,
        output: PathBuf,
    },
}

/// Value bound to a command placeholder. An empty list means "no value".
pub type Placeholders = Vec<(&'static str, Vec<String>)>;

impl TaskRequest {
    /// Task name, also the key of its command in the options file.
    pub fn name(&self) -> &'static str {
        match self {
            TaskRequest::CombineFrames { .. } => "combine-frames",
            TaskRequest::NormalizeFlat { .. } => "normalize-flat",
            TaskRequest::PrepareArc { .. } => "prepare-arc",
            TaskRequest::IdentifyArc { .. } => "identify-arc",
            TaskRequest::BuildResponse { .. } => "build-response",
            TaskRequest::CorrectRaw { .. } => "correct-raw",
            TaskRequest::Rectify { .. } => "rectify",
            TaskRequest::SubtractBackground { .. } => "subtract-background",
            TaskRequest::RejectCosmics { .. } => "reject-cosmics",
            TaskRequest::FluxCalibrate { .. } => "flux-calibrate",
            TaskRequest::Extract1d { .. } => "extract-1d",
            TaskRequest::Combine2d { .. } => "combine-2d",
        }
    }

    pub fn output(&self) -> &Path {
        match self {
            TaskRequest::CombineFrames { output, .. }
            | TaskRequest::NormalizeFlat { output, .. }
            | TaskRequest::PrepareArc { output, .. }
            | TaskRequest::IdentifyArc { output, .. }
            | TaskRequest::BuildResponse { output, .. }
            | TaskRequest::CorrectRaw { output, .. }
            | TaskRequest::Rectify { output, .. }
            | TaskRequest::SubtractBackground { output, .. }
            | TaskRequest::RejectCosmics { output, .. }
            | TaskRequest::FluxCalibrate { output, .. }
            | TaskRequest::Extract1d { output, .. }
            | TaskRequest::Combine2d { output, .. } => output,
        }
    }

    /// Tasks that block on the user and need the terminal.
    pub fn is_interactive(&self) -> bool {
        match self {
            TaskRequest::IdentifyArc { .. } => true,
            TaskRequest::Extract1d { interactive, .. } => *interactive,
            _ => false,
        }
    }

    pub fn placeholders(&self) -> Placeholders {
        let mut out: Placeholders = vec![("output", vec![path(self.output())])];
        match self {
            TaskRequest::CombineFrames {
                inputs, kappa, bias, ..
            } => {
                out.push(("inputs", inputs.iter().map(|p| path(p)).collect()));
                out.push(("kappa", vec![kappa.to_string()]));
                out.push(("bias", bias.iter().map(|p| path(p)).collect()));
            }
            TaskRequest::NormalizeFlat {
                input,
                order,
                sigma,
                lower,
                upper,
                ..
            } => {
                out.push(("input", vec![path(input)]));
                out.push(("order", vec![order.to_string()]));
                out.push(("sigma", vec![sigma.to_string()]));
                out.push(("lower", vec![lower.to_string()]));
                out.push(("upper", vec![upper.to_string()]));
            }
            TaskRequest::PrepareArc { input, bias, .. } => {
                out.push(("input", vec![path(input)]));
                out.push(("bias", vec![path(bias)]));
            }
            TaskRequest::IdentifyArc {
                arc,
                grism,
                reference,
                order_wl,
                ..
            } => {
                out.push(("arc", vec![path(arc)]));
                out.push(("grism", vec![grism.clone()]));
                out.push(("reference", reference.iter().map(|p| path(p)).collect()));
                out.push(("order_wl", vec![order_wl.to_string()]));
            }
            TaskRequest::BuildResponse {
                input,
                arc,
                pixtable,
                bias,
                flat,
                ..
            } => {
                out.push(("input", vec![path(input)]));
                out.push(("arc", vec![path(arc)]));
                out.push(("pixtable", vec![path(pixtable)]));
                out.push(("bias", vec![path(bias)]));
                out.push(("flat", vec![path(flat)]));
            }
            TaskRequest::CorrectRaw {
                input, bias, flat, ..
            } => {
                out.push(("input", vec![path(input)]));
                out.push(("bias", vec![path(bias)]));
                out.push(("flat", vec![path(flat)]));
            }
            TaskRequest::Rectify {
                input,
                arc,
                pixtable,
                order_wl,
                order_2d,
                dispaxis,
                ..
            } => {
                out.push(("input", vec![path(input)]));
                out.push(("arc", vec![path(arc)]));
                out.push(("pixtable", vec![path(pixtable)]));
                out.push(("order_wl", vec![order_wl.to_string()]));
                out.push(("order_2d", vec![order_2d.to_string()]));
                out.push(("dispaxis", vec![dispaxis.to_string()]));
            }
            TaskRequest::SubtractBackground {
                input,
                order_bg,
                width,
                ..
            } => {
                out.push(("input", vec![path(input)]));
                out.push(("order_bg", vec![order_bg.to_string()]));
                out.push(("width", vec![width.to_string()]));
            }
            TaskRequest::RejectCosmics {
                input,
                niter,
                gain,
                read_noise,
                ..
            } => {
                out.push(("input", vec![path(input)]));
                out.push(("niter", vec![niter.to_string()]));
                out.push(("gain", vec![gain.to_string()]));
                out.push(("read_noise", vec![read_noise.to_string()]));
            }
            TaskRequest::FluxCalibrate {
                input, response, ..
            } => {
                out.push(("input", vec![path(input)]));
                out.push(("response", vec![path(response)]));
            }
            TaskRequest::Extract1d {
                input, interactive, ..
            } => {
                out.push(("input", vec![path(input)]));
                let flag = if *interactive {
                    vec!["--interactive".to_string()]
                } else {
                    vec![]
                };
                out.push(("interactive", flag));
            }
            TaskRequest::Combine2d { inputs, .. } => {
                out.push(("inputs", inputs.iter().map(|p| path(p)).collect()));
            }
        }
        out
    }
}

fn path(p: &Path) -> String {
    p.to_string_lossy().into_owned()
}

/// Runs collaborator tasks. Implementations must be synchronous: the
/// pipeline never has two tasks in flight.
pub trait ReductionTasks {
    fn run(&mut self, request: &TaskRequest) -> TaskResult<()>;
}
