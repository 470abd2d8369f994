//! Reduction scheduler: calibrations, then every OB, then combination.
//!
//! Work is visited in a fixed order (target, then setup, then OB ordinal in
//! database order) and strictly one task at a time. Each OB gets its own
//! directory, which is also its key in the OB status store:
//!
//! spectra/SN2023abc/Grism_#4_Slit1.0/ob1/
//!     CORR2D_SN2023abc.fits   bias and flat corrected
//!     RECT2D_SN2023abc.fits   rectified, wavelength calibrated
//!     SKYSUB2D_SN2023abc.fits
//!     CRR_SKYSUB2D_SN2023abc.fits
//!     FLUX2D_SN2023abc.fits   flux calibrated (or a link to the previous)
//!     FLUX1D_SN2023abc.fits
//!     pipeline.log
//!
//! Failures follow [`crate::policy::policy_for`]: a missing optional
//! calibration or a failed extraction is a warning, anything else aborts the
//! run with the log flushed.

mod calibs;

use crate::combine::{CombineOutcome, Combiner, link_file};
use crate::config::PipelineConfig;
use crate::database::TaggedDatabase;
use crate::error::{PipelineError, Result};
use crate::frame::{HeaderSource, InstrumentSetup, RawFrame, Tag};
use crate::matcher::{Criteria, Matcher, TieBreak};
use crate::obstatus::{ObStatus, ObStatusStore};
use crate::policy::Step;
use crate::report::{LOG_NAME, Report};
use crate::stage::StageRunner;
use crate::state::PipelineState;
use crate::tasks::{ReductionTasks, TaskRequest};

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use tracing::debug;

/// Responses are matched on grism and filter; standards use a wide slit.
const RESPONSE_MATCH: Criteria = Criteria {
    grism: true,
    slit: false,
    filter: true,
};

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Reprocess OBs already marked DONE and rebuild combined products.
    pub force: bool,
    /// Restrict the run to these objects (implies `force`).
    pub objects: Vec<String>,
    pub make_bias: bool,
    pub make_flat: bool,
    pub make_arcs: bool,
    pub make_response: bool,
}

impl RunOptions {
    /// Any `make_*` flag: rebuild calibrations and stop there.
    pub fn rebuilds_calibrations(&self) -> bool {
        self.make_bias || self.make_flat || self.make_arcs || self.make_response
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub calibrations_only: bool,
    pub reduced: usize,
    pub skipped: usize,
    pub combined: usize,
    pub linked: usize,
    pub warnings: usize,
}

/// One science exposure of a (target, setup) group.
#[derive(Debug, Clone)]
pub struct ObservationBlock {
    pub target: String,
    pub setup: String,
    /// 1-based ordinal within the group.
    pub index: usize,
    pub frame: RawFrame,
    pub dir: PathBuf,
}

impl ObservationBlock {
    /// Key in the OB status store.
    pub fn key(&self) -> String {
        self.dir.display().to_string()
    }

    fn product(&self, prefix: &str) -> PathBuf {
        self.dir.join(format!("{}_{}.fits", prefix, self.target))
    }
}

/// target -> setup -> OBs in database order.
pub type Groups = BTreeMap<String, BTreeMap<String, Vec<ObservationBlock>>>;

pub struct Pipeline<'a> {
    config: &'a PipelineConfig,
    headers: &'a dyn HeaderSource,
    tasks: &'a mut dyn ReductionTasks,
    report: Report,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        config: &'a PipelineConfig,
        headers: &'a dyn HeaderSource,
        tasks: &'a mut dyn ReductionTasks,
    ) -> Self {
        Self {
            config,
            headers,
            tasks,
            report: Report::new(),
        }
    }

    pub fn run(&mut self, options: &RunOptions) -> Result<RunSummary> {
        match self.execute(options) {
            Ok(mut summary) => {
                summary.warnings = self.report.warnings();
                Ok(summary)
            }
            Err(err) => {
                self.report.fatal(&err);
                Err(err)
            }
        }
    }

    fn execute(&mut self, options: &RunOptions) -> Result<RunSummary> {
        let config = self.config;
        if !config.dataset.is_file() {
            return Err(PipelineError::Configuration(format!(
                "dataset does not exist: {}",
                config.dataset.display()
            )));
        }
        let mut db = TaggedDatabase::load(&config.dataset)?;
        self.report.set_file(config.output_dir.join(LOG_NAME));
        self.report
            .write(format!("Loaded classification database: {}", config.dataset.display()));

        if !db.has_tag(Tag::ScienceObject) {
            return Err(PipelineError::Configuration(format!(
                "no {} frames in {}; check the classification",
                Tag::ScienceObject,
                config.dataset.display()
            )));
        }
        let science = self.science_frames(&db)?;
        self.list_frames(&science);

        let runner = StageRunner::new(&config.dataset);
        let mut state = PipelineState::new(config.output_dir.join("arcs"), &config.calib_dir);
        self.calibrations(&runner, &mut db, &mut state, &science, options)?;
        self.report.save()?;

        let mut summary = RunSummary::default();
        if options.rebuilds_calibrations() {
            self.report.write("Static calibrations finished");
            self.report.save()?;
            summary.calibrations_only = true;
            return Ok(summary);
        }

        let force = options.force || !options.objects.is_empty();
        let selected = select_objects(science, &options.objects)?;
        let groups = self.group(selected);

        let store = ObStatusStore::new(config.ob_status_path());
        if store.exists() {
            self.report.write(format!("Loaded OB database: {}", store.path().display()));
        } else {
            self.report.write(format!("Initiated OB database: {}", store.path().display()));
        }
        let keys: Vec<String> = groups
            .values()
            .flat_map(|setups| setups.values())
            .flatten()
            .map(ObservationBlock::key)
            .collect();
        let added = store.register(keys.iter().map(String::as_str))?;
        self.report.write(format!("Registered {} new OBs", added));
        self.report.save()?;

        for (target, setups) in &groups {
            for (setup, obs) in setups {
                for ob in obs {
                    let key = ob.key();
                    let status = store.status(&key)?;
                    if !store.should_process(&key, force)? {
                        self.report
                            .write(format!("Skipping OB {} (status={})", key, status));
                        summary.skipped += 1;
                        continue;
                    }
                    // Products are overwritten from here on; an abort must not
                    // leave the OB looking finished.
                    if status == ObStatus::Done {
                        store.update(&key, ObStatus::Pending)?;
                        self.report.write(format!("Reopening OB {} (forced)", key));
                    }
                    self.reduce_ob(&db, &mut state, &store, ob)?;
                    summary.reduced += 1;
                }
                self.combine(&store, target, setup, force, &mut summary)?;
            }
        }
        Ok(summary)
    }

    fn science_frames(&self, db: &TaggedDatabase) -> Result<Vec<RawFrame>> {
        let matcher = Matcher::new(db, self.headers, &self.config.instrument.no_filter);
        db.files(Tag::ScienceObject)
            .map(|path| matcher.frame(path))
            .collect()
    }

    fn list_frames(&mut self, science: &[RawFrame]) {
        self.report.write("Science frames in the dataset:");
        for frame in science {
            self.report.write(format!(
                "{:>20}  {:>9}  {:>11}  {:>6.0}  {}",
                frame.object,
                frame.grism,
                frame.slit,
                frame.exptime,
                frame.path.display()
            ));
        }
    }

    /// Group science frames by target and setup and assign OB directories.
    pub fn group(&self, frames: Vec<RawFrame>) -> Groups {
        let no_filter = &self.config.instrument.no_filter;
        let mut groups = Groups::new();
        for frame in frames {
            let target = frame.target_name();
            let setup = InstrumentSetup::of(&frame, no_filter).to_string();
            let obs = groups
                .entry(target.clone())
                .or_default()
                .entry(setup.clone())
                .or_default();
            let index = obs.len() + 1;
            let dir = self
                .config
                .output_dir
                .join(&target)
                .join(&setup)
                .join(format!("ob{}", index));
            obs.push(ObservationBlock {
                target,
                setup,
                index,
                frame,
                dir,
            });
        }
        groups
    }

    /// The per-OB chain. Marks the OB DONE when every stage succeeded or
    /// was downgraded to a warning.
    fn reduce_ob(
        &mut self,
        db: &TaggedDatabase,
        state: &mut PipelineState,
        store: &ObStatusStore,
        ob: &ObservationBlock,
    ) -> Result<()> {
        let config = self.config;
        fs::create_dir_all(&ob.dir)?;
        self.report.clear();
        self.report.set_file(ob.dir.join(LOG_NAME));
        self.report.write(format!("Reducing OB {}", ob.key()));
        self.report.write(format!(
            "Target: {}  Setup: {}  OB: {}  Input: {}",
            ob.target,
            ob.setup,
            ob.index,
            ob.frame.path.display()
        ));

        let matcher = Matcher::new(db, self.headers, &config.instrument.no_filter);
        let science = &ob.frame;
        let bias = require(&matcher, science, Tag::MasterBias, Criteria::ANY, TieBreak::All)?;
        let flat = require(&matcher, science, Tag::FlatNormalized, Criteria::SETUP, TieBreak::All)?;
        let arc = require(
            &matcher,
            science,
            Tag::ArcCorrected,
            Criteria::GRISM_SLIT,
            TieBreak::ClosestTime,
        )?;
        let arc_frame = matcher.frame(&arc)?;
        let pixtable = self.pixtable_for(state, &arc_frame)?;
        self.report.write(format!("Pixel table: {}", pixtable.display()));

        let corrected = self.run_task(
            Step::CorrectRaw,
            TaskRequest::CorrectRaw {
                input: science.path.clone(),
                bias,
                flat,
                output: ob.product("CORR2D"),
            },
        )?;

        let rectified = self.run_task(
            Step::Rectify,
            TaskRequest::Rectify {
                input: corrected,
                arc,
                pixtable,
                order_wl: config.rectify.order_wl,
                order_2d: config.rectify.order_2d,
                dispaxis: science.dispaxis,
                output: ob.product("RECT2D"),
            },
        )?;

        let skysub = if config.skysub.auto {
            self.run_task(
                Step::SkySubtraction,
                TaskRequest::SubtractBackground {
                    input: rectified,
                    order_bg: config.skysub.order_bg,
                    width: config.skysub.width,
                    output: ob.product("SKYSUB2D"),
                },
            )?
        } else {
            self.report
                .warn("No sky subtraction performed on the 2D spectrum (skysub.auto = false)");
            rectified
        };

        let cleaned = if config.crr.niter > 0 {
            self.run_task(
                Step::CosmicRays,
                TaskRequest::RejectCosmics {
                    input: skysub,
                    niter: config.crr.niter,
                    gain: config.crr.gain,
                    read_noise: config.crr.read_noise,
                    output: ob.product("CRR_SKYSUB2D"),
                },
            )?
        } else {
            skysub
        };

        let flux2d = ob.product("FLUX2D");
        let responses = matcher.find(science, Tag::Response, RESPONSE_MATCH, TieBreak::ClosestTime)?;
        match responses.into_iter().next() {
            Some(response) => {
                self.run_task(
                    Step::FluxCalibration,
                    TaskRequest::FluxCalibrate {
                        input: cleaned,
                        response,
                        output: flux2d.clone(),
                    },
                )?;
            }
            None => {
                let miss = PipelineError::Matching {
                    tag: Tag::Response,
                    science: science.path.clone(),
                    mandatory: false,
                };
                self.report.tolerate(Step::FluxCalibration, miss)?;
                self.report.warn("The spectrum will not be flux calibrated");
                link_file(&cleaned, &flux2d)?;
                self.report
                    .write(format!("Linked {} -> {}", cleaned.display(), flux2d.display()));
            }
        }

        let extract = TaskRequest::Extract1d {
            input: flux2d,
            interactive: config.extract.interactive,
            output: ob.product("FLUX1D"),
        };
        if let Err(err) = self.run_task(Step::Extraction, extract) {
            self.report.tolerate(Step::Extraction, err)?;
            self.report.warn("Automatic extraction failed; try manual extraction");
        }

        store.update(&ob.key(), ObStatus::Done)?;
        self.report.write(format!("OB {} finished: {}", ob.key(), ObStatus::Done));
        self.report.save()
    }

    fn combine(
        &mut self,
        store: &ObStatusStore,
        target: &str,
        setup: &str,
        force: bool,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let config = self.config;
        let group_dir = config.output_dir.join(target).join(setup);
        self.report.clear();
        self.report.set_file(group_dir.join(LOG_NAME));

        let combiner = Combiner::new(&config.output_dir, store, config.extract.interactive);
        match combiner.combine_group(&mut *self.tasks, &mut self.report, target, setup, force) {
            Ok(CombineOutcome::Combined) => summary.combined += 1,
            Ok(CombineOutcome::Linked) => summary.linked += 1,
            Ok(CombineOutcome::UpToDate) | Ok(CombineOutcome::Nothing) => {}
            Err(err) => {
                self.report
                    .warn(format!("Combination of {} {} failed; try again manually", target, setup));
                return Err(err);
            }
        }

        if self.report.lines().is_empty() {
            Ok(())
        } else {
            self.report.save()
        }
    }

    /// Run one collaborator task, logging it; the task's output on success.
    fn run_task(&mut self, step: Step, request: TaskRequest) -> Result<PathBuf> {
        self.report
            .write(format!("Running task: {} ({})", step, request.name()));
        self.tasks
            .run(&request)
            .map_err(|e| PipelineError::stage(step, e))?;
        let output = request.output().to_path_buf();
        self.report.write(format!(" [OUTPUT] - {}", output.display()));
        Ok(output)
    }
}

/// Compatible product of `tag`; none is fatal. Without a time tie-break the
/// first candidate in database order is used.
fn require(
    matcher: &Matcher<'_>,
    science: &RawFrame,
    tag: Tag,
    criteria: Criteria,
    tie_break: TieBreak,
) -> Result<PathBuf> {
    let candidates = matcher.find(science, tag, criteria, tie_break)?;
    let Some(first) = candidates.first() else {
        return Err(PipelineError::Matching {
            tag,
            science: science.path.clone(),
            mandatory: true,
        });
    };
    if candidates.len() > 1 {
        debug!(
            "{} candidates of {} for {}, using {}",
            candidates.len(),
            tag,
            science.path.display(),
            first.display()
        );
    }
    Ok(first.clone())
}

fn select_objects(science: Vec<RawFrame>, objects: &[String]) -> Result<Vec<RawFrame>> {
    if objects.is_empty() {
        return Ok(science);
    }
    let selected: Vec<RawFrame> = science
        .into_iter()
        .filter(|f| {
            objects
                .iter()
                .any(|o| o.trim() == f.object.trim() || *o == f.target_name())
        })
        .collect();
    if selected.is_empty() {
        return Err(PipelineError::Configuration(format!(
            "no science frames match object(s): {}",
            objects.join(", ")
        )));
    }
    Ok(selected)
}
