//! Calibration prerequisites and pixel tables.
//!
//! Static calibrations are built through the stage runner, so each exists
//! once per dataset and survives interrupted runs:
//!
//! MBIAS       <- combine-frames over BIAS
//! SFLAT       <- combine-frames over SPEC_FLAT, one per setup
//! NORM_SFLAT  <- normalize-flat over each SFLAT
//! ARC_CORR    <- prepare-arc over each ARC
//! RESPONSE    <- build-response over each SPEC_FLUX-STD (optional)

use super::{Pipeline, RunOptions, require};
use crate::database::TaggedDatabase;
use crate::error::{PipelineError, Result};
use crate::frame::{InstrumentSetup, RawFrame, Tag};
use crate::matcher::{Criteria, Matcher, TieBreak};
use crate::policy::Step;
use crate::stage::StageRunner;
use crate::state::{PipelineState, PixtableKey};
use crate::tasks::TaskRequest;

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;

impl Pipeline<'_> {
    pub(super) fn calibrations(
        &mut self,
        runner: &StageRunner,
        db: &mut TaggedDatabase,
        state: &mut PipelineState,
        science: &[RawFrame],
        options: &RunOptions,
    ) -> Result<()> {
        let config = self.config;
        fs::create_dir_all(config.output_dir.join("arcs"))?;
        fs::create_dir_all(config.output_dir.join("std"))?;

        runner.ensure(db, Tag::MasterBias, options.make_bias, |db| self.master_bias(db))?;
        runner.ensure(db, Tag::FlatCombined, options.make_flat, |db| {
            self.combined_flats(db)
        })?;
        runner.ensure(db, Tag::FlatNormalized, options.make_flat, |db| {
            self.normalized_flats(db)
        })?;
        runner.ensure(db, Tag::ArcCorrected, options.make_arcs, |db| {
            self.corrected_arcs(db)
        })?;

        let arcs = self.frames(db, Tag::ArcCorrected)?;
        let keys: Vec<PixtableKey> = arcs
            .iter()
            .map(|arc| PixtableKey::new(&arc.grism, arc.stem()))
            .collect();
        let found = state.discover(&keys);
        if found > 0 {
            self.report
                .write(format!("Found {} pixel tables from earlier runs", found));
        }
        self.initial_identify(state, &arcs, science)?;

        self.responses(runner, db, state, options.make_response)
    }

    /// Attributes of every frame under `tag`.
    fn frames(&self, db: &TaggedDatabase, tag: Tag) -> Result<Vec<RawFrame>> {
        let matcher = Matcher::new(db, self.headers, &self.config.instrument.no_filter);
        db.files(tag).map(|path| matcher.frame(path)).collect()
    }

    fn master_bias(&mut self, db: &TaggedDatabase) -> Result<Vec<RawFrame>> {
        let config = self.config;
        let raw = self.frames(db, Tag::Bias)?;
        let Some(first) = raw.first() else {
            return Err(missing_input(Tag::Bias));
        };
        self.report
            .write(format!("Combining {} bias frames", raw.len()));
        let output = self.run_task(
            Step::MasterBias,
            TaskRequest::CombineFrames {
                inputs: paths(&raw),
                kappa: config.bias.kappa,
                bias: None,
                output: config.output_dir.join("MASTER_BIAS.fits"),
            },
        )?;
        Ok(vec![first.derived(output)])
    }

    fn combined_flats(&mut self, db: &TaggedDatabase) -> Result<Vec<RawFrame>> {
        let config = self.config;
        let no_filter = &config.instrument.no_filter;
        let matcher = Matcher::new(db, self.headers, no_filter);

        let mut groups: BTreeMap<InstrumentSetup, Vec<RawFrame>> = BTreeMap::new();
        for path in db.files(Tag::SpecFlat) {
            let frame = matcher.frame(path)?;
            groups
                .entry(InstrumentSetup::of(&frame, no_filter))
                .or_default()
                .push(frame);
        }
        if groups.is_empty() {
            return Err(missing_input(Tag::SpecFlat));
        }

        let mut out = Vec::new();
        for (setup, frames) in groups {
            let Some(first) = frames.first() else {
                continue;
            };
            let bias = require(&matcher, first, Tag::MasterBias, Criteria::ANY, TieBreak::All)?;
            self.report
                .write(format!("Combining {} flat frames for {}", frames.len(), setup));
            let output = self.run_task(
                Step::CombineFlat,
                TaskRequest::CombineFrames {
                    inputs: paths(&frames),
                    kappa: config.flat.kappa,
                    bias: Some(bias),
                    output: config.output_dir.join(format!("FLAT_COMBINED_{}.fits", setup)),
                },
            )?;
            out.push(first.derived(output));
        }
        Ok(out)
    }

    fn normalized_flats(&mut self, db: &TaggedDatabase) -> Result<Vec<RawFrame>> {
        let config = self.config;
        let combined = self.frames(db, Tag::FlatCombined)?;
        if combined.is_empty() {
            return Err(missing_input(Tag::FlatCombined));
        }

        let mut out = Vec::new();
        for flat in combined {
            let setup = InstrumentSetup::of(&flat, &config.instrument.no_filter);
            let output = self.run_task(
                Step::NormalizeFlat,
                TaskRequest::NormalizeFlat {
                    input: flat.path.clone(),
                    order: config.flat.order,
                    sigma: config.flat.sigma,
                    lower: config.flat.lower,
                    upper: config.flat.upper,
                    output: config.output_dir.join(format!("NORM_FLAT_{}.fits", setup)),
                },
            )?;
            out.push(flat.derived(output));
        }
        Ok(out)
    }

    fn corrected_arcs(&mut self, db: &TaggedDatabase) -> Result<Vec<RawFrame>> {
        let config = self.config;
        let matcher = Matcher::new(db, self.headers, &config.instrument.no_filter);
        let raw = self.frames(db, Tag::Arc)?;
        if raw.is_empty() {
            return Err(missing_input(Tag::Arc));
        }

        let mut out = Vec::new();
        for arc in raw {
            let bias = require(&matcher, &arc, Tag::MasterBias, Criteria::ANY, TieBreak::All)?;
            let output = self.run_task(
                Step::PrepareArcs,
                TaskRequest::PrepareArc {
                    input: arc.path.clone(),
                    bias,
                    output: config
                        .output_dir
                        .join("arcs")
                        .join(format!("CORR_{}.fits", arc.stem())),
                },
            )?;
            out.push(arc.derived(output));
        }
        Ok(out)
    }

    /// Give every grism observed without any pixel table one, interactively.
    fn initial_identify(
        &mut self,
        state: &mut PipelineState,
        arcs: &[RawFrame],
        science: &[RawFrame],
    ) -> Result<()> {
        let grisms: BTreeSet<&str> = science.iter().map(|f| f.grism.as_str()).collect();
        for grism in grisms {
            if state.best_for_grism(grism).is_some() {
                continue;
            }
            if !self.config.identify.interactive {
                self.report.warn(format!(
                    "No pixel table for {}; install {} or run interactively",
                    grism,
                    state.shipped_path(grism).display()
                ));
                continue;
            }
            let Some(arc) = arcs.iter().find(|a| a.grism == grism) else {
                self.report
                    .warn(format!("No corrected arc frame for {}", grism));
                continue;
            };
            let key = PixtableKey::new(grism, arc.stem());
            self.identify(state, arc, key)?;
        }
        Ok(())
    }

    fn responses(
        &mut self,
        runner: &StageRunner,
        db: &mut TaggedDatabase,
        state: &mut PipelineState,
        force: bool,
    ) -> Result<()> {
        if !db.has_tag(Tag::FluxStandard) && (force || !db.has_tag(Tag::Response)) {
            self.report
                .warn(format!("No data for file type: {}", Tag::FluxStandard));
            self.report
                .warn("Could not determine the instrument response function");
            self.report.warn("Spectra will not be flux calibrated");
            return Ok(());
        }
        runner.ensure(db, Tag::Response, force, |db| self.build_responses(db, state))?;
        Ok(())
    }

    fn build_responses(
        &mut self,
        db: &TaggedDatabase,
        state: &mut PipelineState,
    ) -> Result<Vec<RawFrame>> {
        let config = self.config;
        let matcher = Matcher::new(db, self.headers, &config.instrument.no_filter);

        let mut out = Vec::new();
        for standard in self.frames(db, Tag::FluxStandard)? {
            let bias = require(&matcher, &standard, Tag::MasterBias, Criteria::ANY, TieBreak::All)?;
            let flat = require(
                &matcher,
                &standard,
                Tag::FlatNormalized,
                Criteria::SETUP,
                TieBreak::All,
            )?;
            let arc = require(
                &matcher,
                &standard,
                Tag::ArcCorrected,
                Criteria::GRISM_SLIT,
                TieBreak::ClosestTime,
            )?;
            let arc_frame = matcher.frame(&arc)?;
            let pixtable = self.pixtable_for(state, &arc_frame)?;

            let output = self.run_task(
                Step::Response,
                TaskRequest::BuildResponse {
                    input: standard.path.clone(),
                    arc,
                    pixtable,
                    bias,
                    flat,
                    output: config
                        .output_dir
                        .join("std")
                        .join(format!("RESPONSE_{}.fits", standard.stem())),
                },
            )?;
            out.push(standard.derived(output));
        }
        Ok(out)
    }

    /// Pixel table for an arc: exact table, a fresh identification when
    /// every arc is identified, the newest run-local table of the grism, or
    /// the shipped default, in that order.
    pub(super) fn pixtable_for(
        &mut self,
        state: &mut PipelineState,
        arc: &RawFrame,
    ) -> Result<PathBuf> {
        let key = PixtableKey::new(&arc.grism, arc.stem());
        if let Some(path) = state.exact(&key) {
            return Ok(path.to_path_buf());
        }
        if self.config.identify.all {
            return self.identify(state, arc, key);
        }
        state.best_for_grism(&arc.grism).ok_or_else(|| {
            PipelineError::Wavelength(format!(
                "no pixel table for {} (arc {}); identify the arc lines or install {}",
                arc.grism,
                arc.path.display(),
                state.shipped_path(&arc.grism).display()
            ))
        })
    }

    fn identify(
        &mut self,
        state: &mut PipelineState,
        arc: &RawFrame,
        key: PixtableKey,
    ) -> Result<PathBuf> {
        self.report.write(format!(
            "Identifying arc lines of {} for {}",
            arc.path.display(),
            arc.grism
        ));
        let path = self.run_task(
            Step::Identify,
            TaskRequest::IdentifyArc {
                arc: arc.path.clone(),
                grism: arc.grism.clone(),
                reference: state.best_for_grism(&arc.grism),
                order_wl: self.config.identify.order_wl,
                output: state.local_path(&key),
            },
        )?;
        state.register(key, path.clone());
        Ok(path)
    }
}

fn paths(frames: &[RawFrame]) -> Vec<PathBuf> {
    frames.iter().map(|f| f.path.clone()).collect()
}

fn missing_input(tag: Tag) -> PipelineError {
    PipelineError::Configuration(format!("no {} frames in the dataset", tag))
}
