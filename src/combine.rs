//! Combination of finished OBs per (target, setup).
//!
//! Contributions are the `FLUX2D_*.fits` files of OB directories whose status
//! is DONE:
//!
//! spectra/<target>/<setup>/ob1/FLUX2D_<target>.fits
//! spectra/<target>/<setup>/ob2/FLUX2D_<target>.fits
//!
//! Several contributions are merged into `<target>_<setup>_flux2d.fits` and
//! extracted again to `<target>_<setup>_flux1d.fits`, both next to the setup
//! directories. A single contribution is hard-linked to those names instead.
//! Existing combined products are kept unless forced.

use crate::error::{PipelineError, Result};
use crate::obstatus::{ObStatus, ObStatusStore};
use crate::policy::Step;
use crate::report::Report;
use crate::tasks::{ReductionTasks, TaskRequest};

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CombineOutcome {
    /// The combination task ran.
    Combined,
    /// The single contribution was linked.
    Linked,
    /// Combined products exist already.
    UpToDate,
    /// No OB of the group is DONE.
    Nothing,
}

pub struct Combiner<'a> {
    output_dir: &'a Path,
    store: &'a ObStatusStore,
    interactive: bool,
}

impl<'a> Combiner<'a> {
    pub fn new(output_dir: &'a Path, store: &'a ObStatusStore, interactive: bool) -> Self {
        Self {
            output_dir,
            store,
            interactive,
        }
    }

    pub fn combined_paths(&self, target: &str, setup: &str) -> (PathBuf, PathBuf) {
        let dir = self.output_dir.join(target);
        (
            dir.join(format!("{}_{}_flux2d.fits", target, setup)),
            dir.join(format!("{}_{}_flux1d.fits", target, setup)),
        )
    }

    /// FLUX2D files of the DONE OBs of this group, in directory order.
    pub fn contributions(&self, target: &str, setup: &str) -> Result<Vec<PathBuf>> {
        let group_dir = self.output_dir.join(target).join(setup);
        if !group_dir.is_dir() {
            return Ok(Vec::new());
        }
        let statuses = self.store.load()?;

        let mut ob_dirs: Vec<PathBuf> = fs::read_dir(&group_dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_dir())
            .collect();
        ob_dirs.sort();

        let mut out = Vec::new();
        for dir in ob_dirs {
            let key = dir.display().to_string();
            if statuses.get(&key).copied().unwrap_or_default() != ObStatus::Done {
                continue;
            }
            let mut files: Vec<PathBuf> = fs::read_dir(&dir)?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| is_flux2d(p))
                .collect();
            files.sort();
            out.extend(files);
        }
        Ok(out)
    }

    pub fn combine_group(
        &self,
        tasks: &mut dyn ReductionTasks,
        report: &mut Report,
        target: &str,
        setup: &str,
        force: bool,
    ) -> Result<CombineOutcome> {
        let inputs = self.contributions(target, setup)?;
        let (comb2d, comb1d) = self.combined_paths(target, setup);

        match inputs.len() {
            0 => Ok(CombineOutcome::Nothing),
            1 => {
                let source_2d = &inputs[0];
                let mut linked = false;
                if force || !comb2d.exists() {
                    link_file(source_2d, &comb2d)?;
                    report.write(format!("Linked {} -> {}", source_2d.display(), comb2d.display()));
                    linked = true;
                }
                let source_1d = flux1d_sibling(source_2d);
                if source_1d.exists() && (force || !comb1d.exists()) {
                    link_file(&source_1d, &comb1d)?;
                    report.write(format!("Linked {} -> {}", source_1d.display(), comb1d.display()));
                    linked = true;
                }
                Ok(if linked {
                    CombineOutcome::Linked
                } else {
                    CombineOutcome::UpToDate
                })
            }
            n => {
                let mut ran = false;
                if force || !comb2d.exists() {
                    report.write(format!("Combining {} OBs of {} {}", n, target, setup));
                    let request = TaskRequest::Combine2d {
                        inputs,
                        output: comb2d.clone(),
                    };
                    tasks
                        .run(&request)
                        .map_err(|e| PipelineError::stage(Step::Combination, e))?;
                    report.write(format!(" [OUTPUT] - {}", comb2d.display()));
                    ran = true;
                }
                if force || !comb1d.exists() {
                    let request = TaskRequest::Extract1d {
                        input: comb2d,
                        interactive: self.interactive,
                        output: comb1d.clone(),
                    };
                    match tasks.run(&request) {
                        Ok(()) => report.write(format!(" [OUTPUT] - {}", comb1d.display())),
                        Err(e) => {
                            report.tolerate(Step::Extraction, PipelineError::stage(Step::Extraction, e))?
                        }
                    }
                    ran = true;
                }
                Ok(if ran {
                    CombineOutcome::Combined
                } else {
                    CombineOutcome::UpToDate
                })
            }
        }
    }
}

fn is_flux2d(path: &Path) -> bool {
    path.is_file()
        && path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("FLUX2D_") && n.ends_with(".fits"))
}

fn flux1d_sibling(flux2d: &Path) -> PathBuf {
    let name = flux2d
        .file_name()
        .map(|n| n.to_string_lossy().replacen("FLUX2D", "FLUX1D", 1))
        .unwrap_or_default();
    flux2d.with_file_name(name)
}

/// Hard-link `source` to `alias`, replacing whatever `alias` was.
pub fn link_file(source: &Path, alias: &Path) -> io::Result<()> {
    if let Some(parent) = alias.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::remove_file(alias) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    fs::hard_link(source, alias)
}
