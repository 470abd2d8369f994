//! Frame classification: header attributes -> Tag.
//!
//! Classification is a pure function of the header attributes, so running it
//! twice over the same files yields the same database.

use crate::database::TaggedDatabase;
use crate::error::{PipelineError, Result};
use crate::frame::fits::HeaderSource;
use crate::frame::raw::RawFrame;
use crate::frame::tag::Tag;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

pub struct Classifier<'a> {
    headers: &'a dyn HeaderSource,
    standards: Vec<String>,
}

impl<'a> Classifier<'a> {
    /// `standard_stars` lists object names that mark flux-standard exposures.
    pub fn new(headers: &'a dyn HeaderSource, standard_stars: &[String]) -> Self {
        Self {
            headers,
            standards: standard_stars.iter().map(|s| normalize_name(s)).collect(),
        }
    }

    /// Tag every frame exactly once. Any unreadable or unclassifiable frame
    /// fails the whole classification.
    pub fn classify(&self, paths: &[PathBuf]) -> Result<TaggedDatabase> {
        let unique: BTreeSet<&PathBuf> = paths.iter().collect();

        let mut db = TaggedDatabase::new();
        for path in unique {
            let frame = self.headers.frame(path)?;
            let tag = self.tag_for(&frame)?;
            debug!("{} -> {}", path.display(), tag);
            db.insert(tag, frame);
        }
        Ok(db)
    }

    pub fn tag_for(&self, frame: &RawFrame) -> Result<Tag> {
        let spectral = frame.obs_mode.contains("SPEC");
        let image_type = frame.image_type.as_str();

        let tag = match image_type {
            "BIAS" | "ZERO" => Tag::Bias,
            t if t.starts_with("FLAT") => {
                if spectral {
                    Tag::SpecFlat
                } else {
                    Tag::ImagingFlat
                }
            }
            t if t.starts_with("WAVE") || t.starts_with("ARC") => Tag::Arc,
            "OBJECT" | "SCIENCE" | "STANDARD" => {
                if !spectral {
                    Tag::ImagingObject
                } else if image_type == "STANDARD" || self.is_standard(&frame.object) {
                    Tag::FluxStandard
                } else {
                    Tag::ScienceObject
                }
            }
            other => {
                return Err(PipelineError::classification(
                    &frame.path,
                    format!("no rule for image type {:?} (mode {:?})", other, frame.obs_mode),
                ));
            }
        };

        let needs_setup = matches!(
            tag,
            Tag::SpecFlat | Tag::Arc | Tag::FluxStandard | Tag::ScienceObject
        );
        if needs_setup && (frame.grism.is_empty() || frame.slit.is_empty()) {
            return Err(PipelineError::classification(
                &frame.path,
                format!("{} frame without grism or slit", tag),
            ));
        }

        Ok(tag)
    }

    fn is_standard(&self, object: &str) -> bool {
        let name = normalize_name(object);
        !name.is_empty() && self.standards.iter().any(|s| *s == name)
    }
}

fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_whitespace() && *c != '_')
        .collect::<String>()
        .to_uppercase()
}

/// Expand files and directories into a sorted list of FITS files.
pub fn discover_frames(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut out = BTreeSet::new();
    for input in inputs {
        if input.is_dir() {
            collect_fits(input, &mut out)?;
        } else if input.is_file() {
            out.insert(input.clone());
        } else {
            return Err(PipelineError::Configuration(format!(
                "no such file or directory: {}",
                input.display()
            )));
        }
    }
    Ok(out.into_iter().collect())
}

/// Walks without following directory links, so a link back up the tree is
/// never entered. Links to files are kept.
fn collect_fits(dir: &Path, out: &mut BTreeSet<PathBuf>) -> Result<()> {
    for entry in WalkDir::new(dir).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::from)?;
        let path = entry.path();
        let is_file = entry.file_type().is_file() || (entry.path_is_symlink() && path.is_file());
        if is_file && is_fits(path) {
            out.insert(path.to_path_buf());
        }
    }
    Ok(())
}

fn is_fits(path: &Path) -> bool {
    path.extension()
        .map(|e| {
            let e = e.to_string_lossy().to_lowercase();
            e == "fits" || e == "fit"
        })
        .unwrap_or(false)
}
