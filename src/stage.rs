//! Stage runner: produce each calibration tag at most once.
//!
//! A stage whose tag already exists in the database is skipped. A successful
//! producer's frames are installed under the tag and the database is flushed
//! to disk before `ensure` returns, so a later crash never loses a finished
//! calibration. A failing producer leaves the database untouched.

use crate::database::TaggedDatabase;
use crate::error::Result;
use crate::frame::{RawFrame, Tag};

use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    /// The tag already existed; nothing ran.
    Reused,
    /// The producer ran and this many frames were installed.
    Produced(usize),
}

pub struct StageRunner {
    db_path: PathBuf,
}

impl StageRunner {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    /// Run `producer` unless `tag` is present (or `force` is given).
    pub fn ensure<F>(
        &self,
        db: &mut TaggedDatabase,
        tag: Tag,
        force: bool,
        producer: F,
    ) -> Result<StageOutcome>
    where
        F: FnOnce(&TaggedDatabase) -> Result<Vec<RawFrame>>,
    {
        debug_assert!(tag.is_derived(), "{} is not a pipeline product", tag);
        if db.has_tag(tag) && !force {
            info!("{} already exists ({} frames), skipping", tag, db.count(tag));
            return Ok(StageOutcome::Reused);
        }

        let frames = producer(db)?;
        let produced = frames.len();
        db.install(tag, frames);
        db.save(&self.db_path)?;
        info!("{}: installed {} frames, saved {}", tag, produced, self.db_path.display());
        Ok(StageOutcome::Produced(produced))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use crate::policy::Step;
    use crate::tasks::TaskError;
    use crate::testutil::frame;
    use std::cell::Cell;
    use std::path::Path;

    fn setup() -> (tempfile::TempDir, StageRunner, TaggedDatabase) {
        let dir = tempfile::tempdir().unwrap();
        let runner = StageRunner::new(dir.path().join("dataset.json"));
        let mut db = TaggedDatabase::new();
        db.insert(Tag::Bias, frame("raw/b1.fits", "bias"));
        (dir, runner, db)
    }

    #[test]
    fn existing_tag_runs_nothing() {
        let (_dir, runner, mut db) = setup();
        db.insert(Tag::MasterBias, frame("out/MASTER_BIAS.fits", "bias"));

        let calls = Cell::new(0);
        let outcome = runner
            .ensure(&mut db, Tag::MasterBias, false, |_| {
                calls.set(calls.get() + 1);
                Ok(vec![])
            })
            .unwrap();
        assert_eq!(outcome, StageOutcome::Reused);
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn produced_frames_are_persisted_immediately() {
        let (dir, runner, mut db) = setup();

        let outcome = runner
            .ensure(&mut db, Tag::MasterBias, false, |db| {
                assert_eq!(db.count(Tag::Bias), 1);
                Ok(vec![frame("out/MASTER_BIAS.fits", "bias")])
            })
            .unwrap();
        assert_eq!(outcome, StageOutcome::Produced(1));

        let on_disk = TaggedDatabase::load(&dir.path().join("dataset.json")).unwrap();
        assert!(on_disk.has_tag(Tag::MasterBias));
        assert_eq!(on_disk.mapping(), db.mapping());
    }

    #[test]
    fn force_replaces_the_section() {
        let (_dir, runner, mut db) = setup();
        db.insert(Tag::MasterBias, frame("out/OLD_BIAS.fits", "bias"));

        runner
            .ensure(&mut db, Tag::MasterBias, true, |_| {
                Ok(vec![frame("out/MASTER_BIAS.fits", "bias")])
            })
            .unwrap();
        let files: Vec<&Path> = db.files(Tag::MasterBias).collect();
        assert_eq!(files, vec![Path::new("out/MASTER_BIAS.fits")]);
    }

    #[test]
    fn failure_writes_nothing() {
        let (dir, runner, mut db) = setup();
        let before = db.mapping();

        let err = runner
            .ensure(&mut db, Tag::MasterBias, false, |_| {
                Err(PipelineError::stage(
                    Step::MasterBias,
                    TaskError::Failed {
                        task: "combine-frames",
                        message: "fewer than 3 usable frames".into(),
                    },
                ))
            })
            .unwrap_err();
        assert!(matches!(err, PipelineError::Stage { .. }));
        assert_eq!(db.mapping(), before);
        assert!(!dir.path().join("dataset.json").exists());
    }
}
