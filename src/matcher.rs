//! Calibration matching: which products of a tag fit a science frame.
//!
//! Matching never fails for "nothing found"; an empty result is handed back
//! and the scheduler decides whether that is fatal (mandatory calibration) or
//! a warning (optional calibration). Errors only come from reading headers
//! of frames whose attributes are not stored in the database.

use crate::database::TaggedDatabase;
use crate::error::Result;
use crate::frame::raw::active_filter;
use crate::frame::{HeaderSource, RawFrame, Tag};

use std::path::{Path, PathBuf};

/// Instrument-setup attributes that must be exactly equal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Criteria {
    pub grism: bool,
    pub slit: bool,
    pub filter: bool,
}

impl Criteria {
    pub const ANY: Criteria = Criteria {
        grism: false,
        slit: false,
        filter: false,
    };
    pub const GRISM_SLIT: Criteria = Criteria {
        grism: true,
        slit: true,
        filter: false,
    };
    pub const SETUP: Criteria = Criteria {
        grism: true,
        slit: true,
        filter: true,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TieBreak {
    /// Keep every surviving candidate.
    All,
    /// Keep the candidate observed closest in time to the science frame.
    ClosestTime,
}

pub struct Matcher<'a> {
    db: &'a TaggedDatabase,
    headers: &'a dyn HeaderSource,
    no_filter: &'a [String],
}

impl<'a> Matcher<'a> {
    pub fn new(db: &'a TaggedDatabase, headers: &'a dyn HeaderSource, no_filter: &'a [String]) -> Self {
        Self {
            db,
            headers,
            no_filter,
        }
    }

    /// Attributes of `path`: stored ones first, header otherwise.
    pub fn frame(&self, path: &Path) -> Result<RawFrame> {
        match self.db.frame(path) {
            Some(frame) => Ok(frame.clone()),
            None => self.headers.frame(path),
        }
    }

    /// Candidates of `tag` compatible with `science`, in database order.
    pub fn find(
        &self,
        science: &RawFrame,
        tag: Tag,
        criteria: Criteria,
        tie_break: TieBreak,
    ) -> Result<Vec<PathBuf>> {
        let mut survivors = Vec::new();
        for path in self.db.files(tag) {
            let candidate = self.frame(path)?;
            if self.compatible(science, &candidate, criteria) {
                survivors.push(candidate);
            }
        }

        let picked = match tie_break {
            TieBreak::All => survivors,
            TieBreak::ClosestTime => closest_in_time(science, survivors).into_iter().collect(),
        };
        Ok(picked.into_iter().map(|f| f.path).collect())
    }

    fn compatible(&self, science: &RawFrame, candidate: &RawFrame, criteria: Criteria) -> bool {
        if criteria.grism && candidate.grism != science.grism {
            return false;
        }
        if criteria.slit && candidate.slit != science.slit {
            return false;
        }
        if criteria.filter
            && active_filter(&candidate.filter, self.no_filter)
                != active_filter(&science.filter, self.no_filter)
        {
            return false;
        }
        true
    }
}

/// First candidate with the strictly smallest |Δt|. Candidates without a
/// timestamp never beat one that has it; with no timestamps at all the first
/// candidate wins.
fn closest_in_time(science: &RawFrame, candidates: Vec<RawFrame>) -> Option<RawFrame> {
    let Some(t0) = science.date_obs else {
        return candidates.into_iter().next();
    };

    let mut best: Option<(Option<i64>, RawFrame)> = None;
    for candidate in candidates {
        let delta = candidate
            .date_obs
            .map(|t| (t - t0).num_milliseconds().abs());
        let better = match &best {
            None => true,
            Some((best_delta, _)) => match (delta, best_delta) {
                (Some(d), Some(b)) => d < *b,
                (Some(_), None) => true,
                _ => false,
            },
        };
        if better {
            best = Some((delta, candidate));
        }
    }
    best.map(|(_, frame)| frame)
}
