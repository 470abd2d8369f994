//! Run-scoped pipeline state: dispersion solutions ("pixel tables").
//!
//! Tables are keyed by grism and the arc frame they were identified on.
//! Run-local tables live under `<output>/arcs/pixtab_<arc>_<grism>.dat`;
//! shipped defaults under `<calib_dir>/<grism>_pixeltable.dat`. A run-local
//! table always wins over the shipped default for the same grism, and the
//! most recently registered run-local table wins among several.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PixtableKey {
    pub grism: String,
    /// File stem of the corrected arc frame.
    pub arc: String,
}

impl PixtableKey {
    pub fn new(grism: impl Into<String>, arc: impl Into<String>) -> Self {
        Self {
            grism: grism.into(),
            arc: arc.into(),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    path: PathBuf,
    seq: u64,
}

#[derive(Debug, Clone)]
pub struct PipelineState {
    arcs_dir: PathBuf,
    calib_dir: PathBuf,
    tables: BTreeMap<PixtableKey, Entry>,
    next_seq: u64,
}

impl PipelineState {
    pub fn new(arcs_dir: impl Into<PathBuf>, calib_dir: impl Into<PathBuf>) -> Self {
        Self {
            arcs_dir: arcs_dir.into(),
            calib_dir: calib_dir.into(),
            tables: BTreeMap::new(),
            next_seq: 0,
        }
    }

    /// Where a run-local table for `key` is written.
    pub fn local_path(&self, key: &PixtableKey) -> PathBuf {
        self.arcs_dir
            .join(format!("pixtab_{}_{}.dat", key.arc, key.grism))
    }

    /// Where the shipped table for `grism` lives.
    pub fn shipped_path(&self, grism: &str) -> PathBuf {
        self.calib_dir.join(format!("{}_pixeltable.dat", grism))
    }

    pub fn register(&mut self, key: PixtableKey, path: PathBuf) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.tables.insert(key, Entry { path, seq });
    }

    /// Pick up run-local tables left on disk by earlier runs.
    pub fn discover<'k>(&mut self, keys: impl IntoIterator<Item = &'k PixtableKey>) -> usize {
        let mut found = 0;
        for key in keys {
            if self.tables.contains_key(key) {
                continue;
            }
            let path = self.local_path(key);
            if path.is_file() {
                self.register(key.clone(), path);
                found += 1;
            }
        }
        found
    }

    /// Table identified on exactly this arc for this grism.
    pub fn exact(&self, key: &PixtableKey) -> Option<&Path> {
        self.tables.get(key).map(|e| e.path.as_path())
    }

    /// Most recently registered run-local table for `grism`.
    pub fn latest_for_grism(&self, grism: &str) -> Option<&Path> {
        self.tables
            .iter()
            .filter(|(k, _)| k.grism == grism)
            .max_by_key(|(_, e)| e.seq)
            .map(|(_, e)| e.path.as_path())
    }

    /// Shipped default for `grism`, if installed.
    pub fn shipped(&self, grism: &str) -> Option<PathBuf> {
        let path = self.shipped_path(grism);
        path.is_file().then_some(path)
    }

    /// Best table for `grism` when no exact match is wanted.
    pub fn best_for_grism(&self, grism: &str) -> Option<PathBuf> {
        self.latest_for_grism(grism)
            .map(Path::to_path_buf)
            .or_else(|| self.shipped(grism))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn state() -> (tempfile::TempDir, PipelineState) {
        let dir = tempfile::tempdir().unwrap();
        let arcs = dir.path().join("spectra/arcs");
        let calib = dir.path().join("calib");
        fs::create_dir_all(&arcs).unwrap();
        fs::create_dir_all(&calib).unwrap();
        let state = PipelineState::new(arcs, calib);
        (dir, state)
    }

    #[test]
    fn structured_keys_do_not_collide() {
        let (_dir, mut state) = state();
        // Substring matching on a flat name would let Grism_#4 pick up Grism_#40.
        state.register(PixtableKey::new("Grism_#4", "arc_1"), "t1.dat".into());
        state.register(PixtableKey::new("Grism_#40", "arc_1"), "t2.dat".into());

        assert_eq!(
            state.exact(&PixtableKey::new("Grism_#4", "arc_1")),
            Some(Path::new("t1.dat"))
        );
        assert_eq!(state.exact(&PixtableKey::new("Grism_#4", "arc_2")), None);
        assert_eq!(state.latest_for_grism("Grism_#4"), Some(Path::new("t1.dat")));
    }

    #[test]
    fn run_local_table_beats_shipped_default() {
        let (_dir, mut state) = state();
        let shipped = state.shipped_path("Grism_#4");
        fs::write(&shipped, "default").unwrap();
        assert_eq!(state.best_for_grism("Grism_#4"), Some(shipped));

        state.register(PixtableKey::new("Grism_#4", "arc_1"), "first.dat".into());
        state.register(PixtableKey::new("Grism_#4", "arc_0"), "second.dat".into());
        assert_eq!(state.best_for_grism("Grism_#4"), Some(PathBuf::from("second.dat")));
        assert_eq!(state.best_for_grism("Grism_#7"), None);
    }

    #[test]
    fn discovers_tables_from_earlier_runs() {
        let (_dir, mut state) = state();
        let key = PixtableKey::new("Grism_#4", "CORR_arc1");
        fs::write(state.local_path(&key), "lines").unwrap();
        let other = PixtableKey::new("Grism_#4", "CORR_arc2");

        assert_eq!(state.discover([&key, &other]), 1);
        assert_eq!(state.exact(&key), Some(state.local_path(&key).as_path()));
        assert_eq!(state.exact(&other), None);
    }
}
