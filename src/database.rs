//! Tagged database: tag -> ordered set of frames, persisted as JSON.
//!
//! JSON shape:
//! {
//!   "version": 1,
//!   "sections": {
//!     "BIAS": [
//!       { "filename": "raw/ALDc010101.fits", "object": "bias", "grism": "Open", ... }
//!     ],
//!     "SPEC_OBJECT": [ ... ]
//!   }
//! }
//!
//! Only `filename` and the section name are required on reload; the other
//! columns are informational. When they are complete (grism and slit
//! present) they are used as the frame's attributes, otherwise attributes are
//! read from the header again on demand.

use crate::error::{PipelineError, Result};
use crate::frame::{RawFrame, Tag};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Default)]
pub struct TaggedDatabase {
    sections: BTreeMap<Tag, BTreeSet<PathBuf>>,
    index: BTreeMap<PathBuf, Tag>,
    info: BTreeMap<PathBuf, RawFrame>,
}

impl TaggedDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put `frame` under `tag`, moving it out of any other section.
    pub fn insert(&mut self, tag: Tag, frame: RawFrame) {
        self.insert_path(tag, frame.path.clone());
        self.info.insert(frame.path.clone(), frame);
    }

    fn insert_path(&mut self, tag: Tag, path: PathBuf) {
        if let Some(old) = self.index.insert(path.clone(), tag) {
            if old != tag {
                if let Some(set) = self.sections.get_mut(&old) {
                    set.remove(&path);
                    if set.is_empty() {
                        self.sections.remove(&old);
                    }
                }
            }
        }
        self.sections.entry(tag).or_default().insert(path);
    }

    /// Replace the whole section for `tag`.
    pub fn install(&mut self, tag: Tag, frames: Vec<RawFrame>) {
        self.remove_tag(tag);
        for frame in frames {
            self.insert(tag, frame);
        }
    }

    pub fn remove_tag(&mut self, tag: Tag) {
        if let Some(set) = self.sections.remove(&tag) {
            for path in set {
                self.index.remove(&path);
                self.info.remove(&path);
            }
        }
    }

    pub fn has_tag(&self, tag: Tag) -> bool {
        self.sections.get(&tag).is_some_and(|s| !s.is_empty())
    }

    /// Files under `tag` in stable (sorted) order.
    pub fn files(&self, tag: Tag) -> impl Iterator<Item = &Path> + '_ {
        self.sections
            .get(&tag)
            .into_iter()
            .flat_map(|set| set.iter().map(PathBuf::as_path))
    }

    pub fn count(&self, tag: Tag) -> usize {
        self.sections.get(&tag).map(BTreeSet::len).unwrap_or(0)
    }

    /// Non-empty tags in order.
    pub fn tags(&self) -> impl Iterator<Item = Tag> + '_ {
        self.sections.keys().copied()
    }

    pub fn tag_of(&self, path: &Path) -> Option<Tag> {
        self.index.get(path).copied()
    }

    /// Stored attributes of `path`, if known.
    pub fn frame(&self, path: &Path) -> Option<&RawFrame> {
        self.info.get(path)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// The content-determining view: tag -> set of filenames.
    pub fn mapping(&self) -> BTreeMap<Tag, BTreeSet<PathBuf>> {
        self.sections.clone()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut sections = BTreeMap::new();
        for (tag, files) in &self.sections {
            let records = files
                .iter()
                .map(|f| Record::new(f, self.info.get(f)))
                .collect::<Vec<_>>();
            sections.insert(tag.as_str().to_string(), records);
        }
        let file = DatabaseFile {
            version: FORMAT_VERSION,
            sections,
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| PipelineError::database(path, e))?;
        write_atomic(path, json.as_bytes())?;
        Ok(())
    }

    /// Load and validate a database file. Malformed input is rejected whole.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let file: DatabaseFile =
            serde_json::from_str(&text).map_err(|e| PipelineError::database(path, e))?;

        if file.version != FORMAT_VERSION {
            return Err(PipelineError::database(
                path,
                format!("unsupported version {} (expected {})", file.version, FORMAT_VERSION),
            ));
        }

        let mut db = TaggedDatabase::new();
        for (name, records) in file.sections {
            let tag: Tag = name.parse().map_err(|e| PipelineError::database(path, e))?;
            for record in records {
                if record.filename.as_os_str().is_empty() {
                    return Err(PipelineError::database(path, format!("empty filename in {}", tag)));
                }
                if let Some(prev) = db.tag_of(&record.filename) {
                    return Err(PipelineError::database(
                        path,
                        format!(
                            "{} listed under both {} and {}",
                            record.filename.display(),
                            prev,
                            tag
                        ),
                    ));
                }
                match record.into_frame() {
                    Ok(frame) => db.insert(tag, frame),
                    Err(filename) => db.insert_path(tag, filename),
                }
            }
        }
        Ok(db)
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct DatabaseFile {
    version: u32,
    sections: BTreeMap<String, Vec<Record>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct Record {
    filename: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    object: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    image_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    obs_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exptime: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    grism: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    slit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    filter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dispaxis: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    date_obs: Option<NaiveDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    shape: Option<[usize; 2]>,
}

impl Record {
    fn new(path: &Path, frame: Option<&RawFrame>) -> Self {
        match frame {
            Some(f) => Self {
                filename: path.to_path_buf(),
                object: Some(f.object.clone()),
                image_type: Some(f.image_type.clone()),
                obs_mode: Some(f.obs_mode.clone()),
                exptime: Some(f.exptime),
                grism: Some(f.grism.clone()),
                slit: Some(f.slit.clone()),
                filter: Some(f.filter.clone()),
                dispaxis: Some(f.dispaxis),
                date_obs: f.date_obs,
                shape: Some([f.shape.0, f.shape.1]),
            },
            None => Self {
                filename: path.to_path_buf(),
                ..Default::default()
            },
        }
    }

    /// Attributes are usable only when the setup columns are present;
    /// otherwise hand back the bare filename.
    fn into_frame(self) -> std::result::Result<RawFrame, PathBuf> {
        let (Some(grism), Some(slit)) = (self.grism, self.slit) else {
            return Err(self.filename);
        };
        let [rows, cols] = self.shape.unwrap_or([0, 0]);
        Ok(RawFrame {
            path: self.filename,
            object: self.object.unwrap_or_default(),
            image_type: self.image_type.unwrap_or_default(),
            obs_mode: self.obs_mode.unwrap_or_default(),
            grism,
            slit,
            filter: self.filter.unwrap_or_default(),
            exptime: self.exptime.unwrap_or(0.0),
            dispaxis: self.dispaxis.unwrap_or(2),
            date_obs: self.date_obs,
            shape: (rows, cols),
        })
    }
}

/// Replace `path` with `contents` so readers never observe a partial file.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::frame;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn sample() -> TaggedDatabase {
        let mut db = TaggedDatabase::new();
        db.insert(Tag::Bias, frame("raw/b1.fits", "bias"));
        db.insert(Tag::Bias, frame("raw/b2.fits", "bias"));
        db.insert(Tag::ScienceObject, frame("raw/s1.fits", "SN2023abc"));
        db.insert(Tag::MasterBias, frame("out/MASTER_BIAS.fits", "bias"));
        db
    }

    #[test]
    fn insert_keeps_each_frame_under_one_tag() {
        let mut db = sample();
        db.insert(Tag::FluxStandard, frame("raw/s1.fits", "SN2023abc"));
        assert_eq!(db.tag_of(Path::new("raw/s1.fits")), Some(Tag::FluxStandard));
        assert!(!db.has_tag(Tag::ScienceObject));
        assert_eq!(db.len(), 4);
    }

    #[test]
    fn install_replaces_a_section() {
        let mut db = sample();
        db.install(Tag::Bias, vec![frame("raw/b3.fits", "bias")]);
        let files: Vec<&Path> = db.files(Tag::Bias).collect();
        assert_eq!(files, vec![Path::new("raw/b3.fits")]);
        assert_eq!(db.frame(Path::new("raw/b1.fits")), None);

        db.install(Tag::Response, vec![]);
        assert!(!db.has_tag(Tag::Response));
    }

    #[test]
    fn save_then_load_round_trips_the_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dataset.json");
        let db = sample();
        db.save(&path).unwrap();

        let loaded = TaggedDatabase::load(&path).unwrap();
        assert_eq!(loaded.mapping(), db.mapping());
        assert_eq!(
            loaded.frame(Path::new("raw/s1.fits")),
            db.frame(Path::new("raw/s1.fits"))
        );
        assert!(!dir.path().join("dataset.json.tmp").exists());
    }

    #[test]
    fn reload_ignores_informational_formatting() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dataset.json");
        fs::write(
            &path,
            r#"{"version": 1, "sections": {
                "BIAS": [{"filename": "raw/b1.fits"}, {"filename": "raw/b2.fits", "object": "bias"}],
                "SPEC_OBJECT": [{"filename": "raw/s1.fits", "grism": "Grism_#4", "slit": "Slit_1.0"}]
            }}"#,
        )
        .unwrap();

        let db = TaggedDatabase::load(&path).unwrap();
        assert_eq!(db.count(Tag::Bias), 2);
        assert_eq!(db.frame(Path::new("raw/b1.fits")), None);
        let sci = db.frame(Path::new("raw/s1.fits")).unwrap();
        assert_eq!(sci.grism, "Grism_#4");
    }

    #[test]
    fn malformed_files_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dataset.json");
        let cases = [
            r#"{"version": 2, "sections": {}}"#,
            r#"{"version": 1, "sections": {"DARK": [{"filename": "d.fits"}]}}"#,
            r#"{"version": 1, "sections": {"BIAS": [{"filename": "b.fits", "colour": "red"}]}}"#,
            r#"{"version": 1, "sections": {"BIAS": [{"filename": "b.fits"}], "ARC": [{"filename": "b.fits"}]}}"#,
            r#"{"version": 1, "sections": {"BIAS": [{"filename": ""}]}}"#,
            r#"not json"#,
        ];
        for text in cases {
            fs::write(&path, text).unwrap();
            let err = TaggedDatabase::load(&path).unwrap_err();
            assert!(matches!(err, PipelineError::Database { .. }), "{}", text);
        }
    }

    proptest! {
        #[test]
        fn save_then_load_keeps_any_mapping(
            entries in prop::collection::vec(
                (0..Tag::ALL.len(), 0usize..16, any::<bool>()),
                0..32,
            ),
        ) {
            let mut db = TaggedDatabase::new();
            for (tag, file, with_header) in entries {
                let path = format!("raw/{:02}.fits", file);
                if with_header {
                    db.insert(Tag::ALL[tag], frame(&path, "SN2023abc"));
                } else {
                    db.insert_path(Tag::ALL[tag], PathBuf::from(path));
                }
            }

            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("dataset.json");
            db.save(&path).unwrap();
            let loaded = TaggedDatabase::load(&path).unwrap();
            prop_assert_eq!(loaded.mapping(), db.mapping());
            prop_assert_eq!(loaded.len(), db.len());
        }
    }
}
