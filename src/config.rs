//! Pipeline options, read from a TOML file.
//!
//! Every section has defaults, so a minimal options file only names the
//! dataset:
//!
//! dataset = "dataset.json"
//!
//! [skysub]
//! auto = false

use crate::error::{PipelineError, Result};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Tagged database produced by `classify`.
    pub dataset: PathBuf,
    /// Root of all reduced products.
    pub output_dir: PathBuf,
    /// Shipped calibration data (default pixel tables).
    pub calib_dir: PathBuf,
    pub instrument: InstrumentConfig,
    pub bias: BiasOptions,
    pub flat: FlatOptions,
    pub identify: IdentifyOptions,
    pub rectify: RectifyOptions,
    pub skysub: SkysubOptions,
    pub crr: CrrOptions,
    pub extract: ExtractOptions,
    pub tasks: TasksConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dataset: PathBuf::from("dataset.json"),
            output_dir: PathBuf::from("spectra"),
            calib_dir: PathBuf::from("calib"),
            instrument: InstrumentConfig::default(),
            bias: BiasOptions::default(),
            flat: FlatOptions::default(),
            identify: IdentifyOptions::default(),
            rectify: RectifyOptions::default(),
            skysub: SkysubOptions::default(),
            crr: CrrOptions::default(),
            extract: ExtractOptions::default(),
            tasks: TasksConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            PipelineError::Configuration(format!("cannot read options {}: {}", path.display(), e))
        })?;
        let mut config: PipelineConfig = toml::from_str(&text).map_err(|e| {
            PipelineError::Configuration(format!("invalid options {}: {}", path.display(), e))
        })?;
        config.tasks.fill_defaults();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.dataset.as_os_str().is_empty() {
            return Err(PipelineError::config("`dataset` must name the classification database"));
        }
        if self.output_dir.as_os_str().is_empty() {
            return Err(PipelineError::config("`output_dir` must not be empty"));
        }
        if self.crr.niter > 0 && (self.crr.gain <= 0.0 || self.crr.read_noise < 0.0) {
            return Err(PipelineError::config(
                "`crr.gain` must be positive and `crr.read_noise` non-negative",
            ));
        }
        if self.flat.lower >= self.flat.upper {
            return Err(PipelineError::config(format!(
                "`flat.lower` ({}) must be below `flat.upper` ({})",
                self.flat.lower, self.flat.upper
            )));
        }
        for (name, spec) in &self.tasks.commands {
            if spec.program.trim().is_empty() {
                return Err(PipelineError::config(format!("task {} has no program", name)));
            }
        }
        Ok(())
    }

    /// The options file `init` writes.
    pub fn default_toml() -> Result<String> {
        toml::to_string_pretty(&PipelineConfig::default()).map_err(PipelineError::config)
    }

    /// OB status store sitting next to the dataset.
    pub fn ob_status_path(&self) -> PathBuf {
        self.dataset.with_extension("obd")
    }

    /// Turn on every interactive sub-stage.
    pub fn set_interactive(&mut self) {
        self.identify.interactive = true;
        self.identify.all = true;
        self.extract.interactive = true;
    }
}

/// FITS keywords and naming conventions of the instrument (ALFOSC defaults).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InstrumentConfig {
    pub object: String,
    pub image_type: String,
    pub obs_mode: String,
    pub grism: String,
    pub slit: String,
    /// Filter wheels, searched in order.
    pub filters: Vec<String>,
    pub exptime: String,
    pub dispaxis: String,
    pub date_obs: String,
    /// Filter names meaning "no filter".
    pub no_filter: Vec<String>,
    /// Object names of spectrophotometric standard stars.
    pub standard_stars: Vec<String>,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        let strings = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            object: "OBJECT".into(),
            image_type: "IMAGETYP".into(),
            obs_mode: "OBS_MODE".into(),
            grism: "ALGRNM".into(),
            slit: "ALAPRTNM".into(),
            filters: strings(&["FAFLTNM", "FBFLTNM"]),
            exptime: "EXPTIME".into(),
            dispaxis: "DISPAXIS".into(),
            date_obs: "DATE-OBS".into(),
            no_filter: strings(&["Open", "Free", "None"]),
            standard_stars: strings(&[
                "BD+28 4211",
                "BD+33 2642",
                "BD+25 4655",
                "Feige 34",
                "Feige 66",
                "Feige 110",
                "G191-B2B",
                "GD 71",
                "GD 153",
                "HD 19445",
                "HZ 44",
                "SP0305+261",
                "SP1446+259",
            ]),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BiasOptions {
    /// Sigma-clipping threshold for frame combination.
    pub kappa: f64,
}

impl Default for BiasOptions {
    fn default() -> Self {
        Self { kappa: 15.0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FlatOptions {
    pub kappa: f64,
    /// Order of the spatial-profile fit used for normalization.
    pub order: u32,
    pub sigma: f64,
    /// Pixel bounds along the dispersion axis used for the fit.
    pub lower: u32,
    pub upper: u32,
}

impl Default for FlatOptions {
    fn default() -> Self {
        Self {
            kappa: 15.0,
            order: 24,
            sigma: 5.0,
            lower: 0,
            upper: 2050,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IdentifyOptions {
    /// Allow interactive identification when a grism has no pixel table.
    pub interactive: bool,
    /// Identify lines for every arc instead of reusing one table per grism.
    pub all: bool,
    pub order_wl: u32,
}

impl Default for IdentifyOptions {
    fn default() -> Self {
        Self {
            interactive: false,
            all: false,
            order_wl: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RectifyOptions {
    pub order_wl: u32,
    pub order_2d: u32,
}

impl Default for RectifyOptions {
    fn default() -> Self {
        Self {
            order_wl: 4,
            order_2d: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SkysubOptions {
    /// Run automatic background subtraction; otherwise pass the frame through.
    pub auto: bool,
    pub order_bg: u32,
    /// Half width in pixels of the masked object trace.
    pub width: u32,
}

impl Default for SkysubOptions {
    fn default() -> Self {
        Self {
            auto: true,
            order_bg: 3,
            width: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CrrOptions {
    /// Zero disables cosmic-ray rejection.
    pub niter: u32,
    pub gain: f64,
    pub read_noise: f64,
}

impl Default for CrrOptions {
    fn default() -> Self {
        Self {
            niter: 4,
            gain: 0.16,
            read_noise: 4.3,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExtractOptions {
    pub interactive: bool,
}

/// External programs implementing the numeric tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TasksConfig {
    /// Exit code of `rectify` meaning "no valid dispersion solution".
    pub wavelength_exit_code: i32,
    /// Exit code of `extract-1d` meaning "degenerate trace".
    pub degenerate_exit_code: i32,
    pub commands: BTreeMap<String, CommandSpec>,
}

impl Default for TasksConfig {
    fn default() -> Self {
        let mut tasks = Self {
            wavelength_exit_code: 3,
            degenerate_exit_code: 4,
            commands: BTreeMap::new(),
        };
        tasks.fill_defaults();
        tasks
    }
}

impl TasksConfig {
    /// Add the default command for every task the file does not override.
    pub fn fill_defaults(&mut self) {
        for (name, args) in DEFAULT_COMMANDS {
            self.commands
                .entry(name.to_string())
                .or_insert_with(|| CommandSpec {
                    program: "pynot".to_string(),
                    args: args.iter().map(|a| a.to_string()).collect(),
                });
        }
    }
}

/// One external command. `args` may hold placeholders such as `{input}`,
/// `{inputs}` or `{output}`; see `tasks::command`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

const DEFAULT_COMMANDS: &[(&str, &[&str])] = &[
    ("combine-frames", &["combine", "{inputs}", "-o", "{output}", "--kappa={kappa}", "--bias={bias}"]),
    ("normalize-flat", &["sflat", "{input}", "-o", "{output}", "--order={order}", "--sigma={sigma}", "--lower={lower}", "--upper={upper}"]),
    ("prepare-arc", &["corr", "{input}", "-o", "{output}", "--bias={bias}"]),
    ("identify-arc", &["identify", "{arc}", "--grism={grism}", "--reference={reference}", "--order_wl={order_wl}", "-o", "{output}"]),
    ("build-response", &["response", "{input}", "--arc={arc}", "--pixtable={pixtable}", "--bias={bias}", "--flat={flat}", "-o", "{output}"]),
    ("correct-raw", &["corr", "{input}", "-o", "{output}", "--bias={bias}", "--flat={flat}"]),
    ("rectify", &["wave2d", "{input}", "{arc}", "--table={pixtable}", "-o", "{output}", "--axis={dispaxis}", "--order_wl={order_wl}", "--order_2d={order_2d}"]),
    ("subtract-background", &["skysub", "{input}", "-o", "{output}", "--order_bg={order_bg}", "--width={width}"]),
    ("reject-cosmics", &["crr", "{input}", "-o", "{output}", "--niter={niter}", "--gain={gain}", "--rdnoise={read_noise}"]),
    ("flux-calibrate", &["flux2d", "{input}", "{response}", "-o", "{output}"]),
    ("extract-1d", &["extract", "{input}", "-o", "{output}", "{interactive}"]),
    ("combine-2d", &["scombine", "{inputs}", "-o", "{output}"]),
];

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn minimal_file_takes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("options.toml");
        fs::write(
            &path,
            "dataset = \"night.json\"\n\n[skysub]\nauto = false\n\n[tasks.commands.rectify]\nprogram = \"my-rectify\"\nargs = [\"{input}\", \"{output}\"]\n",
        )
        .unwrap();

        let config = PipelineConfig::load(&path).unwrap();
        assert_eq!(config.dataset, PathBuf::from("night.json"));
        assert!(!config.skysub.auto);
        assert_eq!(config.skysub.order_bg, 3);
        assert_eq!(config.crr.niter, 4);
        assert_eq!(config.ob_status_path(), PathBuf::from("night.obd"));
        assert_eq!(config.tasks.commands["rectify"].program, "my-rectify");
        assert_eq!(config.tasks.commands["combine-2d"].program, "pynot");
        assert_eq!(config.tasks.commands.len(), DEFAULT_COMMANDS.len());
    }

    #[test]
    fn unknown_keys_and_bad_values_are_configuration_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("options.toml");

        for text in [
            "dataset = \"d.json\"\n[skysub]\nautomatic = true\n",
            "dataset = \"d.json\"\n[flat]\nlower = 3000\n",
            "dataset = \"\"\n",
        ] {
            fs::write(&path, text).unwrap();
            let err = PipelineConfig::load(&path).unwrap_err();
            assert!(matches!(err, PipelineError::Configuration(_)), "{}", text);
        }

        let err = PipelineConfig::load(&dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }

    #[test]
    fn default_file_parses_back() {
        let text = PipelineConfig::default_toml().unwrap();
        let parsed: PipelineConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.output_dir, PathBuf::from("spectra"));
        assert_eq!(parsed.tasks.commands, PipelineConfig::default().tasks.commands);
    }
}
