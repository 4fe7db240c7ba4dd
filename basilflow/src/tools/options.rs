//! Typed option sets for the model-fitting program.

use crate::errors::{BasilError, ImageError, Result};
use crate::image::SandboxImage;
use crate::workspace::Workspace;
use std::collections::BTreeMap;
use std::fmt;

/// Option keys understood by the fitting program.
pub mod keys {
    /// Input data file.
    pub const DATA: &str = "data";
    /// Mask file.
    pub const MASK: &str = "mask";
    /// Output directory.
    pub const OUTPUT: &str = "output";
    /// Replace an existing output directory.
    pub const OVERWRITE: &str = "overwrite";
    /// Save the posterior as the continuation artifact.
    pub const SAVE_MVN: &str = "save-mvn";
    /// Save posterior means.
    pub const SAVE_MEAN: &str = "save-mean";
    /// Save posterior standard deviations.
    pub const SAVE_STD: &str = "save-std";
    /// Save the model prediction.
    pub const SAVE_MODEL_FIT: &str = "save-model-fit";
    /// Warm-start from a saved posterior.
    pub const CONTINUE_FROM_MVN: &str = "continue-from-mvn";
    /// Inference method, `vb` or `spatialvb`.
    pub const METHOD: &str = "method";
    /// Forward model name.
    pub const MODEL: &str = "model";
    /// Noise model.
    pub const NOISE: &str = "noise";
    /// Iteration limit.
    pub const MAX_ITERATIONS: &str = "max-iterations";
    /// Spatial prior types, one letter per parameter.
    pub const SPATIAL_PRIORS: &str = "param-spatial-priors";
    /// Continuous labelling.
    pub const CASL: &str = "casl";
    /// Shared label duration.
    pub const TAU: &str = "tau";
    /// Uniform repeat count.
    pub const REPEATS: &str = "repeats";
    /// Tissue T1.
    pub const T1: &str = "t1";
    /// Blood T1.
    pub const T1B: &str = "t1b";
    /// Prior bolus arrival time.
    pub const BAT: &str = "bat";
    /// Prior bolus arrival time standard deviation.
    pub const BATSD: &str = "batsd";
    /// Partial volume correction.
    pub const PVCORR: &str = "pvcorr";
    /// Grey matter partial volume map.
    pub const PVGM: &str = "pvgm";
    /// White matter partial volume map.
    pub const PVWM: &str = "pvwm";

    /// Inversion time of delay `i` (1-based).
    #[must_use]
    pub fn ti(i: usize) -> String {
        format!("ti{i}")
    }

    /// Label duration of delay `i` (1-based).
    #[must_use]
    pub fn tau(i: usize) -> String {
        format!("tau{i}")
    }

    /// Repeat count of delay `i` (1-based).
    #[must_use]
    pub fn rpt(i: usize) -> String {
        format!("rpt{i}")
    }

    /// Include parameter group `param` in the model, e.g. `inctiss`.
    #[must_use]
    pub fn inc(param: &str) -> String {
        format!("inc{param}")
    }

    /// Infer parameter group `param`, e.g. `infertiss`.
    #[must_use]
    pub fn infer(param: &str) -> String {
        format!("infer{param}")
    }
}

/// Value of a single option.
#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    /// `true` renders a bare flag; `false` suppresses the option.
    Flag(bool),
    /// Text; empty text renders a bare flag.
    Text(String),
    /// Floating point value.
    Number(f64),
    /// Integer value.
    Integer(i64),
    /// Image, rendered as its file path once saved.
    Image(SandboxImage),
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flag(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v}"),
            Self::Number(v) => write!(f, "{v}"),
            Self::Integer(v) => write!(f, "{v}"),
            Self::Image(img) => match img.base_path() {
                Some(path) => write!(f, "{}", path.display()),
                None => write!(f, "{}", img.name()),
            },
        }
    }
}

impl From<bool> for OptionValue {
    fn from(v: bool) -> Self {
        Self::Flag(v)
    }
}

impl From<&str> for OptionValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<f64> for OptionValue {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

impl From<i64> for OptionValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<u32> for OptionValue {
    fn from(v: u32) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<SandboxImage> for OptionValue {
    fn from(v: SandboxImage) -> Self {
        Self::Image(v)
    }
}

/// An ordered set of options for the fitting program.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FitOptions {
    values: BTreeMap<String, OptionValue>,
}

impl FitOptions {
    /// Creates an empty option set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets an option, replacing any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<OptionValue>) -> &mut Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Sets a bare flag.
    pub fn flag(&mut self, key: impl Into<String>) -> &mut Self {
        self.set(key, true)
    }

    /// Builder form of [`FitOptions::set`].
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<OptionValue>) -> Self {
        self.set(key, value);
        self
    }

    /// Removes an option.
    pub fn remove(&mut self, key: &str) -> Option<OptionValue> {
        self.values.remove(key)
    }

    /// Looks up an option.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&OptionValue> {
        self.values.get(key)
    }

    /// True if the option is present (even if it renders to nothing).
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Iterates over options in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &OptionValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of options.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True if no options are set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Copies every option from `other`, replacing existing values.
    pub fn merge(&mut self, other: &FitOptions) -> &mut Self {
        for (key, value) in &other.values {
            self.values.insert(key.clone(), value.clone());
        }
        self
    }

    /// Applies fixed scaffolding options.
    ///
    /// Scaffolding always replaces caller-supplied values for the same keys,
    /// so data, mask and output locations cannot be redirected by options.
    pub fn apply_scaffold(&mut self, scaffold: &FitOptions) -> &mut Self {
        for key in scaffold.values.keys() {
            if let Some(previous) = self.values.get(key) {
                tracing::debug!(key = %key, value = %previous, "Scaffolding overrides option");
            }
        }
        self.merge(scaffold)
    }

    /// Saves in-memory image values into the workspace.
    pub fn materialize(&self, ws: &Workspace) -> Result<FitOptions> {
        let mut out = self.clone();
        for value in out.values.values_mut() {
            if let OptionValue::Image(img) = value {
                if img.dir().is_none() {
                    ws.add_img(img)?;
                }
            }
        }
        Ok(out)
    }

    /// Renders the options as command-line flags.
    ///
    /// `Flag(true)` and empty text render as `--key`; `Flag(false)` renders
    /// nothing; everything else renders as `--key=value`. Image values must
    /// already be saved to disk.
    pub fn to_flags(&self) -> Result<Vec<String>> {
        let mut flags = Vec::with_capacity(self.values.len());
        for (key, value) in &self.values {
            match value {
                OptionValue::Flag(false) => {}
                OptionValue::Flag(true) => flags.push(format!("--{key}")),
                OptionValue::Text(text) if text.is_empty() => flags.push(format!("--{key}")),
                OptionValue::Image(img) if img.dir().is_none() => {
                    return Err(BasilError::Image(ImageError::NoData(format!(
                        "{} (option '{key}' refers to an unsaved image)",
                        img.name()
                    ))));
                }
                other => flags.push(format!("--{key}={other}")),
            }
        }
        Ok(flags)
    }
}

impl<K: Into<String>, V: Into<OptionValue>> FromIterator<(K, V)> for FitOptions {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkspaceConfig;
    use crate::image::VoxelArray;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_flag_rendering_rules() {
        let opts: FitOptions = [
            ("casl", OptionValue::Flag(true)),
            ("inferart", OptionValue::Flag(false)),
            ("save-mvn", OptionValue::Text(String::new())),
            ("model", OptionValue::from("aslrest")),
            ("tau", OptionValue::Number(1.4)),
            ("repeats", OptionValue::Integer(8)),
        ]
        .into_iter()
        .collect();

        assert_eq!(
            opts.to_flags().unwrap(),
            vec!["--casl", "--model=aslrest", "--repeats=8", "--save-mvn", "--tau=1.4"]
        );
    }

    #[test]
    fn test_scaffold_overrides_caller_values() {
        let mut opts = FitOptions::new().with("data", "caller_data").with("noise", "white");
        let scaffold = FitOptions::new().with("data", "asl_diff").with("output", "step1");
        opts.apply_scaffold(&scaffold);

        assert_eq!(opts.get("data"), Some(&OptionValue::from("asl_diff")));
        assert_eq!(opts.get("noise"), Some(&OptionValue::from("white")));
        assert!(opts.contains("output"));
    }

    #[test]
    fn test_unsaved_image_cannot_render() {
        let img = SandboxImage::from_array("t1map", VoxelArray::zeros(vec![1, 1, 1]).unwrap());
        let opts = FitOptions::new().with("pvgm", img);
        assert!(opts.to_flags().is_err());

        let ws = Workspace::temporary(WorkspaceConfig::new()).unwrap();
        let saved = opts.materialize(&ws).unwrap();
        let flags = saved.to_flags().unwrap();
        assert_eq!(flags, vec![format!("--pvgm={}", ws.dir().join("t1map").display())]);
        assert!(ws.dir().join("t1map.nii.gz").is_file());
    }

    #[test]
    fn test_indexed_keys() {
        assert_eq!(keys::ti(2), "ti2");
        assert_eq!(keys::tau(1), "tau1");
        assert_eq!(keys::rpt(3), "rpt3");
        assert_eq!(keys::inc("bat"), "incbat");
        assert_eq!(keys::infer("tiss"), "infertiss");
    }
}
