//! Decomposing an analysis into staged model-fitting steps.

use crate::asl::AslImage;
use crate::errors::{ConfigurationError, Result};
use crate::image::SandboxImage;
use crate::store::ImageStore;
use crate::tools::{keys, FitOptions, OptionValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

fn default_model_group() -> String {
    "asl".to_string()
}

fn default_model() -> String {
    "aslrest".to_string()
}

fn default_noise() -> String {
    "white".to_string()
}

fn default_max_iterations() -> u32 {
    20
}

fn default_t1() -> f64 {
    1.3
}

fn default_t1b() -> f64 {
    1.65
}

fn default_bat() -> f64 {
    1.3
}

fn default_batsd() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

/// High-level analysis options for a staged fit.
///
/// Each `infer_*` toggle and `spatial` adds one step after the initial
/// tissue step. Image options name datasets in the
/// [`ImageStore`](crate::store::ImageStore).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisOptions {
    /// Model group, selecting the `fabber_<group>` program.
    #[serde(default = "default_model_group")]
    pub model_group: String,
    /// Forward model.
    #[serde(default = "default_model")]
    pub model: String,
    /// Noise model.
    #[serde(default = "default_noise")]
    pub noise: String,
    /// Iteration limit per step.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Tissue T1 in seconds.
    #[serde(default = "default_t1")]
    pub t1: f64,
    /// Blood T1 in seconds.
    #[serde(default = "default_t1b")]
    pub t1b: f64,
    /// Prior mean arrival time in seconds.
    #[serde(default = "default_bat")]
    pub bat: f64,
    /// Prior standard deviation of the arrival time.
    #[serde(default = "default_batsd")]
    pub batsd: f64,
    /// Infer arrival time in the tissue step.
    #[serde(default = "default_true")]
    pub infer_bat: bool,
    /// Add an arterial (macro-vascular) step.
    #[serde(default)]
    pub infer_art: bool,
    /// Add a label-duration step.
    #[serde(default)]
    pub infer_tau: bool,
    /// Add a T1 step.
    #[serde(default)]
    pub infer_t1: bool,
    /// Add a spatially regularized step.
    #[serde(default)]
    pub spatial: bool,
    /// Stored T1 map used as an image prior.
    #[serde(default)]
    pub t1im: Option<String>,
    /// Stored white matter partial volume map.
    #[serde(default)]
    pub pwm: Option<String>,
    /// Stored grey matter partial volume map.
    #[serde(default)]
    pub pgm: Option<String>,
    /// Additional options passed to every step; empty values are bare flags.
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            model_group: default_model_group(),
            model: default_model(),
            noise: default_noise(),
            max_iterations: default_max_iterations(),
            t1: default_t1(),
            t1b: default_t1b(),
            bat: default_bat(),
            batsd: default_batsd(),
            infer_bat: true,
            infer_art: false,
            infer_tau: false,
            infer_t1: false,
            spatial: false,
            t1im: None,
            pwm: None,
            pgm: None,
            extra: BTreeMap::new(),
        }
    }
}

impl AnalysisOptions {
    /// Creates default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether arrival time is inferred.
    #[must_use]
    pub fn with_infer_bat(mut self, infer: bool) -> Self {
        self.infer_bat = infer;
        self
    }

    /// Sets whether an arterial step is added.
    #[must_use]
    pub fn with_infer_art(mut self, infer: bool) -> Self {
        self.infer_art = infer;
        self
    }

    /// Sets whether a label-duration step is added.
    #[must_use]
    pub fn with_infer_tau(mut self, infer: bool) -> Self {
        self.infer_tau = infer;
        self
    }

    /// Sets whether a T1 step is added.
    #[must_use]
    pub fn with_infer_t1(mut self, infer: bool) -> Self {
        self.infer_t1 = infer;
        self
    }

    /// Sets whether a spatial step is added.
    #[must_use]
    pub fn with_spatial(mut self, spatial: bool) -> Self {
        self.spatial = spatial;
        self
    }

    /// Uses the stored image `name` as a T1 prior.
    #[must_use]
    pub fn with_t1_map(mut self, name: impl Into<String>) -> Self {
        self.t1im = Some(name.into());
        self
    }

    /// Enables partial volume correction with stored grey and white matter maps.
    #[must_use]
    pub fn with_pv_maps(mut self, pgm: impl Into<String>, pwm: impl Into<String>) -> Self {
        self.pgm = Some(pgm.into());
        self.pwm = Some(pwm.into());
        self
    }

    /// Adds an extra option for every step.
    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// One model fit in a staged analysis.
#[derive(Debug, Clone)]
pub struct FitStep {
    /// 1-based step number.
    pub number: usize,
    /// Human-readable description, e.g. `STEP 2: VB - Arterial`.
    pub description: String,
    /// Input data.
    pub data: SandboxImage,
    /// Fitting mask.
    pub mask: SandboxImage,
    /// Fitting options, excluding scaffolding.
    pub options: FitOptions,
    /// Step whose posterior initializes this one.
    pub prev_step: Option<usize>,
    /// The last step saves summary outputs.
    pub is_final: bool,
}

fn stored_image(store: &dyn ImageStore, name: &str, role: &str) -> Result<SandboxImage> {
    Ok(store.require(name)?.with_role(role))
}

/// Options shared by every step.
fn base_options(asl: &AslImage, options: &AnalysisOptions, store: &dyn ImageStore) -> Result<FitOptions> {
    let mut base = FitOptions::new()
        .with(keys::METHOD, "vb")
        .with(keys::MODEL, options.model.as_str())
        .with(keys::NOISE, options.noise.as_str())
        .with(keys::MAX_ITERATIONS, options.max_iterations)
        .with(keys::T1, options.t1)
        .with(keys::T1B, options.t1b)
        .with(keys::BAT, options.bat)
        .with(keys::BATSD, options.batsd);
    base.merge(&asl.structure().timing_options());

    if let Some(ref name) = options.t1im {
        base.set("PSP_byname1", "T_1")
            .set("PSP_byname1_type", "I")
            .set("PSP_byname1_image", stored_image(store, name, "T1 map")?);
    }

    match (&options.pgm, &options.pwm) {
        (Some(pgm), Some(pwm)) => {
            base.flag(keys::PVCORR)
                .set(keys::PVGM, stored_image(store, pgm, "Grey matter PV map")?)
                .set(keys::PVWM, stored_image(store, pwm, "White matter PV map")?);
        }
        (None, None) => {}
        (Some(_), None) | (None, Some(_)) => {
            return Err(ConfigurationError::new(
                "Partial volume correction needs both grey and white matter maps",
            )
            .with_parameter(if options.pwm.is_none() { "pwm" } else { "pgm" })
            .into());
        }
    }

    Ok(base)
}

/// Builds the ordered step list for an analysis.
///
/// Every step inherits the inference flags of the steps before it and
/// continues from its immediate predecessor. Stored images named by the
/// options must exist.
pub fn build_steps(
    asl: &AslImage,
    mask: &SandboxImage,
    options: &AnalysisOptions,
    store: &dyn ImageStore,
) -> Result<Vec<FitStep>> {
    if options.max_iterations == 0 {
        return Err(ConfigurationError::new("max_iterations must be at least 1")
            .with_parameter("max_iterations")
            .into());
    }

    let extra: FitOptions = options
        .extra
        .iter()
        .map(|(key, value)| (key.clone(), OptionValue::Text(value.clone())))
        .collect();

    let mut current = base_options(asl, options, store)?;
    current.flag(keys::inc("tiss")).flag(keys::infer("tiss")).flag(keys::inc("bat"));
    if options.infer_bat {
        current.flag(keys::infer("bat"));
    }

    let mut stages = vec![("VB - Tissue", current.clone())];
    if options.infer_art {
        current.flag(keys::inc("art")).flag(keys::infer("art"));
        stages.push(("VB - Arterial", current.clone()));
    }
    if options.infer_tau {
        current.flag(keys::inc("tau")).flag(keys::infer("tau"));
        stages.push(("VB - Bolus duration", current.clone()));
    }
    if options.infer_t1 {
        current.flag(keys::inc("t1")).flag(keys::infer("t1"));
        stages.push(("VB - T1", current.clone()));
    }
    if options.spatial {
        current.set(keys::METHOD, "spatialvb").set(keys::SPATIAL_PRIORS, "N+");
        stages.push(("Spatial VB", current));
    }

    let mask = mask.clone().with_role("Mask");
    let total = stages.len();
    let steps = stages
        .into_iter()
        .enumerate()
        .map(|(idx, (name, mut step_options))| {
            let number = idx + 1;
            step_options.merge(&extra);
            FitStep {
                number,
                description: format!("STEP {number}: {name}"),
                data: asl.image().clone(),
                mask: mask.clone(),
                options: step_options,
                prev_step: (number > 1).then(|| number - 1),
                is_final: number == total,
            }
        })
        .collect();
    Ok(steps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asl::AslParameters;
    use crate::errors::BasilError;
    use crate::image::VoxelArray;
    use crate::store::InMemoryImageStore;
    use pretty_assertions::assert_eq;

    fn asl() -> AslImage {
        let image = SandboxImage::from_array("asl_diff", VoxelArray::zeros(vec![2, 2, 1, 4]).unwrap());
        AslImage::new(image, &AslParameters::new().with_plds(vec![1.0, 1.5]).with_taus(vec![1.8])).unwrap()
    }

    fn mask() -> SandboxImage {
        SandboxImage::from_array("brain", VoxelArray::filled(vec![2, 2, 1], 1.0).unwrap())
    }

    #[test]
    fn test_single_tissue_step() {
        let store = InMemoryImageStore::new();
        let steps = build_steps(&asl(), &mask(), &AnalysisOptions::default(), &store).unwrap();

        assert_eq!(steps.len(), 1);
        let step = &steps[0];
        assert_eq!(step.description, "STEP 1: VB - Tissue");
        assert!(step.is_final);
        assert_eq!(step.prev_step, None);
        assert_eq!(step.mask.role(), "Mask");
        assert!(step.options.contains("infertiss"));
        assert!(step.options.contains("inferbat"));
        assert!(step.options.contains("casl"));
        assert_eq!(step.options.get("tau"), Some(&OptionValue::Number(1.8)));
        assert_eq!(step.options.get("method"), Some(&OptionValue::from("vb")));
    }

    #[test]
    fn test_staged_steps_accumulate_inference() {
        let store = InMemoryImageStore::new();
        let options = AnalysisOptions::new()
            .with_infer_art(true)
            .with_infer_tau(true)
            .with_infer_t1(true)
            .with_spatial(true)
            .with_infer_bat(false);
        let steps = build_steps(&asl(), &mask(), &options, &store).unwrap();

        let descriptions: Vec<_> = steps.iter().map(|s| s.description.as_str()).collect();
        assert_eq!(
            descriptions,
            vec![
                "STEP 1: VB - Tissue",
                "STEP 2: VB - Arterial",
                "STEP 3: VB - Bolus duration",
                "STEP 4: VB - T1",
                "STEP 5: Spatial VB",
            ]
        );
        assert!(!steps[0].options.contains("inferbat"));
        assert!(!steps[0].options.contains("inferart"));
        assert!(steps[2].options.contains("inferart"));
        assert!(steps[4].options.contains("infert1"));
        assert_eq!(steps[4].options.get("method"), Some(&OptionValue::from("spatialvb")));
        assert_eq!(steps[3].options.get("method"), Some(&OptionValue::from("vb")));

        let prev: Vec<_> = steps.iter().map(|s| s.prev_step).collect();
        assert_eq!(prev, vec![None, Some(1), Some(2), Some(3), Some(4)]);
        assert_eq!(steps.iter().filter(|s| s.is_final).count(), 1);
        assert!(steps[4].is_final);
    }

    #[test]
    fn test_image_options_resolve_from_store() {
        let store = InMemoryImageStore::new();
        store.add("gm", mask());
        store.add("wm", mask());
        store.add("t1", mask());
        let options = AnalysisOptions::new().with_pv_maps("gm", "wm").with_t1_map("t1");
        let steps = build_steps(&asl(), &mask(), &options, &store).unwrap();

        let opts = &steps[0].options;
        assert!(opts.contains("pvcorr"));
        match opts.get("pvgm") {
            Some(OptionValue::Image(img)) => assert_eq!(img.role(), "Grey matter PV map"),
            other => panic!("unexpected pvgm {other:?}"),
        }
        assert_eq!(opts.get("PSP_byname1"), Some(&OptionValue::from("T_1")));
    }

    #[test]
    fn test_missing_store_image_is_not_found() {
        let store = InMemoryImageStore::new();
        let options = AnalysisOptions::new().with_t1_map("t1_missing");
        let err = build_steps(&asl(), &mask(), &options, &store).unwrap_err();
        assert!(matches!(err, BasilError::ResourceNotFound { ref name } if name == "t1_missing"));
    }

    #[test]
    fn test_single_pv_map_is_configuration_error() {
        let store = InMemoryImageStore::new();
        store.add("gm", mask());
        let options = AnalysisOptions {
            pgm: Some("gm".to_string()),
            ..AnalysisOptions::default()
        };
        let err = build_steps(&asl(), &mask(), &options, &store).unwrap_err();
        assert!(matches!(err, BasilError::Configuration(_)));
    }

    #[test]
    fn test_extra_options_and_serde_defaults() {
        let options: AnalysisOptions =
            serde_json::from_str(r#"{"infer_art": true, "extra": {"allow-bad-voxels": "", "max-iterations": "50"}}"#)
                .unwrap();
        assert_eq!(options.model, "aslrest");
        assert!(options.infer_bat);

        let store = InMemoryImageStore::new();
        let steps = build_steps(&asl(), &mask(), &options, &store).unwrap();
        assert_eq!(steps.len(), 2);
        let flags = steps[1].options.to_flags().unwrap();
        assert!(flags.contains(&"--allow-bad-voxels".to_string()));
        assert!(flags.contains(&"--max-iterations=50".to_string()));
    }
}
