//! Acquisition parameters and their validation.

use crate::errors::ConfigurationError;
use crate::tools::{keys, FitOptions, OptionValue};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How the ASL label was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelScheme {
    /// Continuous or pseudo-continuous labelling; needs label durations.
    Continuous,
    /// Pulsed labelling.
    Pulsed,
}

impl fmt::Display for LabelScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Continuous => write!(f, "cASL"),
            Self::Pulsed => write!(f, "pASL"),
        }
    }
}

/// Acquisition parameters as supplied by a caller, possibly incomplete.
///
/// Layers combine with [`AslParameters::overlay`]; the result is checked by
/// [`AslStructure::from_parameters`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AslParameters {
    /// Volume ordering, fastest-varying first: `t` delays, `r` repeats,
    /// `l` or `p` label/control pairs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<String>,
    /// Inversion times in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tis: Option<Vec<f64>>,
    /// Post-labelling delays in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plds: Option<Vec<f64>>,
    /// Label durations in seconds, one or one per delay.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub taus: Option<Vec<f64>>,
    /// Continuous labelling.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub casl: Option<bool>,
    /// Repeats, one or one per delay.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rpts: Option<Vec<usize>>,
}

impl AslParameters {
    /// Creates empty parameters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the volume ordering.
    #[must_use]
    pub fn with_order(mut self, order: impl Into<String>) -> Self {
        self.order = Some(order.into());
        self
    }

    /// Sets inversion times.
    #[must_use]
    pub fn with_tis(mut self, tis: Vec<f64>) -> Self {
        self.tis = Some(tis);
        self
    }

    /// Sets post-labelling delays.
    #[must_use]
    pub fn with_plds(mut self, plds: Vec<f64>) -> Self {
        self.plds = Some(plds);
        self
    }

    /// Sets label durations.
    #[must_use]
    pub fn with_taus(mut self, taus: Vec<f64>) -> Self {
        self.taus = Some(taus);
        self
    }

    /// Sets the labelling scheme.
    #[must_use]
    pub fn with_casl(mut self, casl: bool) -> Self {
        self.casl = Some(casl);
        self
    }

    /// Sets repeats.
    #[must_use]
    pub fn with_rpts(mut self, rpts: Vec<usize>) -> Self {
        self.rpts = Some(rpts);
        self
    }

    /// Returns these parameters with every value set in `overrides` replaced.
    #[must_use]
    pub fn overlay(&self, overrides: &AslParameters) -> AslParameters {
        AslParameters {
            order: overrides.order.clone().or_else(|| self.order.clone()),
            tis: overrides.tis.clone().or_else(|| self.tis.clone()),
            plds: overrides.plds.clone().or_else(|| self.plds.clone()),
            taus: overrides.taus.clone().or_else(|| self.taus.clone()),
            casl: overrides.casl.or(self.casl),
            rpts: overrides.rpts.clone().or_else(|| self.rpts.clone()),
        }
    }
}

/// Validated acquisition structure of a differenced ASL dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct AslStructure {
    order: String,
    delays: Vec<f64>,
    delays_are_plds: bool,
    taus: Option<Vec<f64>>,
    scheme: LabelScheme,
    rpts: Vec<usize>,
}

fn config_error(message: impl Into<String>, parameter: &str) -> ConfigurationError {
    ConfigurationError::new(message).with_parameter(parameter)
}

/// Expands a single value to `n` copies; otherwise the length must be `n`.
fn per_delay<T: Clone>(values: &[T], n: usize, parameter: &str) -> Result<Vec<T>, ConfigurationError> {
    match values.len() {
        1 => Ok(vec![values[0].clone(); n]),
        len if len == n => Ok(values.to_vec()),
        len => Err(config_error(
            format!("{parameter} has {len} values but there are {n} delays"),
            parameter,
        )),
    }
}

fn all_equal(values: &[f64]) -> bool {
    values.windows(2).all(|w| w[0] == w[1])
}

impl AslStructure {
    /// Validates `params` against a dataset with `nvols` volumes.
    pub fn from_parameters(params: &AslParameters, nvols: usize) -> Result<Self, ConfigurationError> {
        let (delays, delays_are_plds) = match (&params.tis, &params.plds) {
            (Some(_), Some(_)) => return Err(config_error("Cannot specify both tis and plds", "plds")),
            (None, None) => return Err(config_error("Must specify either tis or plds", "tis")),
            (Some(tis), None) => (tis.clone(), false),
            (None, Some(plds)) => (plds.clone(), true),
        };
        let delay_param = if delays_are_plds { "plds" } else { "tis" };
        if delays.is_empty() {
            return Err(config_error("At least one delay is required", delay_param));
        }
        if delays.iter().any(|d| !d.is_finite() || *d < 0.0) {
            return Err(config_error("Delays must be non-negative numbers", delay_param));
        }
        let ntis = delays.len();

        let scheme = match params.casl {
            Some(true) => LabelScheme::Continuous,
            Some(false) => LabelScheme::Pulsed,
            None if delays_are_plds => LabelScheme::Continuous,
            None => LabelScheme::Pulsed,
        };

        let taus = match &params.taus {
            Some(taus) => {
                let taus = per_delay(taus, ntis, "taus")?;
                if taus.iter().any(|t| !t.is_finite() || *t <= 0.0) {
                    return Err(config_error("Label durations must be positive", "taus"));
                }
                Some(taus)
            }
            None if scheme == LabelScheme::Continuous => {
                return Err(config_error("Label durations (taus) are required for continuous labelling", "taus"));
            }
            None => None,
        };

        let order = params.order.clone().unwrap_or_else(|| "rt".to_string());
        if order.contains(['l', 'p']) {
            return Err(config_error(
                format!("Data must be label-control differenced before fitting (order '{order}')"),
                "order",
            ));
        }
        if order != "rt" && order != "tr" {
            return Err(config_error(format!("Unrecognised volume order '{order}'"), "order"));
        }

        let rpts = match &params.rpts {
            Some(rpts) => {
                let rpts = per_delay(rpts, ntis, "rpts")?;
                if rpts.contains(&0) {
                    return Err(config_error("Repeat counts must be at least 1", "rpts"));
                }
                let total: usize = rpts.iter().sum();
                if total != nvols {
                    return Err(config_error(
                        format!("Repeats account for {total} volumes but the data has {nvols}"),
                        "rpts",
                    ));
                }
                rpts
            }
            None => {
                if nvols == 0 || nvols % ntis != 0 {
                    return Err(config_error(
                        format!("{nvols} volumes cannot be divided evenly between {ntis} delays"),
                        "rpts",
                    ));
                }
                vec![nvols / ntis; ntis]
            }
        };

        if ntis > 1 && rpts.iter().any(|&r| r > 1) && order != "rt" {
            return Err(config_error(
                "Multi-delay data with repeats must be grouped by delay (order 'rt')",
                "order",
            ));
        }

        Ok(Self {
            order,
            delays,
            delays_are_plds,
            taus,
            scheme,
            rpts,
        })
    }

    /// Number of delays.
    #[must_use]
    pub fn ntis(&self) -> usize {
        self.delays.len()
    }

    /// Total number of volumes.
    #[must_use]
    pub fn nvols(&self) -> usize {
        self.rpts.iter().sum()
    }

    /// Volume ordering.
    #[must_use]
    pub fn order(&self) -> &str {
        &self.order
    }

    /// Delays as given, either inversion times or post-labelling delays.
    #[must_use]
    pub fn delays(&self) -> &[f64] {
        &self.delays
    }

    /// Label durations, one per delay.
    #[must_use]
    pub fn taus(&self) -> Option<&[f64]> {
        self.taus.as_deref()
    }

    /// Labelling scheme.
    #[must_use]
    pub fn scheme(&self) -> LabelScheme {
        self.scheme
    }

    /// True for continuous labelling.
    #[must_use]
    pub fn is_continuous(&self) -> bool {
        self.scheme == LabelScheme::Continuous
    }

    /// Repeats per delay.
    #[must_use]
    pub fn repeats(&self) -> &[usize] {
        &self.rpts
    }

    /// Always true: label/control pairs are rejected at construction.
    #[must_use]
    pub fn is_differenced(&self) -> bool {
        !self.order.contains(['l', 'p'])
    }

    /// Inversion times passed to the fitting program.
    ///
    /// Under continuous labelling each is the delay plus its label duration.
    #[must_use]
    pub fn fitting_tis(&self) -> Vec<f64> {
        match (&self.taus, self.scheme) {
            (Some(taus), LabelScheme::Continuous) => {
                self.delays.iter().zip(taus).map(|(delay, tau)| delay + tau).collect()
            }
            _ => self.delays.clone(),
        }
    }

    /// Timing options for the fitting program.
    ///
    /// A single `tau` is used when all label durations are identical, and a
    /// single `repeats` when all repeat counts are.
    #[must_use]
    pub fn timing_options(&self) -> FitOptions {
        let mut options = FitOptions::new();

        if let (LabelScheme::Continuous, Some(taus)) = (self.scheme, &self.taus) {
            options.flag(keys::CASL);
            if all_equal(taus) {
                options.set(keys::TAU, taus[0]);
            } else {
                for (idx, tau) in taus.iter().enumerate() {
                    options.set(keys::tau(idx + 1), *tau);
                }
            }
        }

        for (idx, ti) in self.fitting_tis().into_iter().enumerate() {
            options.set(keys::ti(idx + 1), ti);
        }

        if self.rpts.windows(2).all(|w| w[0] == w[1]) {
            options.set(keys::REPEATS, OptionValue::Integer(self.rpts[0] as i64));
        } else {
            for (idx, rpt) in self.rpts.iter().enumerate() {
                options.set(keys::rpt(idx + 1), OptionValue::Integer(*rpt as i64));
            }
        }

        options
    }

    /// Parameters that reproduce this structure.
    #[must_use]
    pub fn to_parameters(&self) -> AslParameters {
        AslParameters {
            order: Some(self.order.clone()),
            tis: (!self.delays_are_plds).then(|| self.delays.clone()),
            plds: self.delays_are_plds.then(|| self.delays.clone()),
            taus: self.taus.clone(),
            casl: Some(self.is_continuous()),
            rpts: Some(self.rpts.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn number(options: &FitOptions, key: &str) -> f64 {
        match options.get(key) {
            Some(OptionValue::Number(v)) => *v,
            other => panic!("{key} is {other:?}"),
        }
    }

    #[test]
    fn test_equal_taus_give_single_tau() {
        let params = AslParameters::new()
            .with_plds(vec![0.25, 0.5, 0.75, 1.0])
            .with_taus(vec![1.4; 4]);
        let structure = AslStructure::from_parameters(&params, 8).unwrap();
        let options = structure.timing_options();

        assert_eq!(options.get("casl"), Some(&OptionValue::Flag(true)));
        assert!((number(&options, "tau") - 1.4).abs() < 1e-12);
        assert!(!options.contains("tau1"));
        assert!((number(&options, "ti4") - 2.4).abs() < 1e-12);
        assert_eq!(options.get("repeats"), Some(&OptionValue::Integer(2)));
    }

    #[test]
    fn test_differing_taus_give_indexed_taus() {
        let params = AslParameters::new()
            .with_plds(vec![1.0, 1.5])
            .with_taus(vec![1.4, 1.6])
            .with_casl(true);
        let options = AslStructure::from_parameters(&params, 2).unwrap().timing_options();

        assert!(!options.contains("tau"));
        assert!((number(&options, "tau1") - 1.4).abs() < 1e-12);
        assert!((number(&options, "tau2") - 1.6).abs() < 1e-12);
        assert!((number(&options, "ti2") - 3.1).abs() < 1e-12);
    }

    #[test]
    fn test_pulsed_uses_raw_delays() {
        let params = AslParameters::new().with_tis(vec![1.5, 2.0]).with_taus(vec![0.7]);
        let structure = AslStructure::from_parameters(&params, 2).unwrap();
        assert_eq!(structure.scheme(), LabelScheme::Pulsed);
        assert_eq!(structure.fitting_tis(), vec![1.5, 2.0]);

        let options = structure.timing_options();
        assert!(!options.contains("casl"));
        assert!(!options.contains("tau"));
    }

    #[test]
    fn test_uneven_repeats_give_indexed_repeats() {
        let params = AslParameters::new().with_tis(vec![1.0, 2.0]).with_rpts(vec![3, 1]);
        let options = AslStructure::from_parameters(&params, 4).unwrap().timing_options();
        assert_eq!(options.get("rpt1"), Some(&OptionValue::Integer(3)));
        assert_eq!(options.get("rpt2"), Some(&OptionValue::Integer(1)));
        assert!(!options.contains("repeats"));
    }

    #[test]
    fn test_validation_errors() {
        let missing = AslStructure::from_parameters(&AslParameters::new(), 4).unwrap_err();
        assert_eq!(missing.parameter.as_deref(), Some("tis"));

        let both = AslParameters::new().with_tis(vec![1.0]).with_plds(vec![1.0]);
        assert!(AslStructure::from_parameters(&both, 1).is_err());

        let casl_without_taus = AslParameters::new().with_plds(vec![1.0]);
        let err = AslStructure::from_parameters(&casl_without_taus, 1).unwrap_err();
        assert_eq!(err.parameter.as_deref(), Some("taus"));

        let pairs = AslParameters::new().with_tis(vec![1.0]).with_order("prt");
        let err = AslStructure::from_parameters(&pairs, 2).unwrap_err();
        assert!(err.message.contains("differenced"));

        let uneven = AslParameters::new().with_tis(vec![1.0, 2.0, 3.0]);
        assert!(AslStructure::from_parameters(&uneven, 4).is_err());

        let wrong_len = AslParameters::new().with_plds(vec![1.0, 2.0]).with_taus(vec![1.0, 1.0, 1.0]);
        assert!(AslStructure::from_parameters(&wrong_len, 2).is_err());

        let blocked = AslParameters::new().with_tis(vec![1.0, 2.0]).with_order("tr");
        let err = AslStructure::from_parameters(&blocked, 4).unwrap_err();
        assert_eq!(err.parameter.as_deref(), Some("order"));
    }

    #[test]
    fn test_overlay_and_round_trip() {
        let stored = AslParameters::new().with_plds(vec![1.0]).with_taus(vec![1.8]).with_rpts(vec![4]);
        let merged = stored.overlay(&AslParameters::new().with_taus(vec![1.4]));
        assert_eq!(merged.taus, Some(vec![1.4]));
        assert_eq!(merged.plds, Some(vec![1.0]));

        let structure = AslStructure::from_parameters(&merged, 4).unwrap();
        let back = AslStructure::from_parameters(&structure.to_parameters(), 4).unwrap();
        assert_eq!(back, structure);
        assert!(back.is_differenced());
    }
}
