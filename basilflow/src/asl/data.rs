//! ASL datasets paired with their acquisition structure.

use super::structure::{AslParameters, AslStructure};
use crate::errors::{BasilError, ConfigurationError, Result};
use crate::image::SandboxImage;
use crate::store::ImageStore;

/// Prefix of the store extra that records a dataset's structure.
pub const STRUCTURE_KEY_PREFIX: &str = "ASL_STRUCTURE_";

/// Store extra key under which the structure of dataset `name` is recorded.
#[must_use]
pub fn structure_key(name: &str) -> String {
    format!("{STRUCTURE_KEY_PREFIX}{name}")
}

/// A differenced ASL dataset with a validated structure.
#[derive(Debug, Clone)]
pub struct AslImage {
    image: SandboxImage,
    structure: AslStructure,
}

impl AslImage {
    /// Validates `params` against the volumes of `image`.
    pub fn new(image: SandboxImage, params: &AslParameters) -> Result<Self> {
        let shape = image.shape()?;
        let nvols = shape.get(3).copied().unwrap_or(1);
        let structure = AslStructure::from_parameters(params, nvols)?;
        Ok(Self { image, structure })
    }

    /// Loads dataset `name` from the store.
    ///
    /// The structure recorded for the dataset, if any, is combined with
    /// `overrides` (which take precedence). On success the combined structure
    /// is recorded back so later steps see the same acquisition.
    pub fn from_store(store: &dyn ImageStore, name: &str, overrides: &AslParameters) -> Result<Self> {
        let image = store.require(name)?;
        let key = structure_key(name);

        let stored = match store.extra(&key) {
            Some(text) => serde_json::from_str::<AslParameters>(&text).map_err(|e| {
                ConfigurationError::new(format!("Recorded structure of '{name}' is invalid: {e}"))
                    .with_parameter(key.clone())
            })?,
            None => AslParameters::default(),
        };

        let asl = Self::new(image, &stored.overlay(overrides))?;
        let recorded = serde_json::to_string(&asl.structure.to_parameters())
            .map_err(|e| BasilError::Internal(format!("Could not record structure of '{name}': {e}")))?;
        store.set_extra(&key, recorded);
        Ok(asl)
    }

    /// The image data.
    #[must_use]
    pub fn image(&self) -> &SandboxImage {
        &self.image
    }

    /// The acquisition structure.
    #[must_use]
    pub fn structure(&self) -> &AslStructure {
        &self.structure
    }

    /// Logical name of the dataset.
    #[must_use]
    pub fn name(&self) -> &str {
        self.image.name()
    }

    /// Consumes the dataset, returning the image.
    #[must_use]
    pub fn into_image(self) -> SandboxImage {
        self.image
    }
}
