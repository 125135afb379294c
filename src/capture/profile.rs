//! Per-camera-model property schemas.
//!
//! The profile file maps a camera model name to the resolutions it offers and
//! the properties it exposes. Only the `name -> value` pairs are consumed here;
//! ranges are kept for callers that want to validate requests.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::CameraProperty;
use crate::error::ConfigError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CameraProfiles {
    pub models: HashMap<String, CameraProfile>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CameraProfile {
    #[serde(default)]
    pub resolutions: Vec<(u32, u32)>,
    #[serde(default)]
    pub properties: Vec<PropertySpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertySpec {
    pub name: String,
    pub min: i32,
    pub max: i32,
    #[serde(default = "default_step")]
    pub step: i32,
    pub default: i32,
    /// Falls back to `default` when absent
    pub value: Option<i32>,
}

fn default_step() -> i32 {
    1
}

impl CameraProfiles {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::ProfileIo {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::ProfileParse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn model(&self, name: &str) -> Result<&CameraProfile, ConfigError> {
        self.models
            .get(name)
            .ok_or_else(|| ConfigError::UnknownModel(name.to_string()))
    }
}

impl CameraProfile {
    /// The property values this profile asks for, clamped to their ranges.
    /// Names the capture layer doesn't know are skipped.
    pub fn property_values(&self) -> BTreeMap<CameraProperty, i32> {
        self.properties
            .iter()
            .filter_map(|spec| match spec.name.parse::<CameraProperty>() {
                Ok(property) => {
                    let (lo, hi) = (spec.min.min(spec.max), spec.max.max(spec.min));
                    let value = spec.value.unwrap_or(spec.default).clamp(lo, hi);
                    Some((property, value))
                }
                Err(e) => {
                    warn!("Ignoring profile entry: {}", e);
                    None
                }
            })
            .collect()
    }

    pub fn supports_resolution(&self, width: u32, height: u32) -> bool {
        self.resolutions.is_empty() || self.resolutions.contains(&(width, height))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const PROFILES: &str = r#"{
        "C920": {
            "resolutions": [[640, 480], [1280, 720]],
            "properties": [
                {"name": "brightness", "min": 0, "max": 255, "step": 1, "default": 128, "value": 140},
                {"name": "focus_auto", "min": 0, "max": 1, "default": 1},
                {"name": "exposure", "min": 3, "max": 2047, "default": 250, "value": 5000},
                {"name": "iris", "min": 0, "max": 10, "default": 5}
            ]
        }
    }"#;

    #[test]
    fn loads_values_for_a_model() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(PROFILES.as_bytes()).unwrap();

        let profiles = CameraProfiles::load(file.path()).unwrap();
        let profile = profiles.model("C920").unwrap();
        let values = profile.property_values();

        assert_eq!(values.get(&CameraProperty::Brightness), Some(&140));
        assert_eq!(values.get(&CameraProperty::FocusAuto), Some(&1));
        assert_eq!(values.get(&CameraProperty::Exposure), Some(&2047));
        assert_eq!(values.len(), 3);
        assert!(profile.supports_resolution(1280, 720));
        assert!(!profile.supports_resolution(1920, 1080));
    }

    #[test]
    fn unknown_model_is_an_error() {
        let profiles: CameraProfiles = serde_json::from_str(PROFILES).unwrap();
        assert!(matches!(
            profiles.model("Brio"),
            Err(ConfigError::UnknownModel(name)) if name == "Brio"
        ));
    }

    #[test]
    fn malformed_file_reports_its_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{ not json").unwrap();
        let err = CameraProfiles::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ProfileParse { .. }));
    }
}
