//! Named camera properties and their V4L2 control ids

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

const USER_CLASS_BASE: u32 = 0x0098_0900;
const CAMERA_CLASS_BASE: u32 = 0x009a_0900;

/// Device properties a camera profile may set
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraProperty {
    Brightness,
    Contrast,
    Saturation,
    Hue,
    Gamma,
    Gain,
    WhiteBalanceTemperature,
    Sharpness,
    BacklightCompensation,
    WhiteBalanceAuto,
    Exposure,
    Pan,
    Tilt,
    Focus,
    Zoom,
    FocusAuto,
    AutoExposure,
}

impl CameraProperty {
    pub const ALL: [CameraProperty; 17] = [
        CameraProperty::Brightness,
        CameraProperty::Contrast,
        CameraProperty::Saturation,
        CameraProperty::Hue,
        CameraProperty::Gamma,
        CameraProperty::Gain,
        CameraProperty::WhiteBalanceTemperature,
        CameraProperty::Sharpness,
        CameraProperty::BacklightCompensation,
        CameraProperty::WhiteBalanceAuto,
        CameraProperty::Exposure,
        CameraProperty::Pan,
        CameraProperty::Tilt,
        CameraProperty::Focus,
        CameraProperty::Zoom,
        CameraProperty::FocusAuto,
        CameraProperty::AutoExposure,
    ];

    pub fn name(self) -> &'static str {
        match self {
            CameraProperty::Brightness => "brightness",
            CameraProperty::Contrast => "contrast",
            CameraProperty::Saturation => "saturation",
            CameraProperty::Hue => "hue",
            CameraProperty::Gamma => "gamma",
            CameraProperty::Gain => "gain",
            CameraProperty::WhiteBalanceTemperature => "white_balance_temperature",
            CameraProperty::Sharpness => "sharpness",
            CameraProperty::BacklightCompensation => "backlight_compensation",
            CameraProperty::WhiteBalanceAuto => "white_balance_auto",
            CameraProperty::Exposure => "exposure",
            CameraProperty::Pan => "pan",
            CameraProperty::Tilt => "tilt",
            CameraProperty::Focus => "focus",
            CameraProperty::Zoom => "zoom",
            CameraProperty::FocusAuto => "focus_auto",
            CameraProperty::AutoExposure => "auto_exposure",
        }
    }

    /// V4L2 control id (`V4L2_CID_*`)
    pub fn v4l2_id(self) -> u32 {
        match self {
            CameraProperty::Brightness => USER_CLASS_BASE,
            CameraProperty::Contrast => USER_CLASS_BASE + 1,
            CameraProperty::Saturation => USER_CLASS_BASE + 2,
            CameraProperty::Hue => USER_CLASS_BASE + 3,
            CameraProperty::WhiteBalanceAuto => USER_CLASS_BASE + 12,
            CameraProperty::Gamma => USER_CLASS_BASE + 16,
            CameraProperty::Gain => USER_CLASS_BASE + 19,
            CameraProperty::WhiteBalanceTemperature => USER_CLASS_BASE + 26,
            CameraProperty::Sharpness => USER_CLASS_BASE + 27,
            CameraProperty::BacklightCompensation => USER_CLASS_BASE + 28,
            CameraProperty::AutoExposure => CAMERA_CLASS_BASE + 1,
            CameraProperty::Exposure => CAMERA_CLASS_BASE + 2,
            CameraProperty::Pan => CAMERA_CLASS_BASE + 8,
            CameraProperty::Tilt => CAMERA_CLASS_BASE + 9,
            CameraProperty::Focus => CAMERA_CLASS_BASE + 10,
            CameraProperty::FocusAuto => CAMERA_CLASS_BASE + 12,
            CameraProperty::Zoom => CAMERA_CLASS_BASE + 13,
        }
    }

    /// Boolean controls take 0/1 rather than a ranged integer
    pub fn is_toggle(self) -> bool {
        matches!(
            self,
            CameraProperty::WhiteBalanceAuto | CameraProperty::FocusAuto
        )
    }
}

impl fmt::Display for CameraProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown camera property {0:?}")]
pub struct UnknownProperty(pub String);

impl FromStr for CameraProperty {
    type Err = UnknownProperty;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace([' ', '-'], "_");
        CameraProperty::ALL
            .into_iter()
            .find(|p| p.name() == wanted)
            .ok_or_else(|| UnknownProperty(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_parse_back() {
        for prop in CameraProperty::ALL {
            assert_eq!(prop.name().parse::<CameraProperty>(), Ok(prop));
        }
        assert_eq!(
            "White Balance Temperature".parse::<CameraProperty>(),
            Ok(CameraProperty::WhiteBalanceTemperature)
        );
        assert!("iso".parse::<CameraProperty>().is_err());
    }

    #[test]
    fn control_ids_are_distinct() {
        let mut ids: Vec<u32> = CameraProperty::ALL.iter().map(|p| p.v4l2_id()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), CameraProperty::ALL.len());
        assert_eq!(CameraProperty::Brightness.v4l2_id(), 0x0098_0900);
        assert_eq!(CameraProperty::Zoom.v4l2_id(), 0x009a_090d);
    }

    #[test]
    fn serde_uses_snake_case_names() {
        let json = serde_json::to_string(&CameraProperty::BacklightCompensation).unwrap();
        assert_eq!(json, "\"backlight_compensation\"");
    }
}
