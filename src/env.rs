//! Environment-variable configuration shared by the capture layer (C5) and the cross-WSI layer
//! (C6), grounded on spec §4.5/§4.6/§6. Every reader here is parse-or-default and never panics:
//! a missing or malformed variable falls back to the documented default rather than aborting the
//! process that happens to have this crate linked into it.

use std::str::FromStr;

use crate::ipc::DEFAULT_SOCKET_PATH;

/// `PYROFLING_SYNC`: which side paces presentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// The server's vblank pacing governs present completion (default).
    #[default]
    Server,
    /// The client's own present/FIFO pacing is left alone; the session only ships frames.
    Client,
}

impl FromStr for SyncMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "server" => Ok(Self::Server),
            "client" => Ok(Self::Client),
            "default" => Ok(Self::Server),
            _ => Err(()),
        }
    }
}

/// `PYROFLING_FORCE_VK_COLOR_SPACE`: override the color space the capture layer will accept from
/// the surface filtering step, in case the application picks something the server can't handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForcedColorSpace {
    Hdr10,
    ScRgb,
    /// Plain integer sRGB nonlinear.
    Integer,
}

impl FromStr for ForcedColorSpace {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "HDR10" => Ok(Self::Hdr10),
            "scRGB" => Ok(Self::ScRgb),
            "integer" => Ok(Self::Integer),
            _ => Err(()),
        }
    }
}

fn parse_env<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Capture-layer configuration, read once at startup (spec §4.5).
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub sync_mode: SyncMode,
    /// `PYROFLING_IMAGES`: image group size override. `None` means "use the server-chosen default".
    pub forced_images: Option<u32>,
    pub socket_path: String,
    pub forced_color_space: Option<ForcedColorSpace>,
}

impl CaptureConfig {
    pub fn from_env() -> Self {
        CaptureConfig {
            sync_mode: parse_env("PYROFLING_SYNC").unwrap_or_default(),
            forced_images: parse_env("PYROFLING_IMAGES"),
            socket_path: std::env::var("PYROFLING_SERVER").unwrap_or_else(|_| DEFAULT_SOCKET_PATH.to_string()),
            forced_color_space: parse_env("PYROFLING_FORCE_VK_COLOR_SPACE"),
        }
    }
}

/// Cross-WSI layer configuration (spec §4.6): which of the enumerated physical devices is the
/// "real" source GPU doing the rendering, and which is the sink GPU the swapchain actually lives
/// on (the one with the display attached). Both variables name a device by a substring of its
/// `VkPhysicalDeviceProperties::deviceName` (spec §4.6/§6: "matches the first physical device
/// whose name contains the substring"), not by enumeration index -- device enumeration order is
/// not guaranteed stable across driver updates, so an index would silently rebind to the wrong
/// GPU.
#[derive(Debug, Clone, Default)]
pub struct CrossWsiConfig {
    pub sink_name: Option<String>,
    pub source_name: Option<String>,
}

impl CrossWsiConfig {
    pub fn from_env() -> Self {
        CrossWsiConfig {
            sink_name: std::env::var("CROSS_WSI_SINK").ok(),
            source_name: std::env::var("CROSS_WSI_SOURCE").ok(),
        }
    }

    /// The layer only activates once both a sink and a source are named; naming just one is a
    /// misconfiguration the caller should log and ignore rather than half-activate.
    pub fn is_active(&self) -> bool {
        self.sink_name.is_some() && self.source_name.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_mode_parses_known_values() {
        assert_eq!("server".parse::<SyncMode>(), Ok(SyncMode::Server));
        assert_eq!("client".parse::<SyncMode>(), Ok(SyncMode::Client));
        assert_eq!("default".parse::<SyncMode>(), Ok(SyncMode::Server));
        assert!("bogus".parse::<SyncMode>().is_err());
    }

    #[test]
    fn forced_color_space_parses_known_values() {
        assert_eq!("HDR10".parse::<ForcedColorSpace>(), Ok(ForcedColorSpace::Hdr10));
        assert_eq!("scRGB".parse::<ForcedColorSpace>(), Ok(ForcedColorSpace::ScRgb));
        assert_eq!("integer".parse::<ForcedColorSpace>(), Ok(ForcedColorSpace::Integer));
        assert!("HDR11".parse::<ForcedColorSpace>().is_err());
    }

    #[test]
    fn cross_wsi_config_requires_both_names() {
        let cfg = CrossWsiConfig {
            sink_name: Some("AMD".to_string()),
            source_name: None,
        };
        assert!(!cfg.is_active());
        let cfg = CrossWsiConfig {
            sink_name: Some("AMD".to_string()),
            source_name: Some("NVIDIA".to_string()),
        };
        assert!(cfg.is_active());
    }
}
