//! Physical-device registry for the streaming server (C9), grounded on spec §4.9 "Client accept".
//! The server only needs enough of each physical device to match a client's `Device` message
//! against one of its own -- it never builds a full logical device for every GPU up front, so
//! this is a much smaller record than a real `VkPhysicalDevice` wrapper would carry.

use std::fmt;

/// A 16-byte UUID as reported by `VkPhysicalDeviceIDProperties` (`deviceUUID`/`driverUUID`).
pub type Uuid = [u8; 16];
/// An 8-byte LUID, only meaningful when `luid_valid` is set (`VkPhysicalDeviceIDProperties`).
pub type Luid = [u8; 8];

/// Cached identity of one enumerated physical device (spec §4.9: "enumerate physical devices and
/// cache their UUIDs/LUIDs").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalDeviceInfo {
    pub index: u32,
    pub name: String,
    pub device_uuid: Uuid,
    pub driver_uuid: Uuid,
    pub luid: Option<Luid>,
}

/// What a client's `Device` message (spec §3 "ImageGroup / ExportableImage", §4.9) asserts about
/// itself, used to find the matching [`PhysicalDeviceInfo`].
#[derive(Debug, Clone, Copy)]
pub struct DeviceClaim {
    pub device_uuid: Uuid,
    pub driver_uuid: Uuid,
    pub luid: Option<Luid>,
}

/// The set of physical devices the server enumerated at startup.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    devices: Vec<PhysicalDeviceInfo>,
}

impl DeviceRegistry {
    pub fn new(devices: Vec<PhysicalDeviceInfo>) -> Self {
        DeviceRegistry { devices }
    }

    pub fn devices(&self) -> &[PhysicalDeviceInfo] {
        &self.devices
    }

    /// Matches a client's `Device` message: by LUID if both sides assert one, else by
    /// `(device_uuid, driver_uuid)` (spec §4.9: "the server picks the physical device matching by
    /// LUID (if both sides assert it) or by (device UUID, driver UUID) otherwise").
    pub fn match_claim(&self, claim: &DeviceClaim) -> Option<&PhysicalDeviceInfo> {
        if let Some(luid) = claim.luid {
            if let Some(found) = self.devices.iter().find(|d| d.luid == Some(luid)) {
                return Some(found);
            }
        }
        self.devices
            .iter()
            .find(|d| d.device_uuid == claim.device_uuid && d.driver_uuid == claim.driver_uuid)
    }

    /// Finds the first device whose name contains `substring` (spec §4.6/§6: `CROSS_WSI_SINK`/
    /// `CROSS_WSI_SOURCE` "matches the first physical device whose name contains the substring").
    pub fn match_name_substring(&self, substring: &str) -> Option<&PhysicalDeviceInfo> {
        self.devices.iter().find(|d| d.name.contains(substring))
    }

    pub fn by_index(&self, index: u32) -> Option<&PhysicalDeviceInfo> {
        self.devices.iter().find(|d| d.index == index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("no physical device matches the client's asserted identity")]
    NoMatch,
}

impl fmt::Display for PhysicalDeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (#{})", self.name, self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> DeviceRegistry {
        DeviceRegistry::new(vec![
            PhysicalDeviceInfo {
                index: 0,
                name: "AMD Radeon RX 7900".to_string(),
                device_uuid: [1; 16],
                driver_uuid: [2; 16],
                luid: Some([9; 8]),
            },
            PhysicalDeviceInfo {
                index: 1,
                name: "NVIDIA GeForce RTX 4090".to_string(),
                device_uuid: [3; 16],
                driver_uuid: [4; 16],
                luid: None,
            },
        ])
    }

    #[test]
    fn matches_by_luid_when_both_sides_assert_one() {
        let reg = registry();
        let claim = DeviceClaim {
            device_uuid: [0xff; 16],
            driver_uuid: [0xff; 16],
            luid: Some([9; 8]),
        };
        assert_eq!(reg.match_claim(&claim).unwrap().index, 0);
    }

    #[test]
    fn falls_back_to_uuid_pair_without_luid() {
        let reg = registry();
        let claim = DeviceClaim {
            device_uuid: [3; 16],
            driver_uuid: [4; 16],
            luid: None,
        };
        assert_eq!(reg.match_claim(&claim).unwrap().index, 1);
    }

    #[test]
    fn unmatched_claim_returns_none() {
        let reg = registry();
        let claim = DeviceClaim {
            device_uuid: [0xaa; 16],
            driver_uuid: [0xbb; 16],
            luid: None,
        };
        assert!(reg.match_claim(&claim).is_none());
    }

    #[test]
    fn name_substring_matches_first_hit() {
        let reg = registry();
        assert_eq!(reg.match_name_substring("NVIDIA").unwrap().index, 1);
        assert_eq!(reg.match_name_substring("Radeon").unwrap().index, 0);
        assert!(reg.match_name_substring("Intel").is_none());
    }
}
