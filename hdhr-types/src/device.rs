//! Device identity and type classification.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of tuner hardware behind a device handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceType {
    /// Over-the-air ATSC tuner.
    Atsc,
    /// CableCard tuner with virtual-channel support.
    CableCard,
}

impl DeviceType {
    /// Driver-facing name of the device type.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Atsc => "atsc",
            DeviceType::CableCard => "cablecard",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a single tuner on a discovered device.
///
/// Discovery itself is out of scope; descriptors arrive from whatever
/// enumerated the network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Device id as reported by discovery (e.g. `1038A4C7`).
    pub id: String,
    /// IP address of the device.
    pub addr: String,
    /// Tuner index on the device.
    pub tuner: u32,
}

impl DeviceDescriptor {
    pub fn new(id: impl Into<String>, addr: impl Into<String>, tuner: u32) -> Self {
        Self {
            id: id.into(),
            addr: addr.into(),
            tuner,
        }
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.id, self.tuner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_display() {
        let desc = DeviceDescriptor::new("1038A4C7", "192.168.1.100", 0);
        assert_eq!(desc.to_string(), "1038A4C7-0");
    }
}
