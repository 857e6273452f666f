use serde::{Deserialize, Serialize};

/// A registered device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Opaque identifier; generated on registration when empty.
    pub id: String,
    /// Owning user, filled in on reads.
    #[serde(default)]
    pub user: String,
    /// Display name stored on the user mapping.
    #[serde(default)]
    pub name: String,
    /// Device has a passcode/lock capability.
    #[serde(default)]
    pub has_passcode: bool,
    /// Derived on read: true when a push endpoint is known.
    #[serde(default)]
    pub logged_in: bool,
    /// Shared Hawk secret.
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub push_url: String,
    /// Accepted command types, encoded by the client.
    #[serde(default)]
    pub accepts: String,
    #[serde(default)]
    pub access_token: String,
    /// Unix seconds of the last exchange with the device.
    #[serde(default)]
    pub last_exchange: i64,
}

/// One entry of a user's device list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceListEntry {
    pub id: String,
    /// Display name, or the device id when none was recorded.
    pub name: String,
}

/// A command waiting for delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCommand {
    /// Command payload.
    pub command: String,
    /// Command type (`l`ock, `e`rase, `t`rack, ...). At most one pending
    /// command per device and type.
    pub command_type: String,
}

/// A location fix. Coordinates are kept at single precision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Unix seconds when the fix was stored.
    #[serde(default)]
    pub time: i64,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub altitude: f64,
    #[serde(default)]
    pub accuracy: f64,
}

impl Position {
    pub fn new(latitude: f64, longitude: f64, altitude: f64, accuracy: f64) -> Self {
        Self {
            time: 0,
            latitude,
            longitude,
            altitude,
            accuracy,
        }
    }

    /// Coordinates rounded to the stored `f32` resolution.
    pub fn reduced(&self) -> [f32; 4] {
        [
            self.latitude as f32,
            self.longitude as f32,
            self.altitude as f32,
            self.accuracy as f32,
        ]
    }
}

/// Rows removed by one garbage collection pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcReport {
    pub positions: usize,
    pub nonces: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reduced_precision_drops_low_bits() {
        let p = Position::new(37.123_456_789_123, -122.5, 10.0, 3.0);
        let [lat, lon, _, _] = p.reduced();
        assert_eq!(lon, -122.5_f32);
        assert_ne!(f64::from(lat), p.latitude);
    }

    #[test]
    fn device_deserializes_with_defaults() {
        let d: Device = serde_json::from_str(r#"{"id":"dev-1"}"#).unwrap();
        assert_eq!(d.id, "dev-1");
        assert!(!d.has_passcode);
        assert!(d.secret.is_empty());
    }
}
