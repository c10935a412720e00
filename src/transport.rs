//! The capability interface the CLI drives, and the values that cross it.

use crate::error::{Result, TuyaError};
use crate::protocol::Version;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 6668;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Data point carrying the power state on switches and plugs.
pub const DP_POWER: &str = "1";

const KEY_DPS: &str = "dps";
const KEY_DATA: &str = "data";

/// Identifies one switch on the local network.
#[derive(Clone, PartialEq)]
pub struct DeviceConfig {
    pub id: String,
    pub address: String,
    pub local_key: String,
    pub version: Version,
    pub port: u16,
    pub timeout: Duration,
}

impl DeviceConfig {
    pub fn new<I, A, K>(id: I, address: A, local_key: K) -> Self
    where
        I: Into<String>,
        A: Into<String>,
        K: Into<String>,
    {
        Self {
            id: id.into(),
            address: address.into(),
            local_key: local_key.into(),
            version: Version::V3_3,
            port: DEFAULT_PORT,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Checks the identifying fields before any socket is opened.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("device id", &self.id),
            ("address", &self.address),
            ("local key", &self.local_key),
        ] {
            if value.trim().is_empty() {
                return Err(TuyaError::InvalidConfig(format!("{name} must not be empty")));
            }
        }
        if self.local_key.len() != 16 {
            return Err(TuyaError::InvalidConfig(format!(
                "local key must be 16 bytes, got {}",
                self.local_key.len()
            )));
        }
        if self.timeout.is_zero() {
            return Err(TuyaError::InvalidConfig("timeout must be positive".into()));
        }
        Ok(())
    }
}

// The local key stays out of logs.
impl fmt::Debug for DeviceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceConfig")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("local_key", &"<redacted>")
            .field("version", &self.version)
            .field("port", &self.port)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// One status reading, exactly as the device reported it.
///
/// Key order is preserved. v3.4+ devices nest data points under
/// `data.dps`; those are hoisted to the top-level `dps` key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Map<String, Value>", into = "Map<String, Value>")]
pub struct StatusSnapshot {
    raw: Map<String, Value>,
}

impl StatusSnapshot {
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        match serde_json::from_slice::<Value>(payload)? {
            Value::Object(raw) => Ok(raw.into()),
            other => Err(TuyaError::InvalidPayload(format!(
                "expected a JSON object, got {other}"
            ))),
        }
    }

    /// The data-point mapping, if the response carried one.
    pub fn dps(&self) -> Option<&Map<String, Value>> {
        self.raw.get(KEY_DPS).and_then(Value::as_object)
    }

    pub fn get(&self, dp: &str) -> Option<&Value> {
        self.dps().and_then(|dps| dps.get(dp))
    }

    /// Power state; a missing data point reads as off.
    pub fn is_on(&self) -> bool {
        self.get(DP_POWER).is_some_and(is_truthy)
    }

    /// The data-point mapping as JSON, `{}` when absent.
    pub fn dps_json(&self) -> String {
        match self.dps() {
            Some(dps) => Value::Object(dps.clone()).to_string(),
            None => "{}".to_string(),
        }
    }
}

impl From<Map<String, Value>> for StatusSnapshot {
    fn from(mut raw: Map<String, Value>) -> Self {
        if !raw.contains_key(KEY_DPS) {
            let nested = raw
                .get(KEY_DATA)
                .and_then(|data| data.get(KEY_DPS))
                .cloned();
            if let Some(dps) = nested {
                raw.insert(KEY_DPS.to_string(), dps);
            }
        }
        Self { raw }
    }
}

impl From<StatusSnapshot> for Map<String, Value> {
    fn from(snapshot: StatusSnapshot) -> Self {
        snapshot.raw
    }
}

impl fmt::Display for StatusSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Value::Object(self.raw.clone()))
    }
}

/// Scripting-style truthiness: `false`, `null`, zero and empty values are off.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Capabilities the CLI needs from a device connection.
///
/// `connect` only builds the handle; implementations open sockets lazily.
#[allow(async_fn_in_trait)]
pub trait SwitchTransport: Sized {
    fn connect(config: DeviceConfig) -> Result<Self>;

    fn set_version(&mut self, version: Version);

    /// Keep one socket open across requests instead of one per request.
    fn set_persistent(&mut self, persistent: bool);

    async fn status(&mut self) -> Result<StatusSnapshot>;

    async fn set_value(&mut self, dp: &str, value: Value) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn snapshot(value: Value) -> StatusSnapshot {
        StatusSnapshot::from_payload(value.to_string().as_bytes()).unwrap()
    }

    #[test]
    fn test_config_validation() {
        let config = DeviceConfig::new("bf1234", "10.0.0.2", "0123456789abcdef");
        assert!(config.validate().is_ok());
        assert_eq!(config.version, Version::V3_3);
        assert_eq!(config.port, DEFAULT_PORT);

        assert!(matches!(
            DeviceConfig::new("", "10.0.0.2", "0123456789abcdef").validate(),
            Err(TuyaError::InvalidConfig(_))
        ));
        assert!(matches!(
            DeviceConfig::new("bf1234", "10.0.0.2", "short").validate(),
            Err(TuyaError::InvalidConfig(_))
        ));
        assert!(
            DeviceConfig::new("bf1234", "10.0.0.2", "0123456789abcdef")
                .timeout(Duration::ZERO)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_debug_redacts_key() {
        let config = DeviceConfig::new("bf1234", "10.0.0.2", "0123456789abcdef");
        let printed = format!("{config:?}");
        assert!(printed.contains("bf1234"));
        assert!(!printed.contains("0123456789abcdef"));
    }

    #[test]
    fn test_snapshot_preserves_order() {
        let snap = snapshot(json!({"devId": "bf1234", "dps": {"9": "white", "1": true}}));
        assert_eq!(snap.dps_json(), r#"{"9":"white","1":true}"#);
        assert_eq!(
            snap.to_string(),
            r#"{"devId":"bf1234","dps":{"9":"white","1":true}}"#
        );
        assert!(snap.is_on());
    }

    #[test]
    fn test_snapshot_hoists_nested_dps() {
        let snap = snapshot(json!({"protocol": 4, "t": 1700000000, "data": {"dps": {"1": false}}}));
        assert_eq!(snap.get("1"), Some(&json!(false)));
        assert!(!snap.is_on());
    }

    #[test]
    fn test_snapshot_without_dps() {
        let snap = snapshot(json!({"devId": "bf1234"}));
        assert_eq!(snap.dps_json(), "{}");
        assert!(!snap.is_on());
        assert!(StatusSnapshot::from_payload(b"[1,2]").is_err());
        assert!(StatusSnapshot::from_payload(b"data unvalid").is_err());
    }

    #[test]
    fn test_truthiness() {
        for value in [json!(true), json!(1), json!(-0.5), json!("on"), json!([0])] {
            assert!(is_truthy(&value), "{value} should be truthy");
        }
        for value in [json!(false), json!(null), json!(0), json!(0.0), json!(""), json!({})] {
            assert!(!is_truthy(&value), "{value} should be falsy");
        }
    }

    #[test]
    fn test_serde_round_trip_keeps_raw() {
        let snap = snapshot(json!({"dps": {"1": true}}));
        let encoded = serde_json::to_string(&snap).unwrap();
        assert_eq!(encoded, r#"{"dps":{"1":true}}"#);
        let decoded: StatusSnapshot = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, snap);
    }
}
