//! Connection Descriptor - validated, immutable connection configuration

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Secrets used to authenticate against a source
#[derive(Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Credentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mask = |v: &Option<String>| v.as_ref().map(|_| "***");
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &mask(&self.password))
            .field("token", &mask(&self.token))
            .field("api_key", &mask(&self.api_key))
            .finish()
    }
}

/// Raw, unvalidated descriptor fields (as read from config files)
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DescriptorSpec {
    pub source_type: String,
    pub source_name: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub credentials: Credentials,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub params: HashMap<String, Value>,
}

/// Immutable connection descriptor. Only constructible through validation.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct ConnectionDescriptor {
    source_type: String,
    source_name: String,
    endpoint: Option<String>,
    port: Option<u16>,
    credentials: Credentials,
    database: Option<String>,
    schema: Option<String>,
    params: HashMap<String, Value>,
}

impl ConnectionDescriptor {
    pub fn new(spec: DescriptorSpec) -> Result<Self> {
        let source_type = spec.source_type.trim().to_lowercase();
        if source_type.is_empty() {
            return Err(SyncError::Configuration("source_type is required".to_string()));
        }
        if spec.source_name.trim().is_empty() {
            return Err(SyncError::Configuration("source_name is required".to_string()));
        }
        let endpoint = spec
            .endpoint
            .map(|e| e.trim().trim_end_matches('/').to_string())
            .filter(|e| !e.is_empty());

        Ok(Self {
            source_type,
            source_name: spec.source_name.trim().to_string(),
            endpoint,
            port: spec.port,
            credentials: spec.credentials,
            database: spec.database.filter(|d| !d.is_empty()),
            schema: spec.schema.filter(|s| !s.is_empty()),
            params: spec.params,
        })
    }

    pub fn source_type(&self) -> &str {
        &self.source_type
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    pub fn params(&self) -> &HashMap<String, Value> {
        &self.params
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    /// Fail fast when a family requires the endpoint
    pub fn require_endpoint(&self) -> Result<&str> {
        self.endpoint().ok_or_else(|| self.missing("endpoint"))
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }

    pub fn require_param_str(&self, key: &str) -> Result<&str> {
        self.param_str(key)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| self.missing(&format!("params.{}", key)))
    }

    pub fn param_u64(&self, key: &str) -> Result<Option<u64>> {
        match self.params.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n.as_u64().map(Some).ok_or_else(|| self.invalid(key)),
            Some(Value::String(s)) => s.parse::<u64>().map(Some).map_err(|_| self.invalid(key)),
            Some(_) => Err(self.invalid(key)),
        }
    }

    pub fn param_bool(&self, key: &str) -> Result<Option<bool>> {
        match self.params.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(Value::String(s)) => s.parse::<bool>().map(Some).map_err(|_| self.invalid(key)),
            Some(_) => Err(self.invalid(key)),
        }
    }

    pub fn missing(&self, field: &str) -> SyncError {
        SyncError::Configuration(format!(
            "{} source '{}' requires '{}'",
            self.source_type, self.source_name, field
        ))
    }

    fn invalid(&self, key: &str) -> SyncError {
        SyncError::Configuration(format!(
            "{} source '{}' has invalid value for params.{}",
            self.source_type, self.source_name, key
        ))
    }
}

impl<'de> Deserialize<'de> for ConnectionDescriptor {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let spec = DescriptorSpec::deserialize(deserializer)?;
        ConnectionDescriptor::new(spec).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_descriptor_requires_type_and_name() {
        let err = ConnectionDescriptor::new(DescriptorSpec {
            source_type: " ".into(),
            source_name: "crm".into(),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, SyncError::Configuration(_)));

        let err = ConnectionDescriptor::new(DescriptorSpec {
            source_type: "rest".into(),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, SyncError::Configuration(_)));
    }

    #[test]
    fn test_descriptor_normalizes_fields() {
        let d = ConnectionDescriptor::new(DescriptorSpec {
            source_type: "REST".into(),
            source_name: "orders".into(),
            endpoint: Some("https://api.example.com/".into()),
            params: [("page_size".to_string(), json!("50"))].into_iter().collect(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(d.source_type(), "rest");
        assert_eq!(d.endpoint(), Some("https://api.example.com"));
        assert_eq!(d.param_u64("page_size").unwrap(), Some(50));
        assert!(d.require_param_str("spreadsheet_id").is_err());
    }

    #[test]
    fn test_descriptor_deserialize_validates() {
        let ok: ConnectionDescriptor = serde_json::from_value(json!({
            "source_type": "postgres",
            "source_name": "warehouse",
            "endpoint": "db.internal",
            "credentials": {"username": "etl", "password": "secret"}
        }))
        .unwrap();
        assert_eq!(ok.credentials().username.as_deref(), Some("etl"));
        assert!(!format!("{:?}", ok.credentials()).contains("secret"));

        let bad = serde_json::from_value::<ConnectionDescriptor>(json!({
            "source_type": "postgres",
            "source_name": ""
        }));
        assert!(bad.is_err());
    }
}
