use serde::{Deserialize, Serialize};

use crate::error::{RegistryError, Result};

/// One registered endpoint of a service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceNode {
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl ServiceNode {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            url: None,
        }
    }

    /// An endpoint on this machine, addressed by its hostname.
    pub fn local(name: impl Into<String>, port: u16) -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "127.0.0.1".to_string());
        Self::new(name, host, port)
    }

    /// Build a node from an absolute URL, taking host and port from it.
    pub fn from_url(name: impl Into<String>, raw: &str) -> Result<Self> {
        let parsed = url::Url::parse(raw)
            .map_err(|e| RegistryError::InvalidServiceData(format!("{raw}: {e}")))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| RegistryError::InvalidServiceData(format!("{raw}: missing host")))?;
        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| RegistryError::InvalidServiceData(format!("{raw}: missing port")))?;

        Ok(Self::new(name, host, port).with_url(raw))
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Where to reach this endpoint: its url, or `http://host:port`.
    pub fn endpoint(&self) -> String {
        match &self.url {
            Some(url) if !url.is_empty() => url.clone(),
            _ => format!("http://{}:{}", self.host, self.port),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_layout() {
        let node = ServiceNode::new("db", "127.0.0.1", 4000);
        let json: serde_json::Value = serde_json::from_slice(&node.to_bytes().unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"name": "db", "host": "127.0.0.1", "port": 4000})
        );
    }

    #[test]
    fn test_decode_with_url() {
        let data = br#"{"name":"img","host":"10.0.0.7","port":4001,"url":"http://img.local"}"#;
        let node = ServiceNode::from_bytes(data).unwrap();
        assert_eq!(node.url.as_deref(), Some("http://img.local"));
        assert_eq!(node.endpoint(), "http://img.local");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            ServiceNode::from_bytes(b"not json"),
            Err(RegistryError::SerializationError(_))
        ));
        assert!(matches!(
            ServiceNode::from_bytes(br#"{"name":"db","host":"h","port":70000}"#),
            Err(RegistryError::SerializationError(_))
        ));
    }

    #[test]
    fn test_from_url() {
        let node = ServiceNode::from_url("api", "https://example.com/v1").unwrap();
        assert_eq!(node.host, "example.com");
        assert_eq!(node.port, 443);
        assert_eq!(node.endpoint(), "https://example.com/v1");

        let node = ServiceNode::from_url("api", "http://10.1.2.3:8080").unwrap();
        assert_eq!(node.port, 8080);

        assert!(matches!(
            ServiceNode::from_url("api", "not a url"),
            Err(RegistryError::InvalidServiceData(_))
        ));
    }

    #[test]
    fn test_endpoint_without_url() {
        let node = ServiceNode::new("db", "127.0.0.1", 4000);
        assert_eq!(node.endpoint(), "http://127.0.0.1:4000");
        assert!(!ServiceNode::local("db", 1).host.is_empty());
    }
}
