//! Launch and readiness descriptors.
//!
//! The scheduler never looks inside a launch descriptor; it is handed to
//! the cluster framework verbatim. Readiness descriptors are a closed set
//! of probe kinds interpreted by the readiness collaborator.

use serde::{Deserialize, Serialize};

/// Opaque launch payload (image, command, environment, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LaunchDescriptor(pub serde_json::Value);

impl LaunchDescriptor {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }
}

impl From<serde_json::Value> for LaunchDescriptor {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

/// How to decide that a started task is actually serving.
///
/// Port probes refer to the task's granted ports by index, since concrete
/// port numbers are only known after allocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReadinessDescriptor {
    /// Ready as soon as the process is running.
    #[default]
    Immediate,
    /// Ready once a TCP connection to the granted port succeeds.
    Tcp {
        #[serde(default)]
        port_index: usize,
    },
    /// Ready once `GET path` on the granted port returns 2xx.
    Http {
        #[serde(default)]
        port_index: usize,
        #[serde(default = "default_http_path")]
        path: String,
    },
    /// Readiness is decided by an external collaborator identified by `handle`.
    External { handle: String },
}

fn default_http_path() -> String {
    "/".to_string()
}

impl ReadinessDescriptor {
    pub fn is_immediate(&self) -> bool {
        matches!(self, ReadinessDescriptor::Immediate)
    }

    /// Index into the grant's port list this probe needs, if any.
    pub fn port_index(&self) -> Option<usize> {
        match self {
            ReadinessDescriptor::Tcp { port_index } | ReadinessDescriptor::Http { port_index, .. } => {
                Some(*port_index)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readiness_defaults_to_immediate() {
        assert_eq!(ReadinessDescriptor::default(), ReadinessDescriptor::Immediate);
        let parsed: ReadinessDescriptor = serde_json::from_str(r#"{"kind":"immediate"}"#).unwrap();
        assert!(parsed.is_immediate());
    }

    #[test]
    fn http_probe_defaults() {
        let parsed: ReadinessDescriptor = serde_json::from_str(r#"{"kind":"http"}"#).unwrap();
        assert_eq!(
            parsed,
            ReadinessDescriptor::Http {
                port_index: 0,
                path: "/".into()
            }
        );
        assert_eq!(parsed.port_index(), Some(0));
    }

    #[test]
    fn external_has_no_port() {
        let parsed: ReadinessDescriptor =
            serde_json::from_str(r#"{"kind":"external","handle":"katcp:sensor"}"#).unwrap();
        assert_eq!(parsed.port_index(), None);
    }

    #[test]
    fn launch_descriptor_is_transparent() {
        let json = serde_json::json!({"image": "ingest:1.2", "args": ["--fast"]});
        let launch = LaunchDescriptor::from(json.clone());
        assert_eq!(serde_json::to_value(&launch).unwrap(), json);
    }
}
