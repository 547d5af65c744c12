use std::fmt;
use std::str::FromStr;

use kube::Resource;
use serde::{Deserialize, Serialize};

/// Identity of a watched object: `namespace/name`, or just `name` when cluster-scoped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub namespace: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("object has no metadata.name")]
    MissingName,
    #[error("tombstone '{0}' carries no recoverable object")]
    EmptyTombstone(String),
    #[error("invalid key '{0}' (expect name or namespace/name)")]
    Malformed(String),
}

impl ResourceKey {
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: Some(namespace.into()), name: name.into() }
    }

    pub fn cluster(name: impl Into<String>) -> Self { Self { namespace: None, name: name.into() } }

    /// Derive the key from object metadata. An empty namespace counts as cluster-scoped.
    pub fn from_resource<K: Resource>(obj: &K) -> Result<Self, KeyError> {
        let meta = obj.meta();
        let name = meta.name.as_deref().filter(|n| !n.is_empty()).ok_or(KeyError::MissingName)?;
        let namespace = meta.namespace.as_deref().filter(|ns| !ns.is_empty()).map(str::to_string);
        Ok(Self { namespace, name: name.to_string() })
    }

    pub fn namespace(&self) -> Option<&str> { self.namespace.as_deref() }
    pub fn name(&self) -> &str { &self.name }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

impl FromStr for ResourceKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [name] if !name.is_empty() => Ok(Self::cluster(*name)),
            ["", name] if !name.is_empty() => Ok(Self::cluster(*name)),
            [ns, name] if !name.is_empty() => Ok(Self::namespaced(*ns, *name)),
            _ => Err(KeyError::Malformed(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ConfigMap, Namespace};
    use kube::api::ObjectMeta;

    #[test]
    fn key_from_namespaced_object() {
        let cm = ConfigMap {
            metadata: ObjectMeta { name: Some("x".into()), namespace: Some("a".into()), ..Default::default() },
            ..Default::default()
        };
        let key = ResourceKey::from_resource(&cm).unwrap();
        assert_eq!(key, ResourceKey::namespaced("a", "x"));
        assert_eq!(key.to_string(), "a/x");
    }

    #[test]
    fn key_from_cluster_object_and_missing_name() {
        let ns = Namespace { metadata: ObjectMeta { name: Some("prod".into()), ..Default::default() }, ..Default::default() };
        assert_eq!(ResourceKey::from_resource(&ns).unwrap().to_string(), "prod");

        let nameless = Namespace::default();
        assert_eq!(ResourceKey::from_resource(&nameless), Err(KeyError::MissingName));
    }

    #[test]
    fn parse_keys() {
        assert_eq!("a/x".parse::<ResourceKey>().unwrap(), ResourceKey::namespaced("a", "x"));
        assert_eq!("x".parse::<ResourceKey>().unwrap(), ResourceKey::cluster("x"));
        assert_eq!("/x".parse::<ResourceKey>().unwrap(), ResourceKey::cluster("x"));
        assert!("a/b/c".parse::<ResourceKey>().is_err());
        assert!("a/".parse::<ResourceKey>().is_err());
        assert!("".parse::<ResourceKey>().is_err());
    }
}
