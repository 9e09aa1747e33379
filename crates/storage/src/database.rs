//! Replication engine and database seams
//!
//! The registry only sees databases through these traits. Engines backed by
//! a real replication protocol live outside this workspace.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use replimesh_core::{ContentId, PeerId};

use crate::access::AccessController;
use crate::StorageResult;

/// Where a database lives: its content root and logical path
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatabaseAddress {
    pub root: ContentId,
    pub path: String,
}

impl DatabaseAddress {
    pub fn new(root: impl Into<ContentId>, path: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            path: path.into(),
        }
    }

    /// The `root/path` form databases can be looked up by
    pub fn root_path(&self) -> String {
        format!("{}/{}", self.root, self.path)
    }
}

impl fmt::Display for DatabaseAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/orbitdb/{}/{}", self.root, self.path)
    }
}

/// Options a database was opened with
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_only: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_history: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overwrite: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicate: Option<bool>,
}

/// Parameters handed to the engine when opening a database
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenParams {
    /// Database type to create, e.g. `eventlog` or `keyvalue`
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub db_type: Option<String>,
    /// Identities allowed to write, when creating
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write: Option<Vec<String>>,
    #[serde(flatten)]
    pub options: DatabaseOptions,
}

/// Operations a database type supports
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Add,
    Get,
    Inc,
    Iterator,
    Put,
    Query,
    Remove,
    Value,
}

pub type Capabilities = BTreeSet<Capability>;

/// Identity of the local node in the replication engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            public_key: None,
        }
    }
}

/// An open replicated database
#[async_trait]
pub trait Database: Send + Sync {
    fn id(&self) -> &str;

    /// Logical name the database is registered under
    fn dbname(&self) -> &str;

    fn address(&self) -> &DatabaseAddress;

    fn db_type(&self) -> &str;

    fn uid(&self) -> &str;

    fn options(&self) -> &DatabaseOptions;

    fn access(&self) -> Arc<dyn AccessController>;

    /// Number of entries in the local index
    fn index_len(&self) -> usize;

    fn capabilities(&self) -> Capabilities;

    /// Load the local state
    async fn load(&self) -> StorageResult<()>;

    async fn close(&self) -> StorageResult<()>;

    /// Stream of peers seen replicating this database, if the engine reports them
    fn peer_events(&self) -> Option<broadcast::Receiver<PeerId>> {
        None
    }
}

/// The replication engine that owns database instances
#[async_trait]
pub trait ReplicationEngine: Send + Sync + 'static {
    /// Open (and create, if requested) the database called `name`
    async fn open(&self, name: &str, params: OpenParams) -> StorageResult<Arc<dyn Database>>;

    fn identity(&self) -> Identity;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_forms() {
        let address = DatabaseAddress::new("Qm123", "chat");
        assert_eq!(address.root_path(), "Qm123/chat");
        assert_eq!(address.to_string(), "/orbitdb/Qm123/chat");
    }

    #[test]
    fn test_open_params_keys() {
        let params: OpenParams = serde_json::from_str(
            r#"{"type": "keyvalue", "create": true, "indexBy": "_id", "write": ["*"]}"#,
        )
        .unwrap();
        assert_eq!(params.db_type.as_deref(), Some("keyvalue"));
        assert_eq!(params.options.create, Some(true));
        assert_eq!(params.options.index_by.as_deref(), Some("_id"));
        assert_eq!(params.write, Some(vec!["*".to_string()]));
    }

    #[test]
    fn test_capabilities_serialize_lowercase() {
        let caps: Capabilities = [Capability::Remove, Capability::Add].into_iter().collect();
        assert_eq!(serde_json::to_string(&caps).unwrap(), r#"["add","remove"]"#);
    }
}
