//! Object metadata and request option types.
//!
//! The engine is generic over any record implementing [`Object`]. It only ever
//! touches the metadata block: the resource version (which it owns) and, for
//! preconditions and selection, the name, UID and labels.

use crate::error::{StorageError, StorageResult};
use crate::selection::{fields, labels};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Metadata carried by every stored object.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    /// Prefix used to generate a name when `name` is empty.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub generate_name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,

    /// Opaque to clients. Only the storage engine sets it.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_grace_period_seconds: Option<i64>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ObjectMeta {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn set_uid(&mut self, uid: impl Into<String>) {
        self.uid = uid.into();
    }

    pub fn resource_version(&self) -> &str {
        &self.resource_version
    }

    pub fn set_resource_version(&mut self, resource_version: impl Into<String>) {
        self.resource_version = resource_version.into();
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    pub fn set_labels(&mut self, labels: BTreeMap<String, String>) {
        self.labels = labels;
    }

    pub fn annotations(&self) -> &BTreeMap<String, String> {
        &self.annotations
    }

    pub fn set_annotations(&mut self, annotations: BTreeMap<String, String>) {
        self.annotations = annotations;
    }
}

/// Accessor trait for records the engine can store.
pub trait Object: Clone + Send + Sync + 'static {
    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;
}

/// Parses a resource version string. The empty string means "unset" and maps to 0.
pub fn parse_resource_version(resource_version: &str) -> StorageResult<i64> {
    if resource_version.is_empty() {
        return Ok(0);
    }
    match resource_version.parse::<i64>() {
        Ok(rv) if rv >= 0 => Ok(rv),
        _ => Err(StorageError::invalid_object(
            "",
            format!("invalid resource version: {resource_version:?}"),
        )),
    }
}

/// Reads the resource version from an object, 0 if unset.
pub fn object_resource_version<T: Object>(obj: &T) -> StorageResult<i64> {
    parse_resource_version(obj.meta().resource_version())
}

/// Conditions that must hold on the stored object before a write or delete.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preconditions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

impl Preconditions {
    pub fn with_uid(uid: impl Into<String>) -> Self {
        Self {
            uid: Some(uid.into()),
            resource_version: None,
        }
    }

    pub fn with_resource_version(resource_version: impl Into<String>) -> Self {
        Self {
            uid: None,
            resource_version: Some(resource_version.into()),
        }
    }

    /// Checks the stored object against these preconditions.
    ///
    /// A UID mismatch is an invalid object; a resource version mismatch is a
    /// conflict. Neither is retried by the engine.
    pub fn check<T: Object>(&self, key: &str, obj: &T) -> StorageResult<()> {
        let meta = obj.meta();
        if let Some(uid) = &self.uid {
            if uid != meta.uid() {
                return Err(StorageError::invalid_object(
                    key,
                    format!(
                        "Precondition failed: UID in precondition: {uid}, UID in object meta: {}",
                        meta.uid()
                    ),
                ));
            }
        }
        if let Some(rv) = &self.resource_version {
            if rv != meta.resource_version() {
                let current = parse_resource_version(meta.resource_version()).unwrap_or(0);
                return Err(StorageError::conflict(
                    key,
                    current,
                    format!(
                        "Precondition failed: ResourceVersion in precondition: {rv}, ResourceVersion in object meta: {}",
                        meta.resource_version()
                    ),
                ));
            }
        }
        Ok(())
    }
}

/// Options for a single-object read.
#[derive(Clone, Debug, Default)]
pub struct GetOptions {
    /// Unset: quorum read. "0": serializable read. N: at least as fresh as N.
    pub resource_version: String,
    /// Return `Ok(None)` instead of `KeyNotFound` for an absent key.
    pub ignore_not_found: bool,
}

impl GetOptions {
    pub fn at(resource_version: impl Into<String>) -> Self {
        Self {
            resource_version: resource_version.into(),
            ignore_not_found: false,
        }
    }
}

/// Options for list, watch and delete-collection.
#[derive(Clone, Debug, Default)]
pub struct ListOptions {
    pub label_selector: labels::Selector,
    pub field_selector: fields::Selector,
    /// Maximum number of items per page. 0 means unbounded.
    pub limit: i64,
    pub continue_token: Option<String>,
    pub resource_version: String,
    pub allow_watch_bookmarks: bool,
    /// Ask the backend for periodic progress notifications on watches.
    pub progress_notify: bool,
}

impl ListOptions {
    pub fn with_limit(limit: i64) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }

    pub fn continued(mut self, token: impl Into<String>) -> Self {
        self.continue_token = Some(token.into());
        self
    }
}

/// Options for a graceful delete.
#[derive(Clone, Debug, Default)]
pub struct DeleteOptions {
    pub grace_period_seconds: Option<i64>,
    pub preconditions: Option<Preconditions>,
    pub dry_run: bool,
}

/// Options for create.
#[derive(Clone, Debug, Default)]
pub struct CreateOptions {
    pub dry_run: bool,
}

/// Options for update.
#[derive(Clone, Debug, Default)]
pub struct UpdateOptions {
    pub dry_run: bool,
}
