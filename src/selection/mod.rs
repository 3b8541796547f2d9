//! Selection predicates for list and watch.
//!
//! A [`SelectionPredicate`] combines a label selector, a field selector and an
//! attribute function that extracts `(labels, fields)` from an object. It also
//! exposes:
//!
//! - `matches_single`: a list that can be served by a single-key get
//! - `matcher_index`: exact-match hints on indexed labels and fields

pub mod fields;
pub mod labels;

use crate::error::{StorageError, StorageResult};
use crate::meta::Object;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub use fields::Fields;
pub use labels::Labels;

/// Field name that identifies an object within its key prefix.
pub const NAME_FIELD: &str = "metadata.name";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectorError {
    #[error("unable to parse selector at {position}: {message}")]
    Parse { position: usize, message: String },

    #[error("invalid requirement: {0}")]
    InvalidRequirement(String),
}

pub type SelectorResult<T> = Result<T, SelectorError>;

impl From<SelectorError> for StorageError {
    fn from(err: SelectorError) -> Self {
        StorageError::invalid_object("", err.to_string())
    }
}

/// Extracts the selectable attributes of an object.
pub type AttrFunc<T> = Arc<dyn Fn(&T) -> StorageResult<(Labels, Fields)> + Send + Sync>;

/// Labels from metadata, plus `metadata.name` as the only field.
pub fn default_attrs<T: Object>(obj: &T) -> StorageResult<(Labels, Fields)> {
    let meta = obj.meta();
    let mut fields = Fields::new();
    fields.insert(NAME_FIELD.to_string(), meta.name().to_string());
    Ok((meta.labels().clone(), fields))
}

/// Builds the index name used for a label hint.
pub fn label_index(label: &str) -> String {
    format!("l:{label}")
}

/// Builds the index name used for a field hint.
pub fn field_index(field: &str) -> String {
    format!("f:{field}")
}

/// An exact-match hint usable to narrow a scan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MatchValue {
    pub index_name: String,
    pub value: String,
}

pub struct SelectionPredicate<T> {
    pub label: labels::Selector,
    pub field: fields::Selector,
    pub get_attrs: AttrFunc<T>,
    pub index_labels: Vec<String>,
    pub index_fields: Vec<String>,
    pub limit: i64,
    pub continue_token: Option<String>,
    pub allow_watch_bookmarks: bool,
}

impl<T> Clone for SelectionPredicate<T> {
    fn clone(&self) -> Self {
        Self {
            label: self.label.clone(),
            field: self.field.clone(),
            get_attrs: Arc::clone(&self.get_attrs),
            index_labels: self.index_labels.clone(),
            index_fields: self.index_fields.clone(),
            limit: self.limit,
            continue_token: self.continue_token.clone(),
            allow_watch_bookmarks: self.allow_watch_bookmarks,
        }
    }
}

impl<T> fmt::Debug for SelectionPredicate<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectionPredicate")
            .field("label", &self.label.to_string())
            .field("field", &self.field.to_string())
            .field("limit", &self.limit)
            .field("continue", &self.continue_token.is_some())
            .finish()
    }
}

impl<T: Object> SelectionPredicate<T> {
    /// A predicate matching everything, using the default attribute function.
    pub fn everything() -> Self {
        Self::new(labels::Selector::everything(), fields::Selector::everything())
    }

    pub fn new(label: labels::Selector, field: fields::Selector) -> Self {
        Self {
            label,
            field,
            get_attrs: Arc::new(default_attrs::<T>),
            index_labels: Vec::new(),
            index_fields: Vec::new(),
            limit: 0,
            continue_token: None,
            allow_watch_bookmarks: false,
        }
    }
}

impl<T> SelectionPredicate<T> {
    pub fn with_attrs(mut self, get_attrs: AttrFunc<T>) -> Self {
        self.get_attrs = get_attrs;
        self
    }

    pub fn with_indexes(mut self, labels: Vec<String>, fields: Vec<String>) -> Self {
        self.index_labels = labels;
        self.index_fields = fields;
        self
    }

    /// True when the predicate places no constraints on objects.
    pub fn is_empty(&self) -> bool {
        self.label.is_empty() && self.field.is_empty()
    }

    pub fn matches(&self, obj: &T) -> StorageResult<bool> {
        if self.is_empty() {
            return Ok(true);
        }
        let (labels, fields) = (self.get_attrs)(obj)?;
        Ok(self.matches_object_attributes(&labels, &fields))
    }

    pub fn matches_object_attributes(&self, labels: &Labels, fields: &Fields) -> bool {
        if !self.label.matches(labels) {
            return false;
        }
        self.field.is_empty() || self.field.matches(fields)
    }

    /// The object name when the selection can only ever match that one object.
    pub fn matches_single(&self) -> Option<&str> {
        if self.continue_token.is_some() {
            return None;
        }
        self.field.requires_exact_match(NAME_FIELD)
    }

    /// Exact-match hints for the configured indexable labels and fields.
    pub fn matcher_index(&self) -> Vec<MatchValue> {
        let mut result = Vec::new();
        for field in &self.index_fields {
            if let Some(value) = self.field.requires_exact_match(field) {
                result.push(MatchValue {
                    index_name: field_index(field),
                    value: value.to_string(),
                });
            }
        }
        for label in &self.index_labels {
            if let Some(value) = self.label.requires_exact_match(label) {
                result.push(MatchValue {
                    index_name: label_index(label),
                    value: value.to_string(),
                });
            }
        }
        result
    }
}
