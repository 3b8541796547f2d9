//! Create-time normalization of objects before they reach the store.

use super::names::NameGenerator;
use crate::error::{StorageError, StorageResult};
use crate::meta::{Object, ObjectMeta};
use chrono::Utc;
use uuid::Uuid;

/// Per-kind behaviour applied to objects on create.
pub trait CreateStrategy<T>: Send + Sync {
    /// Generates names for objects that only carry `generate_name`.
    fn name_generator(&self) -> &dyn NameGenerator;

    /// Clears fields the client may not set and initializes defaults.
    fn prepare_for_create(&self, _obj: &mut T) {}

    /// Returns the validation failures for `obj`, empty when it is valid.
    fn validate(&self, obj: &T) -> Vec<String>;

    /// Rewrites `obj` into its canonical form after validation.
    fn canonicalize(&self, _obj: &mut T) {}
}

/// Assigns a fresh UID and stamps the creation time.
pub fn fill_object_meta_system_fields(meta: &mut ObjectMeta) {
    meta.creation_timestamp = Some(Utc::now());
    meta.set_uid(Uuid::new_v4().to_string());
}

/// Prepares `obj` for storage: strips deletion state, runs the strategy's
/// preparation, fills system fields, generates a name if needed, validates
/// and canonicalizes.
pub fn before_create<T, S>(strategy: &S, obj: &mut T) -> StorageResult<()>
where
    T: Object,
    S: CreateStrategy<T> + ?Sized,
{
    {
        let meta = obj.meta_mut();
        meta.deletion_timestamp = None;
        meta.deletion_grace_period_seconds = None;
    }
    strategy.prepare_for_create(obj);

    let meta = obj.meta_mut();
    fill_object_meta_system_fields(meta);
    if meta.name().is_empty() && !meta.generate_name.is_empty() {
        let name = strategy.name_generator().generate_name(&meta.generate_name);
        meta.set_name(name);
    }
    if obj.meta().name().is_empty() {
        return Err(StorageError::invalid_object(
            "",
            "name or generateName is required",
        ));
    }

    let errs = strategy.validate(obj);
    if !errs.is_empty() {
        let name = obj.meta().name();
        return Err(StorageError::invalid_object(
            name,
            format!("invalid object: {name}, error is {}", errs.join("; ")),
        ));
    }

    strategy.canonicalize(obj);
    Ok(())
}
