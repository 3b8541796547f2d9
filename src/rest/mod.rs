//! REST verb contracts and the generic registry implementing them.
//!
//! Handlers talk to a [`StandardStorage`]; [`Registry`] provides one for any
//! [`Object`] on top of a [`Store`](crate::Store), running the kind's
//! [`CreateStrategy`] and the caller's admission checks around each write.

pub mod create;
mod dryrun;
pub mod names;
mod registry;

pub use create::{before_create, fill_object_meta_system_fields, CreateStrategy};
pub use dryrun::DryRunnableStore;
pub use names::{NameGenerator, SimpleNameGenerator};
pub use registry::Registry;

use crate::error::StorageResult;
use crate::meta::{CreateOptions, DeleteOptions, GetOptions, ListOptions, Object, Preconditions, UpdateOptions};
use crate::storage::{Context, DeleteCollectionResult, ListResult, WatchStream};
use async_trait::async_trait;

/// Admission check run on an object before it is written or deleted.
pub type ValidateObjectFunc<T> = dyn Fn(&T) -> StorageResult<()> + Send + Sync;

/// Admission check run on an update, given the new and the stored object.
pub type ValidateObjectUpdateFunc<T> = dyn Fn(&T, &T) -> StorageResult<()> + Send + Sync;

/// Accepts every object.
pub fn validate_all_objects<T>(_obj: &T) -> StorageResult<()> {
    Ok(())
}

/// Accepts every update.
pub fn validate_all_object_updates<T>(_obj: &T, _old: &T) -> StorageResult<()> {
    Ok(())
}

/// Produces the object an update should store, given what is stored now.
pub trait UpdatedObjectInfo<T>: Send + Sync {
    /// Preconditions the stored object must satisfy.
    fn preconditions(&self) -> Option<Preconditions> {
        None
    }

    /// `old` is `None` when the object does not exist and the update may create it.
    fn updated_object(&self, old: Option<&T>) -> StorageResult<T>;
}

/// An update that replaces the stored object with a fixed one.
pub struct DefaultUpdatedObjectInfo<T> {
    obj: T,
}

impl<T> DefaultUpdatedObjectInfo<T> {
    pub fn new(obj: T) -> Self {
        Self { obj }
    }
}

impl<T: Object> UpdatedObjectInfo<T> for DefaultUpdatedObjectInfo<T> {
    fn preconditions(&self) -> Option<Preconditions> {
        let uid = self.obj.meta().uid();
        if uid.is_empty() {
            None
        } else {
            Some(Preconditions::with_uid(uid))
        }
    }

    fn updated_object(&self, _old: Option<&T>) -> StorageResult<T> {
        Ok(self.obj.clone())
    }
}

#[async_trait]
pub trait Getter<T: Object>: Send + Sync {
    async fn get(&self, ctx: &Context, name: &str, opts: &GetOptions) -> StorageResult<T>;
}

#[async_trait]
pub trait Lister<T: Object>: Send + Sync {
    async fn list(&self, ctx: &Context, opts: &ListOptions) -> StorageResult<ListResult<T>>;
}

#[async_trait]
pub trait Creater<T: Object>: Send + Sync {
    async fn create(
        &self,
        ctx: &Context,
        obj: T,
        create_validation: &ValidateObjectFunc<T>,
        opts: &CreateOptions,
    ) -> StorageResult<T>;
}

#[async_trait]
pub trait Updater<T: Object>: Send + Sync {
    /// Returns the stored object and whether the update created it.
    #[allow(clippy::too_many_arguments)]
    async fn update(
        &self,
        ctx: &Context,
        name: &str,
        obj_info: &dyn UpdatedObjectInfo<T>,
        create_validation: &ValidateObjectFunc<T>,
        update_validation: &ValidateObjectUpdateFunc<T>,
        force_allow_create: bool,
        opts: &UpdateOptions,
    ) -> StorageResult<(T, bool)>;
}

#[async_trait]
pub trait GracefulDeleter<T: Object>: Send + Sync {
    /// Returns the deleted object and whether it was deleted immediately.
    async fn delete(
        &self,
        ctx: &Context,
        name: &str,
        delete_validation: &ValidateObjectFunc<T>,
        opts: &DeleteOptions,
    ) -> StorageResult<(T, bool)>;
}

#[async_trait]
pub trait CollectionDeleter<T: Object>: Send + Sync {
    /// Deletion is not atomic: a failure part way through is reported in
    /// `error` alongside the objects already deleted.
    async fn delete_collection(
        &self,
        ctx: &Context,
        delete_validation: &ValidateObjectFunc<T>,
        opts: &DeleteOptions,
        list_opts: &ListOptions,
    ) -> DeleteCollectionResult<T>;
}

#[async_trait]
pub trait Watcher<T: Object>: Send + Sync {
    async fn watch(&self, ctx: &Context, opts: &ListOptions) -> StorageResult<WatchStream<T>>;
}

/// Everything a standard resource endpoint serves.
pub trait StandardStorage<T: Object>:
    Getter<T> + Lister<T> + Creater<T> + Updater<T> + GracefulDeleter<T> + CollectionDeleter<T> + Watcher<T>
{
}

impl<T, S> StandardStorage<T> for S
where
    T: Object,
    S: Getter<T> + Lister<T> + Creater<T> + Updater<T> + GracefulDeleter<T> + CollectionDeleter<T> + Watcher<T>
{
}
