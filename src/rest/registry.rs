use super::create::{before_create, CreateStrategy};
use super::dryrun::DryRunnableStore;
use super::{
    CollectionDeleter, Creater, Getter, GracefulDeleter, Lister, UpdatedObjectInfo, Updater,
    ValidateObjectFunc, ValidateObjectUpdateFunc, Watcher,
};
use crate::error::{StorageError, StorageResult};
use crate::meta::{
    object_resource_version, CreateOptions, DeleteOptions, GetOptions, ListOptions, Object, UpdateOptions,
};
use crate::storage::{Context, DeleteCollectionResult, KeyScheme, ListResult, Store, WatchStream};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// Serves the REST verbs for one resource from a [`Store`].
///
/// Objects live at `keys.key_for(name)` relative to the store's path prefix.
pub struct Registry<T> {
    storage: DryRunnableStore<T>,
    keys: KeyScheme,
    strategy: Arc<dyn CreateStrategy<T>>,
}

impl<T: Object> Registry<T> {
    pub fn new(store: Store<T>, keys: KeyScheme, strategy: Arc<dyn CreateStrategy<T>>) -> Self {
        Self {
            storage: DryRunnableStore::new(store),
            keys,
            strategy,
        }
    }

    pub fn store(&self) -> &Store<T> {
        self.storage.store()
    }

    pub fn keys(&self) -> &KeyScheme {
        &self.keys
    }

    /// Computes the object an update stores given the current one, running
    /// create-time normalization when the update creates the object.
    #[allow(clippy::too_many_arguments)]
    fn prepare_update(
        &self,
        name: &str,
        key: &str,
        old: Option<&T>,
        current_rv: i64,
        obj_info: &dyn UpdatedObjectInfo<T>,
        create_validation: &ValidateObjectFunc<T>,
        update_validation: &ValidateObjectUpdateFunc<T>,
    ) -> StorageResult<T> {
        let mut obj = obj_info.updated_object(old)?;
        if obj.meta().name().is_empty() {
            obj.meta_mut().set_name(name);
        }
        if obj.meta().name() != name {
            return Err(StorageError::invalid_object(
                key,
                format!("the name of the object ({}) does not match the name on the URL ({name})", obj.meta().name()),
            ));
        }

        let Some(old) = old else {
            obj.meta_mut().set_resource_version("");
            before_create(self.strategy.as_ref(), &mut obj)?;
            create_validation(&obj)?;
            return Ok(obj);
        };

        let requested_rv = object_resource_version(&obj)?;
        if requested_rv != 0 && requested_rv != current_rv {
            return Err(StorageError::conflict(
                key,
                current_rv,
                "the object has been modified; please apply your changes to the latest version and try again",
            ));
        }

        let old_meta = old.meta();
        let meta = obj.meta_mut();
        meta.set_uid(old_meta.uid());
        meta.creation_timestamp = old_meta.creation_timestamp;
        update_validation(&obj, old)?;
        Ok(obj)
    }
}

#[async_trait]
impl<T: Object> Getter<T> for Registry<T> {
    async fn get(&self, ctx: &Context, name: &str, opts: &GetOptions) -> StorageResult<T> {
        let key = self.keys.key_for(name);
        let opts = GetOptions {
            resource_version: opts.resource_version.clone(),
            ignore_not_found: false,
        };
        self.store()
            .get(ctx, &key, &opts)
            .await?
            .ok_or_else(|| StorageError::not_found(key, 0))
    }
}

#[async_trait]
impl<T: Object> Lister<T> for Registry<T> {
    async fn list(&self, ctx: &Context, opts: &ListOptions) -> StorageResult<ListResult<T>> {
        self.store().list(ctx, &self.keys.list_prefix(), opts).await
    }
}

#[async_trait]
impl<T: Object> Creater<T> for Registry<T> {
    async fn create(
        &self,
        ctx: &Context,
        mut obj: T,
        create_validation: &ValidateObjectFunc<T>,
        opts: &CreateOptions,
    ) -> StorageResult<T> {
        before_create(self.strategy.as_ref(), &mut obj)?;
        create_validation(&obj)?;

        let key = self.keys.key_for(obj.meta().name());
        let created = self.storage.create(ctx, &key, &obj, 0, opts.dry_run).await?;
        info!(key = %key, dry_run = opts.dry_run, "Created object");
        Ok(created)
    }
}

#[async_trait]
impl<T: Object> Updater<T> for Registry<T> {
    async fn update(
        &self,
        ctx: &Context,
        name: &str,
        obj_info: &dyn UpdatedObjectInfo<T>,
        create_validation: &ValidateObjectFunc<T>,
        update_validation: &ValidateObjectUpdateFunc<T>,
        force_allow_create: bool,
        opts: &UpdateOptions,
    ) -> StorageResult<(T, bool)> {
        let key = self.keys.key_for(name);
        let preconditions = obj_info.preconditions();
        let mut created = false;

        let updated = self
            .storage
            .guaranteed_update(
                ctx,
                &key,
                preconditions.as_ref(),
                force_allow_create,
                |old, meta| {
                    created = old.is_none();
                    let obj = self.prepare_update(
                        name,
                        &key,
                        old.as_ref(),
                        meta.resource_version,
                        obj_info,
                        create_validation,
                        update_validation,
                    )?;
                    Ok((obj, None))
                },
                opts.dry_run,
            )
            .await?;

        debug!(key = %key, created, dry_run = opts.dry_run, "Updated object");
        Ok((updated, created))
    }
}

#[async_trait]
impl<T: Object> GracefulDeleter<T> for Registry<T> {
    async fn delete(
        &self,
        ctx: &Context,
        name: &str,
        delete_validation: &ValidateObjectFunc<T>,
        opts: &DeleteOptions,
    ) -> StorageResult<(T, bool)> {
        let key = self.keys.key_for(name);
        let deleted = self
            .storage
            .delete(ctx, &key, opts.preconditions.as_ref(), delete_validation, opts.dry_run)
            .await?;
        info!(key = %key, dry_run = opts.dry_run, "Deleted object");
        Ok((deleted, true))
    }
}

#[async_trait]
impl<T: Object> CollectionDeleter<T> for Registry<T> {
    async fn delete_collection(
        &self,
        ctx: &Context,
        delete_validation: &ValidateObjectFunc<T>,
        opts: &DeleteOptions,
        list_opts: &ListOptions,
    ) -> DeleteCollectionResult<T> {
        let prefix = self.keys.list_prefix();
        if !opts.dry_run {
            return self
                .store()
                .delete_collection_with(ctx, &prefix, list_opts, opts.preconditions.as_ref(), delete_validation)
                .await;
        }

        let mut result = DeleteCollectionResult {
            deleted: Vec::new(),
            error: None,
        };
        let mut list_opts = list_opts.clone();
        list_opts.limit = 0;
        list_opts.continue_token = None;
        let listed = match self.store().list(ctx, &prefix, &list_opts).await {
            Ok(listed) => listed,
            Err(e) => {
                result.error = Some(e);
                return result;
            }
        };
        for obj in listed.items {
            let checked = match &opts.preconditions {
                Some(preconditions) => preconditions.check(&self.keys.key_for(obj.meta().name()), &obj),
                None => Ok(()),
            }
            .and_then(|()| delete_validation(&obj));
            if let Err(e) = checked {
                result.error = Some(e);
                break;
            }
            result.deleted.push(obj);
        }
        result
    }
}

#[async_trait]
impl<T: Object> Watcher<T> for Registry<T> {
    async fn watch(&self, ctx: &Context, opts: &ListOptions) -> StorageResult<WatchStream<T>> {
        let pred = self.store().predicate(opts);
        match pred.matches_single() {
            Some(name) => {
                let key = self.keys.key_for(name);
                self.store().watch(ctx, &key, opts, false).await
            }
            None => self.store().watch(ctx, &self.keys.list_prefix(), opts, true).await,
        }
    }
}
