//! A [`Store`] wrapper whose writes can be rehearsed without persisting.

use crate::error::{StorageError, StorageResult};
use crate::meta::{object_resource_version, GetOptions, Object, Preconditions};
use crate::storage::{Context, ResponseMeta, Store};

/// Forwards to the store, or with `dry_run` set performs the same checks
/// against the current state and returns what the write would have produced.
pub struct DryRunnableStore<T> {
    store: Store<T>,
}

impl<T> Clone for DryRunnableStore<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<T: Object> DryRunnableStore<T> {
    pub fn new(store: Store<T>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Store<T> {
        &self.store
    }

    pub async fn create(&self, ctx: &Context, key: &str, obj: &T, ttl: u64, dry_run: bool) -> StorageResult<T> {
        if !dry_run {
            return self.store.create(ctx, key, obj, ttl).await;
        }
        let opts = GetOptions {
            ignore_not_found: true,
            ..Default::default()
        };
        if self.store.get(ctx, key, &opts).await?.is_some() {
            return Err(StorageError::exists(key, 0));
        }
        Ok(obj.clone())
    }

    pub async fn delete<V>(
        &self,
        ctx: &Context,
        key: &str,
        preconditions: Option<&Preconditions>,
        validate: V,
        dry_run: bool,
    ) -> StorageResult<T>
    where
        V: Fn(&T) -> StorageResult<()> + Send + Sync,
    {
        let current = self
            .store
            .get(ctx, key, &GetOptions::default())
            .await?
            .ok_or_else(|| StorageError::not_found(key, 0))?;
        if let Some(preconditions) = preconditions {
            preconditions.check(key, &current)?;
        }
        validate(&current)?;
        if dry_run {
            return Ok(current);
        }
        self.store.delete(ctx, key, preconditions).await
    }

    pub async fn guaranteed_update<F>(
        &self,
        ctx: &Context,
        key: &str,
        preconditions: Option<&Preconditions>,
        allow_create: bool,
        mut try_update: F,
        dry_run: bool,
    ) -> StorageResult<T>
    where
        F: FnMut(Option<T>, ResponseMeta) -> StorageResult<(T, Option<u64>)> + Send,
    {
        if !dry_run {
            return self
                .store
                .guaranteed_update(ctx, key, preconditions, allow_create, try_update)
                .await;
        }

        let opts = GetOptions {
            ignore_not_found: allow_create,
            ..Default::default()
        };
        let current = self.store.get(ctx, key, &opts).await?;
        let mut meta = ResponseMeta::default();
        if let Some(current) = &current {
            if let Some(preconditions) = preconditions {
                preconditions.check(key, current)?;
            }
            meta.resource_version = object_resource_version(current)?;
        }
        let (updated, _) = try_update(current, meta)?;
        Ok(updated)
    }
}
