use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use super::DatabaseRegistry;
use crate::batch::{BatchOptions, BatchOutcome, BatchProcessor};
use crate::error::{Error, Result};
use crate::store::Store;
use crate::store::path::{ROOT, validate_path};
use crate::types::{Action, Folder};

/// Folder hierarchy inside a database namespace. Reads need read access,
/// mutations need write access.
#[derive(Clone)]
pub struct FolderService {
    store: Arc<dyn Store>,
    registry: DatabaseRegistry,
}

impl FolderService {
    pub fn new(store: Arc<dyn Store>, registry: DatabaseRegistry) -> Self {
        Self { store, registry }
    }

    /// Creates the folder and any missing ancestors.
    pub fn create_folder(&self, database: &str, actor: &str, path: &str) -> Result<Folder> {
        let path = validate_path(path)?;
        self.registry
            .require_access(database, Some(actor), Action::Write)?;

        let folder = self.store.create_folder(database, &path, Utc::now())?;
        info!("Created folder '{path}' in '{database}'");
        Ok(folder)
    }

    pub fn get_folder(&self, database: &str, actor: Option<&str>, path: &str) -> Result<Folder> {
        let path = validate_path(path)?;
        self.registry.require_access(database, actor, Action::Read)?;
        if path == ROOT {
            return Err(Error::InvalidInput(
                "the root folder is implicit and has no record".to_string(),
            ));
        }
        self.store
            .get_folder(database, &path)?
            .ok_or_else(|| Error::not_found("folder", &path))
    }

    /// Immediate children of `path`, ordered by name.
    pub fn list_folder(
        &self,
        database: &str,
        actor: Option<&str>,
        path: &str,
    ) -> Result<Vec<Folder>> {
        let path = validate_path(path)?;
        self.registry.require_access(database, actor, Action::Read)?;
        if path != ROOT && self.store.get_folder(database, &path)?.is_none() {
            return Err(Error::not_found("folder", &path));
        }
        self.store.list_child_folders(database, &path)
    }

    /// Deletes a folder. Without `recursive` the folder must have no
    /// subfolders and no files. Returns the number of folders removed.
    pub fn delete_folder(
        &self,
        database: &str,
        actor: &str,
        path: &str,
        recursive: bool,
    ) -> Result<usize> {
        let path = validate_path(path)?;
        self.registry
            .require_access(database, Some(actor), Action::Write)?;

        let removed = self.store.delete_folder(database, &path, recursive)?;
        info!("Deleted folder '{path}' from '{database}' ({removed} removed)");
        Ok(removed)
    }

    pub fn move_folder(&self, database: &str, actor: &str, from: &str, to: &str) -> Result<Folder> {
        let from = validate_path(from)?;
        let to = validate_path(to)?;
        self.registry
            .require_access(database, Some(actor), Action::Write)?;

        self.store.move_folder(database, &from, &to, Utc::now())?;
        info!("Moved folder '{from}' to '{to}' in '{database}'");
        self.store
            .get_folder(database, &to)?
            .ok_or_else(|| Error::not_found("folder", &to))
    }

    /// Adds `delta` files to a folder. The count never drops below zero.
    pub fn adjust_file_count(
        &self,
        database: &str,
        actor: &str,
        path: &str,
        delta: i64,
    ) -> Result<Folder> {
        let path = validate_path(path)?;
        self.registry
            .require_access(database, Some(actor), Action::Write)?;
        self.store
            .adjust_file_count(database, &path, delta, Utc::now())
    }

    /// Creates many folders one at a time. Per-path failures are reported in
    /// the outcome when `continue_on_error` is set; otherwise the run stops and
    /// `Error::BatchAborted` lists the paths created before the failure.
    pub async fn create_folders(
        &self,
        database: &str,
        actor: &str,
        paths: Vec<String>,
        options: BatchOptions,
    ) -> Result<BatchOutcome<String, Folder>> {
        self.registry
            .require_access(database, Some(actor), Action::Write)?;

        let processor = BatchProcessor::new(options);
        let outcome = processor
            .process_individual(paths, |path| async move {
                let path = validate_path(&path)?;
                self.store.create_folder(database, &path, Utc::now())
            })
            .await
            .map_err(|aborted| aborted.into_error(|folder: &Folder| folder.path.clone()))?;

        info!(
            "Created {} folders in '{database}' ({} failed)",
            outcome.successful.len(),
            outcome.failed.len()
        );
        Ok(outcome)
    }
}
