#![allow(dead_code)]

use std::sync::Arc;

use folio::config::FolioConfig;
use folio::service::Folio;
use folio::store::Store;
use folio::types::{NotificationKind, Role};
use tempfile::TempDir;

/// A file-backed store in an isolated temp directory.
pub struct TestContext {
    pub temp_dir: TempDir,
    pub folio: Folio,
}

impl TestContext {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let config = FolioConfig {
            data_dir: temp_dir.path().to_path_buf(),
            ..FolioConfig::default()
        };
        let folio = Folio::open(config).expect("failed to open store");
        Self { temp_dir, folio }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        self.folio.store()
    }

    pub fn role(&self, database: &str, user: &str) -> Option<Role> {
        self.folio
            .registry()
            .user_role(database, user)
            .expect("failed to resolve role")
    }

    pub fn notification_kinds(&self, user: &str) -> Vec<NotificationKind> {
        let mut kinds: Vec<NotificationKind> = self
            .folio
            .notifications()
            .list(user, false)
            .expect("failed to list notifications")
            .into_iter()
            .map(|n| n.kind)
            .collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }
}
