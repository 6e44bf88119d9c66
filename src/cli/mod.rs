mod commands;
mod database;
mod init;
mod maintenance;

pub use commands::DatabaseCommands;
pub use database::{run_database_list, run_database_register, run_database_unregister};
pub use init::run_init;
pub use maintenance::run_maintenance;

use crate::config::FolioConfig;
use crate::service::Folio;

/// Opens an initialized data directory.
pub fn open_folio(data_dir: &str) -> anyhow::Result<Folio> {
    let config = FolioConfig::load_from_data_dir(data_dir)?;
    let db_path = config.db_path();

    if !db_path.exists() {
        anyhow::bail!(
            "Database not found at {}. Run 'folio init' first.",
            db_path.display()
        );
    }

    Folio::open(config).map_err(Into::into)
}
