use std::fs;
use std::path::PathBuf;

use crate::config::{CONFIG_FILE_NAME, FolioConfig};
use crate::service::Folio;

/// Creates the data directory, the database schema and a default
/// `folio.toml` if none exists. Safe to run again.
pub fn run_init(data_dir: String) -> anyhow::Result<()> {
    let data_path = PathBuf::from(data_dir);
    fs::create_dir_all(&data_path)?;

    let config_path = data_path.join(CONFIG_FILE_NAME);
    if config_path.exists() {
        println!("Keeping existing config at {}", config_path.display());
    } else {
        let config = FolioConfig {
            data_dir: data_path.clone(),
            ..FolioConfig::default()
        };
        fs::write(&config_path, config.to_toml_string()?)?;
        println!("Wrote default config to {}", config_path.display());
    }

    let config = FolioConfig::load_from_data_dir(&data_path)?;
    let folio = Folio::open(config)?;
    println!("Initialized store at {}", folio.config().db_path().display());

    Ok(())
}
