mod settings;

pub use settings::{BatchConfig, CONFIG_FILE_NAME, CacheConfig, FolioConfig, SharingConfig};
