use serde::Serialize;

use crate::store::DatabaseFilter;
use crate::types::{Database, DatabaseType, Visibility};

use super::open_folio;

#[derive(Serialize)]
struct DatabaseOutput {
    name: String,
    #[serde(rename = "type")]
    db_type: DatabaseType,
    owner: String,
    visibility: Visibility,
    item_count: i64,
    size_bytes: i64,
    created_at: String,
}

impl From<Database> for DatabaseOutput {
    fn from(db: Database) -> Self {
        Self {
            name: db.name,
            db_type: db.db_type,
            owner: db.owner,
            visibility: db.visibility,
            item_count: db.item_count,
            size_bytes: db.size_bytes,
            created_at: db.created_at.to_rfc3339(),
        }
    }
}

pub fn run_database_register(
    data_dir: String,
    name: String,
    db_type: String,
    owner: String,
    public: bool,
) -> anyhow::Result<()> {
    let folio = open_folio(&data_dir)?;
    let db_type: DatabaseType = db_type.parse()?;
    let visibility = if public {
        Visibility::Public
    } else {
        Visibility::Private
    };

    let db = folio
        .registry()
        .register_with(&name, db_type, &owner, visibility)?;
    println!(
        "Registered {} database '{}' owned by {} ({})",
        db.db_type, db.name, db.owner, db.visibility
    );
    Ok(())
}

pub fn run_database_list(data_dir: String, owner: Option<String>, json: bool) -> anyhow::Result<()> {
    let folio = open_folio(&data_dir)?;
    let databases = folio.registry().list(&DatabaseFilter {
        owner,
        ..DatabaseFilter::default()
    })?;

    if json {
        let output: Vec<DatabaseOutput> = databases.into_iter().map(Into::into).collect();
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    if databases.is_empty() {
        println!("No databases registered.");
        return Ok(());
    }

    for db in databases {
        println!(
            "{:<24} {:<7} {:<8} owner={} items={}",
            db.name,
            db.db_type.as_str(),
            db.visibility.as_str(),
            db.owner,
            db.item_count
        );
    }
    Ok(())
}

pub fn run_database_unregister(data_dir: String, name: String) -> anyhow::Result<()> {
    let folio = open_folio(&data_dir)?;
    folio.registry().force_unregister(&name)?;
    println!("Unregistered database '{name}'");
    Ok(())
}
