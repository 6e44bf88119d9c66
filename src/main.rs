use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use folio::cli::{
    DatabaseCommands, run_database_list, run_database_register, run_database_unregister,
    run_init, run_maintenance,
};

#[derive(Parser)]
#[command(name = "folio")]
#[command(about = "Operator tooling for a folio content store", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a data directory (database schema and default config)
    Init {
        /// Data directory for folio.db and folio.toml
        #[arg(long, default_value = "./data")]
        data_dir: String,
    },

    /// Manage databases
    Database {
        #[command(subcommand)]
        command: DatabaseCommands,
    },

    /// Deactivate expired access tokens
    Maintenance {
        /// Data directory for folio.db and folio.toml
        #[arg(long, default_value = "./data")]
        data_dir: String,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("folio=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { data_dir } => run_init(data_dir)?,
        Commands::Database { command } => match command {
            DatabaseCommands::Register {
                data_dir,
                name,
                db_type,
                owner,
                public,
            } => run_database_register(data_dir, name, db_type, owner, public)?,
            DatabaseCommands::List {
                data_dir,
                owner,
                json,
            } => run_database_list(data_dir, owner, json)?,
            DatabaseCommands::Unregister { data_dir, name } => {
                run_database_unregister(data_dir, name)?;
            }
        },
        Commands::Maintenance { data_dir } => run_maintenance(data_dir)?,
    }

    Ok(())
}
