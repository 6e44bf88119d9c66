use clap::Subcommand;

#[derive(Subcommand)]
pub enum DatabaseCommands {
    /// Register a new database
    Register {
        /// Data directory holding folio.db and folio.toml
        #[arg(long, default_value = "./data")]
        data_dir: String,

        /// Database name
        #[arg(long)]
        name: String,

        /// Database type: vector or graph
        #[arg(long = "type", default_value = "vector")]
        db_type: String,

        /// Owning user identifier
        #[arg(long)]
        owner: String,

        /// Make the database publicly readable
        #[arg(long)]
        public: bool,
    },

    /// List registered databases
    List {
        /// Data directory holding folio.db and folio.toml
        #[arg(long, default_value = "./data")]
        data_dir: String,

        /// Only databases owned by this user
        #[arg(long)]
        owner: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Unregister a database and everything attached to it
    Unregister {
        /// Data directory holding folio.db and folio.toml
        #[arg(long, default_value = "./data")]
        data_dir: String,

        /// Database name
        #[arg(long)]
        name: String,
    },
}
