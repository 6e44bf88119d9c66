//! # Folio
//!
//! A multi-tenant content store core: named vector/graph databases with
//! owners, virtual folder hierarchies, role-based sharing through
//! invitations and bearer tokens, and an LRU/TTL embedding cache.
//!
//! ## Library Usage
//!
//! ```toml
//! [dependencies]
//! folio = { version = "0.0.1", default-features = false }
//! ```
//!
//! ```rust,ignore
//! use folio::config::FolioConfig;
//! use folio::service::{Folio, InvitationOptions};
//! use folio::types::{DatabaseType, Role};
//!
//! let folio = Folio::open(FolioConfig::load_from_data_dir("./data")?)?;
//! folio.registry().register("docs", DatabaseType::Vector, "alice")?;
//! folio.folders().create_folder("docs", "alice", "/projects/2024")?;
//!
//! let invitation = folio.sharing().create_invitation(
//!     "docs", "alice", "bob", Role::Writer, InvitationOptions::default(),
//! )?;
//! folio.sharing().accept(&invitation.id, "bob")?;
//! ```
//!
//! ## Feature Flags
//!
//! - `cli` (default): Builds the `folio` operator binary. Disable with `default-features = false`.

pub mod auth;
pub mod batch;
pub mod cache;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod error;
pub mod service;
pub mod store;
pub mod types;
pub mod validation;

pub use error::{Error, Result};
pub use service::Folio;
