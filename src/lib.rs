//! Asset Custody - scope-governed custody ledger
//!
//! Tracks who holds which equipment, accessories and consumables across a
//! Department → Location → Room tree, and decides who may move them.
//!
//! ## Architecture
//!
//! - **auth**: role ranks, scope bindings and the permission evaluator
//! - **db**: SQLite store with append-only ledgers and audit log
//! - **services**: custody rules, one transaction per operation
//! - **http**: JSON API over the services
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/asset-custody/
//! ├── custody.db             # SQLite database (WAL)
//! └── config.toml            # Configuration
//! ```

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod http;
pub mod services;

// Re-exports
pub use auth::{AuthContext, PermissionEvaluator, Role, RoleBinding, Scope};
pub use config::Config;
pub use db::CustodyDb;
pub use error::{CustodyError, ErrorKind};
pub use http::HttpServer;
pub use services::{EventBus, ServiceDeps, Services};
