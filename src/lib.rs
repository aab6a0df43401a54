pub mod config;
pub mod db;
pub mod error;
pub mod permissions;
pub mod session;
pub mod store;
pub mod types;
pub mod views;

pub use db::SqliteStore;
pub use error::VaultError;
pub use permissions::{Capabilities, Role, capabilities};
pub use session::Session;
pub use store::{RemoteStore, RestStore};
pub use views::{VaultDetailHandle, VaultListHandle};
