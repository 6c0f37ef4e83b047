//! Usine core library — account records, store ports, stores, settings.
//!
//! - [`types`] — ids, emails, roles and the two record kinds
//! - [`store`] — async ports for the identity and profile stores
//! - [`memory`] / [`file`] — in-process and JSON snapshot store implementations
//! - [`config`] — [`Settings`] loaded from `~/.usine/config.yaml`
//! - [`lock`] — advisory lock serialising reconciliation passes

pub mod config;
pub mod error;
pub mod file;
pub mod lock;
pub mod memory;
pub mod paths;
pub mod store;
pub mod table;
pub mod types;

pub use config::Settings;
pub use error::{ConfigError, FailureKind, LockError, StoreError};
pub use store::{
    BatchOutcome, IdentityStore, ItemFailure, Page, PageToken, ProfileOp, ProfileStore,
    SetOptions,
};
pub use types::{
    Email, IdentityRecord, ProfileRecord, ProfileSettings, Role, StoreKind, UserId,
};
