//! Conductor Core - Shared types for the conductor session server
//!
//! This crate provides the types shared between the daemon library
//! (conductord) and the binary:
//! - `session` - Type-safe session identities
//! - `settings` - The persisted `key=value` settings store
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod error;
pub mod session;
pub mod settings;

// Re-exports for convenience
pub use error::{SettingsError, SettingsResult};
pub use session::SessionId;
pub use settings::Settings;
