//! Data model for the EMPI matching core.
//!
//! Entities map 1:1 to the relational tables created by `empi-db`'s
//! migrations. Enum-valued columns are stored as text; the [`model`] module
//! provides the typed wrappers and their sqlx codecs.

pub mod locks;
pub mod model;

pub use locks::DbLockId;
pub use model::*;
