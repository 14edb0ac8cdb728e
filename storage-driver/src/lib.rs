//! # Storage drivers
//!
//! The capability set shared by the local staging store and the remote
//! durable store, along with the error type every driver reports.

mod driver;
mod error;

pub use driver::Driver;
pub use driver::FileWriter;
pub use driver::Metadata;
pub use driver::Progress;
pub use driver::Reader;
pub use error::{StorageError, StorageErrorBuilder, StorageErrorKind};
