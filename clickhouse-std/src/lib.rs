#![doc = include_str!("../README.md")]

mod batch;
mod bind;
pub mod column;
mod connection;
mod constants;
mod context;
mod driver;
mod errors;
mod io;
pub mod native;
mod opener;
mod options;
#[cfg(feature = "pool")]
mod pool;
pub mod prelude;
mod query;
mod rows;
mod settings;
mod tcp;
pub mod telemetry;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod transport;

pub use batch::{Batch, Statement};
pub use bind::{Param, Params, format_value};
pub use context::{AsyncInsert, Context};
pub use driver::{Conn, Driver, Tx, lookup, open, register};
pub use errors::*;
/// Conversions between Rust values and cells
pub use native::convert::*;
pub use native::values::*;
pub use native::{Block, Progress, ServerError};
pub use opener::{ConnectionIds, Connector, dial_order};
pub use options::{Auth, ConnOpenStrategy, Options, Protocol};
#[cfg(feature = "pool")]
pub use pool::*;
pub use prelude::Secret;
pub use query::Qid;
pub use rows::Rows;
pub use settings::{SettingValue, Settings};

mod aliases {
    /// A non-cryptographically secure [`std::hash::BuildHasherDefault`] using
    /// [`rustc_hash::FxHasher`].
    pub type HashBuilder = std::hash::BuildHasherDefault<rustc_hash::FxHasher>;
    /// A non-cryptographically secure [`indexmap::IndexMap`] using [`HashBuilder`].
    pub type FxIndexMap<K, V> = indexmap::IndexMap<K, V, HashBuilder>;
}
// Type aliases used throughout the library
pub use aliases::*;
// External libraries
mod reexports {
    #[cfg(feature = "pool")]
    pub use bb8;
    pub use indexmap::IndexMap;
    pub use tokio_util::sync::CancellationToken;
    pub use uuid::Uuid;
    pub use {rustc_hash, tracing};
}
/// Re-exports
///
/// Exporting different external modules used by the library.
pub use reexports::*;
