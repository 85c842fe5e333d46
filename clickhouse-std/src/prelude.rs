//! ## Convenience exports for working with the library.
pub use tracing::{Instrument, Span, debug, error, info, instrument, trace, trace_span, warn};

pub use crate::batch::{Batch, Statement};
pub use crate::bind::{Param, Params};
pub use crate::column::{Column, ScanType};
pub use crate::context::Context;
pub use crate::driver::{Conn, Driver, Tx};
pub use crate::errors::*;
pub use crate::native::convert::{FromSql, ToRow, ToSql};
pub use crate::native::values::{Decimal, Value};
pub use crate::opener::{ConnectionIds, Connector};
pub use crate::options::{Auth, ConnOpenStrategy, Options, Protocol};
pub use crate::query::Qid;
pub use crate::rows::Rows;
pub use crate::settings::*;
pub use crate::telemetry::*;

/// Newtype to protect secrets from being logged
#[derive(Clone, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
pub struct Secret(String);

impl Secret {
    pub fn new<P: AsRef<str>>(s: P) -> Self { Self(s.as_ref().to_string()) }

    #[must_use]
    pub fn get(&self) -> &str { &self.0 }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Password(*****)")
    }
}

impl<T: AsRef<str>> From<T> for Secret {
    fn from(s: T) -> Self { Self(s.as_ref().to_string()) }
}

/// Serializes the masked form so passwords never end up in dumped configuration
#[cfg(feature = "serde")]
impl serde::Serialize for Secret {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&format!("{self:?}"))
    }
}
