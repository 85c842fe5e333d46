//! Wire-level building blocks: cell values, conversions, the `DDSketch` state, packets and blocks.
pub(crate) mod block;
pub mod convert;
pub(crate) mod protocol;
pub mod sketch;
pub mod values;

pub use block::{Block, BlockInfo};
pub use protocol::{Progress, ServerError};
