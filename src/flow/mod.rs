//! Flow control: topic-alias translation and receive-maximum windows
//! in both directions (spec.md section 4.E).

pub mod alias;
pub mod receive_max;

pub use alias::{AliasError, AliasTables};
pub use receive_max::{InboundPolicy, InboundTracker, OutboundWindow};
