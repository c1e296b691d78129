//! Telephony switch management interface
//!
//! Queue membership actions go to the switch over its management protocol
//! (Asterisk Manager Interface style: `Key: Value` lines, blank-line
//! terminated blocks, responses correlated by `ActionID`).

pub mod ami;

pub use ami::{AmiClient, AmiConfig};
