//! Cloud transport
//!
//! - [`client`] - authenticated HTTP session ([`CloudLink`])
//! - [`contract`] - configurable JSON field names and payload parsing

pub mod client;
pub mod contract;

pub use client::CloudLink;
pub use contract::CloudContract;
