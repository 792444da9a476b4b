//! Bluetooth Module
//!
//! Provides BLE communication with a MarsPro grow controller.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                      BleTransport                        │
//! │   (DeviceTransport over one link; connect-on-demand)     │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼─────────────┐
//!         │             │             │
//!         ▼             ▼             ▼
//! ┌───────────┐  ┌────────────┐  ┌────────────┐
//! │  Scanner  │  │  BleLink   │  │  Protocol  │
//! │           │  │            │  │            │
//! │ - BLE     │  │ - State    │  │ - UUIDs    │
//! │ discovery │  │   machine  │  │ - Opcodes  │
//! │           │  │ - GATT ops │  │ - Codec    │
//! └─────┬─────┘  └─────┬──────┘  └────────────┘
//!       └──────┬───────┘
//!              ▼
//!       ┌────────────┐
//!       │    Gatt    │
//!       │ (btleplug) │
//!       └────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Protocol table, frame layouts and the codec
//! - [`gatt`] - Adapter/peripheral capability traits and the btleplug implementation
//! - [`scanner`] - BLE device discovery
//! - [`connection`] - Link state machine and typed GATT operations
//! - [`service`] - The link presented as a device transport

pub mod connection;
pub mod gatt;
pub mod protocol;
pub mod scanner;
pub mod service;

pub use connection::BleLink;
pub use service::BleTransport;
