//! Control layer for MarsPro grow controllers over BLE or the vendor cloud.
//!
//! - [`domain`] - device model, command schema, registry, coordinator, settings
//! - [`infrastructure`] - BLE link, cloud link, transport facade, logging
//! - [`error`] - shared error taxonomy

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use domain::coordinator::DeviceCoordinator;
pub use error::{ControlError, Result};
pub use infrastructure::transport::{DeviceTransport, TransportFacade};
