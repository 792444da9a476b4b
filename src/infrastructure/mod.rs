//! Infrastructure layer: the two transports, the facade over them, and logging.

pub mod bluetooth;
pub mod cloud;
pub mod logging;
pub mod transport;
