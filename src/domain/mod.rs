//! Domain layer: device model, command schema, coordinator and settings.

pub mod command;
pub mod coordinator;
pub mod models;
pub mod registry;
pub mod settings;
