pub mod broker;
pub mod broker_config;
pub mod errors;
pub mod logging;
pub mod protocol;
pub mod registry;
