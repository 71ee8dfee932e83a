//! Runtime configuration
//!
//! A flat `key=value` file mapped onto typed sections.

mod schema;
mod store;

pub use schema::*;
pub use store::{
    default_config_path, parse_config, render_config, ConfigChange, ConfigStore, CONFIG_ENV,
    DEFAULT_CONFIG_PATH,
};
