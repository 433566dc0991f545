pub mod app_config;
pub mod error;
pub mod probe_config;

pub use app_config::{
    AppConfig, Cli, load_config, parse_duration, parse_listen_address, setup_resolver,
    setup_tls_connector,
};
pub use error::ConfigError;
pub use probe_config::FileConfig;
