pub mod config;
pub mod dev_mode;
pub mod error;
pub mod paths;

pub use config::Config;
pub use dev_mode::DevMode;
pub use error::{FaceLinkError, Result};
pub use paths::{system_agent_socket, system_config_file, system_credentials_file, system_data_dir, system_models_dir};
