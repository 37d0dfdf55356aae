use std::path::PathBuf;

// Production locations. Dev mode redirects everything under ./dev_data instead.

pub fn system_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/homeface")
}

pub fn system_credentials_file() -> PathBuf {
    system_data_dir().join("credentials.json")
}

pub fn system_config_file() -> PathBuf {
    PathBuf::from("/etc/homeface/homeface.toml")
}

pub fn system_models_dir() -> PathBuf {
    PathBuf::from("/usr/share/homeface/models")
}

pub fn system_agent_socket() -> PathBuf {
    PathBuf::from("/run/homeface/agent.sock")
}
