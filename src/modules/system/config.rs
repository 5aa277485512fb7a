use std::fs;
use std::path::PathBuf;

use crate::models::AppConfig;

const CONFIG_FILE: &str = "config.json";

pub fn get_data_dir() -> Result<PathBuf, String> {
    if let Ok(dir) = std::env::var("SWITCHYARD_DATA_DIR") {
        let path = PathBuf::from(dir);
        fs::create_dir_all(&path)
            .map_err(|e| format!("failed_to_create_data_dir: {}", e))?;
        return Ok(path);
    }
    let path = PathBuf::from("data");
    fs::create_dir_all(&path).map_err(|e| format!("failed_to_create_data_dir: {}", e))?;
    Ok(path)
}

/// Loads config.json, generating it on first start.
pub fn load_app_config() -> Result<AppConfig, String> {
    let config_path = get_data_dir()?.join(CONFIG_FILE);

    if !config_path.exists() {
        let config = AppConfig::new();
        let _ = save_app_config(&config);
        return Ok(config);
    }

    let content = fs::read_to_string(&config_path)
        .map_err(|e| format!("failed_to_read_config_file: {}", e))?;
    serde_json::from_str(&content).map_err(|e| format!("failed_to_parse_config_file: {}", e))
}

pub fn save_app_config(config: &AppConfig) -> Result<(), String> {
    let config_path = get_data_dir()?.join(CONFIG_FILE);
    let content = serde_json::to_string_pretty(config)
        .map_err(|e| format!("failed_to_serialize_config: {}", e))?;
    fs::write(&config_path, content).map_err(|e| format!("failed_to_save_config: {}", e))
}

/// Environment beats the file for deployment-critical settings.
pub fn apply_env_overrides(config: &mut AppConfig) {
    if let Ok(port) = std::env::var("PORT") {
        match port.trim().parse::<u16>() {
            Ok(p) if p > 0 => {
                config.server.port = p;
                tracing::info!("Using proxy port from environment: {}", p);
            }
            _ => tracing::warn!("[W-PORT-INVALID] ignoring_invalid_port_value: {}", port),
        }
    }

    if let Ok(host) = std::env::var("HOST") {
        if !host.trim().is_empty() {
            config.server.host = host.trim().to_string();
        }
    }

    if let Ok(key) = std::env::var("ADMIN_KEY") {
        if !key.trim().is_empty() {
            tracing::info!("Using admin key from environment");
            config.admin_key = key;
        }
    }

    if let Ok(path) = std::env::var("DATABASE_PATH") {
        if !path.trim().is_empty() {
            config.database.path = path;
        }
    }

    if let Ok(url) = std::env::var("OAUTH_CALLBACK_URL") {
        if !url.trim().is_empty() {
            config.oauth_callback_url = url;
        }
    }
}
