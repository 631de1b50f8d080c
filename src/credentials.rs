use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use log::info;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use chitchathub::config::default_config_dir;

pub const CREDENTIALS_FILE: &str = "credentials.json";

/// Remembered login; the password is base64-obfuscated, not encrypted
#[derive(Serialize, Deserialize, Clone)]
pub struct Credentials {
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl Credentials {
    pub fn new(email: &str, password: &str) -> Self {
        Credentials {
            email: email.to_string(),
            password: Some(BASE64.encode(password)),
        }
    }

    pub fn get_password(&self) -> Option<String> {
        let encoded = self.password.as_ref()?;
        let bytes = BASE64.decode(encoded).ok()?;
        String::from_utf8(bytes).ok()
    }
}

/// Credentials live next to the config file in use
pub fn credentials_path(config_file: Option<&Path>) -> Result<PathBuf> {
    let dir = match config_file.and_then(Path::parent) {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => default_config_dir().map_err(|e| anyhow!("{}", e))?,
    };
    Ok(dir.join(CREDENTIALS_FILE))
}

pub fn save_credentials(path: &Path, credentials: &Credentials) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, credentials)?;

    info!("Credentials saved for {}", credentials.email);
    Ok(())
}

pub fn load_credentials(path: &Path) -> Result<Option<Credentials>> {
    if !path.exists() {
        return Ok(None);
    }

    let contents = fs::read_to_string(path)?;
    let credentials: Credentials = serde_json::from_str(&contents)?;
    info!("Loaded credentials for {} from {}", credentials.email, path.display());

    Ok(Some(credentials))
}

pub fn forget_credentials(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_file(path)?;
        info!("Removed saved credentials at {}", path.display());
    }
    Ok(())
}
