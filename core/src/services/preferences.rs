use serde_json::Value;
use std::{collections::HashMap, path::PathBuf};
use tokio::{fs, sync::Mutex};

use crate::error::Result;

const DARK_MODE_KEY: &str = "dark_mode";

/// JSON key-value preference file.
pub struct Preferences {
    file: PathBuf,
    data: Mutex<HashMap<String, Value>>,
}

impl Preferences {
    /// Open the preference file at `file`, creating its directory.
    pub async fn open(file: PathBuf) -> Result<Self> {
        if let Some(dir) = file.parent() {
            fs::create_dir_all(dir).await?;
        }
        let data = match fs::read(&file).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                tracing::warn!(path = %file.display(), error = %e, "unreadable preferences, starting empty");
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        };
        Ok(Self {
            file,
            data: Mutex::new(data),
        })
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.data.lock().await.get(key).cloned()
    }

    /// Store a value under a key and persist the whole file.
    pub async fn put(&self, key: String, value: Value) -> Result<()> {
        let mut data = self.data.lock().await;
        data.insert(key, value);
        let bytes = serde_json::to_vec(&*data)?;
        fs::write(&self.file, bytes).await?;
        Ok(())
    }

    pub async fn dark_mode(&self) -> bool {
        self.get(DARK_MODE_KEY)
            .await
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    pub async fn set_dark_mode(&self, enabled: bool) -> Result<()> {
        self.put(DARK_MODE_KEY.into(), Value::Bool(enabled)).await
    }

    /// Per-account flag, falling back to the shared one.
    pub async fn dark_mode_for(&self, email: &str) -> bool {
        match self.get(&user_key(email)).await.and_then(|v| v.as_bool()) {
            Some(enabled) => enabled,
            None => self.dark_mode().await,
        }
    }

    pub async fn set_dark_mode_for(&self, email: &str, enabled: bool) -> Result<()> {
        self.put(user_key(email), Value::Bool(enabled)).await
    }
}

fn user_key(email: &str) -> String {
    format!("{}/{DARK_MODE_KEY}", email.trim().to_lowercase())
}
