use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{Context, Result};
use clap::Parser;
use directories::ProjectDirs;
use serde::Deserialize;
use travelcore::weather::{DEFAULT_API_HOST, DEFAULT_BASE_URL};

/// Command line options for the server.
#[derive(Parser, Debug, Default)]
#[command(name = "travel_connect", about = "TravelConnect chat and trip planning server")]
pub struct Cli {
    /// Override bind address (host:port).
    #[arg(long)]
    pub bind: Option<String>,
    /// Override server port.
    #[arg(long)]
    pub port: Option<u16>,
    /// Enable or disable logging (true/false).
    #[arg(long)]
    pub logging: Option<bool>,
    /// Path to configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

/// Credentials and endpoint for the forecast service.
#[derive(Clone)]
pub struct WeatherSettings {
    pub base_url: String,
    pub api_key: String,
    pub api_host: String,
}

impl std::fmt::Debug for WeatherSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeatherSettings")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("api_host", &self.api_host)
            .finish()
    }
}

/// Runtime configuration for the server resolved from file, env and CLI.
#[derive(Clone, Debug)]
pub struct Config {
    /// Address to bind the HTTP server to.
    pub bind: String,
    /// Directory holding the database, media files and preferences.
    pub data_dir: PathBuf,
    /// Maximum upload size in megabytes.
    pub max_upload_mb: u64,
    pub logging_enabled: bool,
    pub weather: WeatherSettings,
}

const DEFAULT_PORT: u16 = 8787;
const DEFAULT_UPLOAD_MB: u64 = 5;

/// Contents of the TOML file. Every key is optional; unset keys fall through
/// to the built-in defaults.
#[derive(Deserialize, Default)]
#[serde(default)]
struct FileConfig {
    server: FileServer,
    logging: FileLogging,
    storage: FileStorage,
    weather: FileWeather,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct FileServer {
    port: Option<u16>,
    bind: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct FileLogging {
    enabled: Option<bool>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct FileStorage {
    data_dir: Option<PathBuf>,
    max_upload_mb: Option<u64>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct FileWeather {
    base_url: Option<String>,
    api_key: Option<String>,
    api_host: Option<String>,
}

impl FileConfig {
    /// A missing file yields the empty config; a malformed one is an error.
    fn read(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents)
                .with_context(|| format!("invalid config file {}", path.display())),
            Err(_) => Ok(Self::default()),
        }
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env_var(key)?.parse().ok()
}

impl Config {
    /// Resolve each setting from CLI, then environment, then file, then default.
    pub fn load(cli: &Cli) -> Result<Self> {
        let path = cli
            .config
            .clone()
            .or_else(|| env_var("TRAVEL_CONNECT_CONFIG").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("config/travel_connect.toml"));
        let file = FileConfig::read(&path)?;

        let port = cli
            .port
            .or_else(|| env_parse("TRAVEL_CONNECT_PORT"))
            .or(file.server.port)
            .unwrap_or(DEFAULT_PORT);
        if port < 1024 {
            anyhow::bail!("invalid_port");
        }
        let bind = cli
            .bind
            .clone()
            .or_else(|| env_var("BIND"))
            .or(file.server.bind)
            .unwrap_or_else(|| format!("127.0.0.1:{port}"));
        let logging_enabled = cli
            .logging
            .or_else(|| env_parse("TRAVEL_CONNECT_LOGGING"))
            .or(file.logging.enabled)
            .unwrap_or(true);

        let data_dir = env_var("DATA_DIR")
            .map(PathBuf::from)
            .or(file.storage.data_dir)
            .unwrap_or_else(default_data_dir);
        let max_upload_mb = env_parse("MAX_UPLOAD_MB")
            .or(file.storage.max_upload_mb)
            .unwrap_or(DEFAULT_UPLOAD_MB);

        let weather = WeatherSettings {
            base_url: file
                .weather
                .base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key: env_var("WEATHER_API_KEY")
                .or(file.weather.api_key)
                .unwrap_or_default(),
            api_host: env_var("WEATHER_API_HOST")
                .or(file.weather.api_host)
                .unwrap_or_else(|| DEFAULT_API_HOST.to_string()),
        };

        Ok(Self {
            bind,
            data_dir,
            max_upload_mb,
            logging_enabled,
            weather,
        })
    }

    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_mb * 1024 * 1024
    }
}

/// Platform data directory, falling back to the working directory.
pub fn default_data_dir() -> PathBuf {
    ProjectDirs::from("org", "travelconnect", "travelconnect")
        .map(|p| p.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("./travel_connect_data"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;

    fn clear_env() {
        for key in [
            "TRAVEL_CONNECT_PORT",
            "TRAVEL_CONNECT_LOGGING",
            "TRAVEL_CONNECT_CONFIG",
            "WEATHER_API_KEY",
            "WEATHER_API_HOST",
            "BIND",
            "DATA_DIR",
            "MAX_UPLOAD_MB",
        ] {
            std::env::remove_var(key);
        }
    }

    fn cli_for(contents: &str) -> (tempfile::TempDir, Cli) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.toml");
        fs::write(&path, contents).unwrap();
        let cli = Cli {
            config: Some(path),
            ..Default::default()
        };
        (dir, cli)
    }

    #[test]
    #[serial]
    fn valid_config_parses() {
        clear_env();
        let (_dir, cli) = cli_for("[server]\nport=5555\n[logging]\nenabled=false\n");
        let cfg = Config::load(&cli).unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:5555");
        assert!(!cfg.logging_enabled);
    }

    #[test]
    #[serial]
    fn invalid_port_fails() {
        clear_env();
        let (_dir, cli) = cli_for("[server]\nport=80\n");
        assert!(Config::load(&cli).is_err());
    }

    #[test]
    #[serial]
    fn missing_keys_defaults() {
        clear_env();
        let (_dir, cli) = cli_for("");
        let cfg = Config::load(&cli).unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:8787");
        assert!(cfg.logging_enabled);
        assert_eq!(cfg.weather.base_url, DEFAULT_BASE_URL);
        assert_eq!(cfg.weather.api_host, DEFAULT_API_HOST);
        assert!(cfg.weather.api_key.is_empty());
        assert_eq!(cfg.max_upload_bytes(), 5 * 1024 * 1024);
    }

    #[test]
    #[serial]
    fn precedence_cli_env_file() {
        clear_env();
        let (_dir, mut cli) = cli_for("[server]\nport=1111\n");
        std::env::set_var("TRAVEL_CONNECT_PORT", "2222");
        assert_eq!(Config::load(&cli).unwrap().bind, "127.0.0.1:2222");
        cli.port = Some(3333);
        assert_eq!(Config::load(&cli).unwrap().bind, "127.0.0.1:3333");
        std::env::remove_var("TRAVEL_CONNECT_PORT");
    }

    #[test]
    #[serial]
    fn weather_section_and_env_override() {
        clear_env();
        let (_dir, cli) = cli_for(
            "[weather]\nbase_url=\"http://localhost:9000\"\napi_key=\"file-key\"\n",
        );
        let cfg = Config::load(&cli).unwrap();
        assert_eq!(cfg.weather.base_url, "http://localhost:9000");
        assert_eq!(cfg.weather.api_key, "file-key");
        assert!(!format!("{cfg:?}").contains("file-key"));

        std::env::set_var("WEATHER_API_KEY", "env-key");
        assert_eq!(Config::load(&cli).unwrap().weather.api_key, "env-key");
        std::env::remove_var("WEATHER_API_KEY");
    }

    #[test]
    #[serial]
    fn storage_section_and_env_override() {
        clear_env();
        let (_dir, cli) = cli_for(
            "[server]\nbind=\"0.0.0.0:9000\"\n[storage]\ndata_dir=\"/srv/travel\"\nmax_upload_mb=12\n",
        );
        let cfg = Config::load(&cli).unwrap();
        assert_eq!(cfg.bind, "0.0.0.0:9000");
        assert_eq!(cfg.data_dir, PathBuf::from("/srv/travel"));
        assert_eq!(cfg.max_upload_mb, 12);

        std::env::set_var("MAX_UPLOAD_MB", "3");
        std::env::set_var("BIND", "127.0.0.1:9100");
        let cfg = Config::load(&cli).unwrap();
        assert_eq!(cfg.max_upload_mb, 3);
        assert_eq!(cfg.bind, "127.0.0.1:9100");
        clear_env();
    }

    #[test]
    #[serial]
    fn malformed_file_is_rejected() {
        clear_env();
        let (_dir, cli) = cli_for("[server]\nport=\"not a number\"\n");
        assert!(Config::load(&cli).is_err());
    }

    #[test]
    #[serial]
    fn logging_toggle() {
        clear_env();
        let (_dir, cli) = cli_for("[logging]\nenabled=false\n");
        assert!(!Config::load(&cli).unwrap().logging_enabled);
        std::env::set_var("TRAVEL_CONNECT_LOGGING", "true");
        assert!(Config::load(&cli).unwrap().logging_enabled);
        std::env::remove_var("TRAVEL_CONNECT_LOGGING");
    }
}
