use crate::graph::TimeWindow;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub api_url: String,
    #[serde(default)]
    pub web_url: Option<String>,
    #[serde(default = "default_api_token_env")]
    pub api_token_env: String,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default)]
    pub web: WebConfig,
    pub hosts: Vec<String>,
    pub time_from: String,
    pub time_till: String,
    #[serde(default)]
    pub image: ImageConfig,
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    #[serde(default = "default_graphable_only")]
    pub graphable_only: bool,
    #[serde(default)]
    pub skip_existing: bool,
    #[serde(default)]
    pub metrics_file: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct WebConfig {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default = "default_web_password_env")]
    pub password_env: String,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ImageConfig {
    #[serde(default = "default_image_width")]
    pub width: u32,
    #[serde(default = "default_image_height")]
    pub height: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DownloadConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            width: default_image_width(),
            height: default_image_height(),
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            retry_count: default_retry_count(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

/// Web UI login, resolved from env/config at startup.
#[derive(Debug, Clone)]
pub struct WebCredentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("не удалось прочитать файл конфигурации {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("не удалось разобрать YAML в {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("ошибка валидации конфигурации: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let api_url = Url::parse(&self.api_url).map_err(|err| {
            ConfigError::Validation(format!("api_url не является корректным URL: {err}"))
        })?;
        if !matches!(api_url.scheme(), "http" | "https") {
            return Err(ConfigError::Validation(
                "api_url должен использовать схему http или https".to_string(),
            ));
        }
        if let Some(web_url) = &self.web_url {
            Url::parse(web_url).map_err(|err| {
                ConfigError::Validation(format!("web_url не является корректным URL: {err}"))
            })?;
        }

        validate_hosts(&self.hosts)?;
        self.time_window()?;
        validate_image(&self.image)?;
        validate_download(&self.download)?;

        if self.output_dir.trim().is_empty() {
            return Err(ConfigError::Validation(
                "output_dir не должен быть пустым".to_string(),
            ));
        }
        if let Some(username) = &self.web.username {
            if username.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "web.username не должен быть пустым, если задан".to_string(),
                ));
            }
        }

        Ok(())
    }

    pub fn time_window(&self) -> Result<TimeWindow, ConfigError> {
        TimeWindow::parse(&self.time_from, &self.time_till).map_err(ConfigError::Validation)
    }

    /// Base URL of the web UI. Defaults to the directory holding `api_jsonrpc.php`.
    pub fn web_base_url(&self) -> Result<Url, ConfigError> {
        let raw = match &self.web_url {
            Some(url) => url.clone(),
            None => self.api_url.clone(),
        };
        let mut url = Url::parse(&raw)
            .map_err(|err| ConfigError::Validation(format!("некорректный URL {raw}: {err}")))?;
        if self.web_url.is_none() {
            url = url.join("./").map_err(|err| {
                ConfigError::Validation(format!("не удалось вывести web_url из api_url: {err}"))
            })?;
        } else if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        url.set_query(None);
        url.set_fragment(None);
        Ok(url)
    }

    pub fn resolve_api_token(&self) -> Result<String, ConfigError> {
        if let Some(v) = resolve_from_env(&self.api_token_env) {
            return Ok(v);
        }
        if let Some(v) = non_empty(self.api_token.as_deref()) {
            return Ok(v);
        }
        Err(ConfigError::Validation(format!(
            "не найден токен API: задайте '{}' в окружении или api_token в config",
            self.api_token_env
        )))
    }

    /// `Ok(None)` when no web username is configured.
    pub fn resolve_web_credentials(&self) -> Result<Option<WebCredentials>, ConfigError> {
        let Some(username) = non_empty(self.web.username.as_deref()) else {
            return Ok(None);
        };
        let password = resolve_from_env(&self.web.password_env)
            .or_else(|| non_empty(self.web.password.as_deref()))
            .ok_or_else(|| {
                ConfigError::Validation(format!(
                    "web.username задан, но пароль не найден: задайте '{}' в окружении или web.password в config",
                    self.web.password_env
                ))
            })?;
        Ok(Some(WebCredentials { username, password }))
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

fn validate_hosts(hosts: &[String]) -> Result<(), ConfigError> {
    if hosts.is_empty() {
        return Err(ConfigError::Validation(
            "список hosts не должен быть пустым".to_string(),
        ));
    }
    let mut names = HashSet::new();
    for host in hosts {
        if host.trim().is_empty() {
            return Err(ConfigError::Validation(
                "hosts[*] не должен быть пустым".to_string(),
            ));
        }
        if !names.insert(host.as_str()) {
            return Err(ConfigError::Validation(format!(
                "хост '{host}' указан в hosts более одного раза"
            )));
        }
    }
    Ok(())
}

fn validate_image(cfg: &ImageConfig) -> Result<(), ConfigError> {
    if cfg.width == 0 {
        return Err(ConfigError::Validation(
            "image.width должно быть > 0".to_string(),
        ));
    }
    if cfg.height == 0 {
        return Err(ConfigError::Validation(
            "image.height должно быть > 0".to_string(),
        ));
    }
    Ok(())
}

fn validate_download(cfg: &DownloadConfig) -> Result<(), ConfigError> {
    if cfg.workers < 1 {
        return Err(ConfigError::Validation(
            "download.workers должно быть >= 1".to_string(),
        ));
    }
    if cfg.retry_base_delay_ms == 0 {
        return Err(ConfigError::Validation(
            "download.retry_base_delay_ms должно быть > 0".to_string(),
        ));
    }
    if cfg.retry_max_delay_ms < cfg.retry_base_delay_ms {
        return Err(ConfigError::Validation(
            "download.retry_max_delay_ms должно быть >= retry_base_delay_ms".to_string(),
        ));
    }
    if cfg.request_timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "download.request_timeout_ms должно быть > 0".to_string(),
        ));
    }
    Ok(())
}

fn resolve_from_env(env_name: &str) -> Option<String> {
    if let Ok(v) = std::env::var(env_name) {
        if !v.trim().is_empty() {
            return Some(v);
        }
    }
    None
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn default_api_token_env() -> String {
    "ZABBIX_API_TOKEN".to_string()
}

fn default_web_password_env() -> String {
    "ZABBIX_WEB_PASSWORD".to_string()
}

fn default_output_dir() -> String {
    "./graphs".to_string()
}

const fn default_graphable_only() -> bool {
    true
}

const fn default_image_width() -> u32 {
    1920
}

const fn default_image_height() -> u32 {
    200
}

const fn default_workers() -> usize {
    8
}

const fn default_retry_count() -> u32 {
    500
}

const fn default_retry_base_delay_ms() -> u64 {
    500
}

const fn default_retry_max_delay_ms() -> u64 {
    30_000
}

const fn default_request_timeout_ms() -> u64 {
    30_000
}

const fn default_shutdown_grace_ms() -> u64 {
    10_000
}
