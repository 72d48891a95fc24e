use std::{collections::HashMap, fs, path::Path};

use anyhow::{bail, Context};
use controllers::DuplicatePolicy;
use serde::Deserialize;
use shared::domain::{ControllerKind, EndpointName};

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub log_filter: String,
    pub main_endpoint: String,
    pub password_cache_ttl_seconds: u64,
    pub watch_list: Vec<String>,
    pub app_version: String,
    pub policies: HashMap<ControllerKind, DuplicatePolicy>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_filter: "info".into(),
            main_endpoint: "mainCS-main".into(),
            password_cache_ttl_seconds: 600,
            watch_list: Vec::new(),
            app_version: env!("CARGO_PKG_VERSION").into(),
            policies: HashMap::new(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSettings {
    log_filter: Option<String>,
    main_endpoint: Option<String>,
    password_cache_ttl_seconds: Option<u64>,
    watch_list: Option<Vec<String>>,
    app_version: Option<String>,
    #[serde(default)]
    policies: HashMap<String, DuplicatePolicy>,
}

/// Defaults, then the TOML file at `path` (if given), then `APP__*` variables.
pub fn load_settings(path: Option<&Path>) -> anyhow::Result<Settings> {
    let mut settings = Settings::default();
    if let Some(path) = path {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file '{}'", path.display()))?;
        apply_file(&mut settings, &raw)
            .with_context(|| format!("invalid config file '{}'", path.display()))?;
    }
    apply_env(&mut settings, |key| std::env::var(key).ok())?;
    validate(&settings)?;
    Ok(settings)
}

fn apply_file(settings: &mut Settings, raw: &str) -> anyhow::Result<()> {
    let file: FileSettings = toml::from_str(raw)?;
    if let Some(v) = file.log_filter {
        settings.log_filter = v;
    }
    if let Some(v) = file.main_endpoint {
        settings.main_endpoint = v;
    }
    if let Some(v) = file.password_cache_ttl_seconds {
        settings.password_cache_ttl_seconds = v;
    }
    if let Some(v) = file.watch_list {
        settings.watch_list = v;
    }
    if let Some(v) = file.app_version {
        settings.app_version = v;
    }
    for (kind, policy) in file.policies {
        let kind: ControllerKind = kind
            .parse()
            .with_context(|| format!("policy given for unknown controller kind '{kind}'"))?;
        settings.policies.insert(kind, policy);
    }
    Ok(())
}

fn apply_env(
    settings: &mut Settings,
    var: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<()> {
    if let Some(v) = var("APP__LOG_FILTER") {
        settings.log_filter = v;
    }
    if let Some(v) = var("APP__MAIN_ENDPOINT") {
        settings.main_endpoint = v;
    }
    if let Some(v) = var("APP__PASSWORD_CACHE_TTL_SECONDS") {
        settings.password_cache_ttl_seconds = v
            .parse()
            .with_context(|| format!("APP__PASSWORD_CACHE_TTL_SECONDS is not a number: '{v}'"))?;
    }
    if let Some(v) = var("APP__WATCH_LIST") {
        settings.watch_list = v
            .split(',')
            .map(str::trim)
            .filter(|pattern| !pattern.is_empty())
            .map(String::from)
            .collect();
    }
    if let Some(v) = var("APP__APP_VERSION") {
        settings.app_version = v;
    }
    Ok(())
}

fn validate(settings: &Settings) -> anyhow::Result<()> {
    let main = EndpointName::parse(&settings.main_endpoint)
        .with_context(|| format!("main_endpoint '{}'", settings.main_endpoint))?;
    if main.kind()? != ControllerKind::MainContentScript {
        bail!(
            "main_endpoint '{}' must be a {} endpoint",
            settings.main_endpoint,
            ControllerKind::MainContentScript
        );
    }
    if settings.password_cache_ttl_seconds == 0 {
        bail!("password_cache_ttl_seconds must be positive");
    }
    Ok(())
}
