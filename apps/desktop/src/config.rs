use std::{collections::HashMap, fs, path::Path};

use anyhow::{bail, Context};
use client_core::{ClientOptions, DEFAULT_PAGE_LIMIT};
use shared::domain::UserId;
use url::Url;

const DEFAULT_CONFIG_FILE: &str = "chat.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub api_base_url: String,
    pub push_base_url: Option<String>,
    pub auth_token: String,
    pub self_id: String,
    pub page_limit: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:8000/api/v1".into(),
            push_base_url: None,
            auth_token: String::new(),
            self_id: String::new(),
            page_limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

/// Defaults, then the TOML file, then the environment. An explicit `path`
/// must exist; the default `chat.toml` is optional.
pub fn load_settings(path: Option<&Path>) -> anyhow::Result<Settings> {
    let mut settings = Settings::default();

    let raw = match path {
        Some(path) => Some(
            fs::read_to_string(path)
                .with_context(|| format!("failed to read config file '{}'", path.display()))?,
        ),
        None => fs::read_to_string(DEFAULT_CONFIG_FILE).ok(),
    };
    if let Some(raw) = raw {
        let file_cfg = toml::from_str::<HashMap<String, toml::Value>>(&raw)
            .context("config file is not a flat TOML table")?;
        apply_file(&mut settings, &file_cfg);
    }

    apply_env(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

fn value_as_string(value: &toml::Value) -> Option<String> {
    match value {
        toml::Value::String(v) => Some(v.clone()),
        toml::Value::Integer(v) => Some(v.to_string()),
        _ => None,
    }
}

fn apply_file(settings: &mut Settings, file_cfg: &HashMap<String, toml::Value>) {
    let get = |key: &str| file_cfg.get(key).and_then(value_as_string);

    if let Some(v) = get("api_url") {
        settings.api_base_url = v;
    }
    if let Some(v) = get("push_url") {
        settings.push_base_url = Some(v);
    }
    if let Some(v) = get("token") {
        settings.auth_token = v;
    }
    if let Some(v) = get("user_id") {
        settings.self_id = v;
    }
    if let Some(v) = get("page_limit").and_then(|v| v.parse().ok()) {
        settings.page_limit = v;
    }
}

/// Plain names first, `APP__` names win.
pub fn apply_env(settings: &mut Settings, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("CHAT_API_URL") {
        settings.api_base_url = v;
    }
    if let Some(v) = var("APP__API_URL") {
        settings.api_base_url = v;
    }

    if let Some(v) = var("CHAT_PUSH_URL") {
        settings.push_base_url = Some(v);
    }
    if let Some(v) = var("APP__PUSH_URL") {
        settings.push_base_url = Some(v);
    }

    if let Some(v) = var("CHAT_TOKEN") {
        settings.auth_token = v;
    }
    if let Some(v) = var("APP__TOKEN") {
        settings.auth_token = v;
    }

    if let Some(v) = var("CHAT_USER_ID") {
        settings.self_id = v;
    }
    if let Some(v) = var("APP__USER_ID") {
        settings.self_id = v;
    }

    if let Some(v) = var("APP__PAGE_LIMIT") {
        if let Ok(parsed) = v.parse::<u32>() {
            settings.page_limit = parsed;
        }
    }
}

/// `http(s)://host[:port]/...` becomes `ws(s)://host[:port]/ws`.
pub fn derive_push_url(api_base_url: &str) -> anyhow::Result<String> {
    let mut url = Url::parse(api_base_url)
        .with_context(|| format!("invalid API URL '{api_base_url}'"))?;
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => bail!("unsupported API URL scheme '{other}'"),
    };
    if url.set_scheme(scheme).is_err() {
        bail!("cannot derive push URL from '{api_base_url}'");
    }
    url.set_path("/ws");
    url.set_query(None);
    url.set_fragment(None);
    Ok(url.to_string())
}

impl Settings {
    pub fn into_client_options(self) -> anyhow::Result<ClientOptions> {
        if self.auth_token.trim().is_empty() {
            bail!("an auth token is required (--token, CHAT_TOKEN or `token` in {DEFAULT_CONFIG_FILE})");
        }
        if self.self_id.trim().is_empty() {
            bail!("the local user id is required (--user-id, CHAT_USER_ID or `user_id` in {DEFAULT_CONFIG_FILE})");
        }
        let push_base_url = match self.push_base_url {
            Some(url) => url,
            None => derive_push_url(&self.api_base_url)?,
        };
        Ok(ClientOptions {
            api_base_url: self.api_base_url,
            push_base_url,
            auth_token: self.auth_token,
            self_id: UserId::new(self.self_id),
            page_limit: self.page_limit.clamp(1, 100),
        })
    }
}
