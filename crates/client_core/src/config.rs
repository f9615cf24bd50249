use std::{collections::HashMap, fs, path::Path, time::Duration};

use anyhow::Context;

pub const DEFAULT_TYPING_IDLE_MS: u64 = 3_000;
pub const DEFAULT_REACTION_DEBOUNCE_MS: u64 = 300;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub server_url: String,
    pub realtime_url: Option<String>,
    pub typing_idle_ms: u64,
    pub reaction_debounce_ms: u64,
    pub event_buffer: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8443".into(),
            realtime_url: None,
            typing_idle_ms: DEFAULT_TYPING_IDLE_MS,
            reaction_debounce_ms: DEFAULT_REACTION_DEBOUNCE_MS,
            event_buffer: 1024,
        }
    }
}

impl ClientSettings {
    pub fn typing_idle(&self) -> Duration {
        Duration::from_millis(self.typing_idle_ms)
    }

    pub fn reaction_debounce(&self) -> Duration {
        Duration::from_millis(self.reaction_debounce_ms)
    }

    /// WebSocket base url; derived from `server_url` unless set explicitly.
    pub fn realtime_base_url(&self) -> anyhow::Result<String> {
        if let Some(url) = &self.realtime_url {
            return Ok(url.trim_end_matches('/').to_string());
        }
        let server_url = self.server_url.trim_end_matches('/');
        if let Some(rest) = server_url.strip_prefix("https://") {
            Ok(format!("wss://{rest}"))
        } else if let Some(rest) = server_url.strip_prefix("http://") {
            Ok(format!("ws://{rest}"))
        } else {
            anyhow::bail!("server_url must start with http:// or https://")
        }
    }
}

/// Defaults, then `chat.toml` in the working directory, then environment.
pub fn load_settings() -> ClientSettings {
    let mut settings = ClientSettings::default();
    if let Err(err) = apply_file(&mut settings, Path::new("chat.toml")) {
        tracing::warn!("ignoring chat.toml: {err:#}");
    }
    apply_env(&mut settings, |key| std::env::var(key).ok());
    settings
}

fn apply_file(settings: &mut ClientSettings, path: &Path) -> anyhow::Result<()> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read '{}'", path.display()))
        }
    };
    let file_cfg = toml::from_str::<HashMap<String, toml::Value>>(&raw)
        .with_context(|| format!("failed to parse '{}'", path.display()))?;
    apply_values(settings, |key| {
        file_cfg.get(key).map(|value| match value {
            toml::Value::String(text) => text.clone(),
            other => other.to_string(),
        })
    });
    Ok(())
}

fn apply_env(settings: &mut ClientSettings, lookup: impl Fn(&str) -> Option<String>) {
    apply_values(settings, |key| {
        let upper = key.to_ascii_uppercase();
        lookup(&format!("APP__{upper}")).or_else(|| lookup(&format!("CHAT_{upper}")))
    });
}

fn apply_values(settings: &mut ClientSettings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("server_url") {
        settings.server_url = v;
    }
    if let Some(v) = lookup("realtime_url") {
        settings.realtime_url = Some(v);
    }
    if let Some(v) = lookup("typing_idle_ms").and_then(|v| v.parse().ok()) {
        settings.typing_idle_ms = v;
    }
    if let Some(v) = lookup("reaction_debounce_ms").and_then(|v| v.parse().ok()) {
        settings.reaction_debounce_ms = v;
    }
    if let Some(v) = lookup("event_buffer").and_then(|v| v.parse::<usize>().ok()) {
        settings.event_buffer = v.max(1);
    }
}
