use std::{fs, time::Duration};

use serde::Deserialize;

use crate::connection::ReconnectPolicy;

#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Base HTTP url of the chat server, e.g. `http://127.0.0.1:8080`.
    pub server_url: String,
    pub history_page_size: u32,
    pub presence_poll_interval_secs: u64,
    pub reconnect_max_attempts: u32,
    pub reconnect_base_delay_ms: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        let reconnect = ReconnectPolicy::default();
        Self {
            server_url: "http://127.0.0.1:8080".into(),
            history_page_size: 50,
            presence_poll_interval_secs: 30,
            reconnect_max_attempts: reconnect.max_attempts,
            reconnect_base_delay_ms: reconnect.base_delay.as_millis() as u64,
        }
    }
}

impl ClientSettings {
    pub fn presence_poll_interval(&self) -> Duration {
        Duration::from_secs(self.presence_poll_interval_secs.max(1))
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.reconnect_max_attempts.max(1),
            base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    server_url: Option<String>,
    history_page_size: Option<u32>,
    presence_poll_interval_secs: Option<u64>,
    reconnect_max_attempts: Option<u32>,
    reconnect_base_delay_ms: Option<u64>,
}

pub fn load_settings() -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string("client.toml") {
        apply_file_overrides(&mut settings, &raw);
    }

    if let Ok(v) = std::env::var("APP__SERVER_URL") {
        settings.server_url = v;
    }
    if let Ok(v) = std::env::var("APP__HISTORY_PAGE_SIZE") {
        if let Ok(parsed) = v.parse::<u32>() {
            settings.history_page_size = parsed;
        }
    }
    if let Ok(v) = std::env::var("APP__PRESENCE_POLL_INTERVAL_SECS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.presence_poll_interval_secs = parsed;
        }
    }
    if let Ok(v) = std::env::var("APP__RECONNECT_MAX_ATTEMPTS") {
        if let Ok(parsed) = v.parse::<u32>() {
            settings.reconnect_max_attempts = parsed;
        }
    }
    if let Ok(v) = std::env::var("APP__RECONNECT_BASE_DELAY_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.reconnect_base_delay_ms = parsed;
        }
    }

    settings
}

fn apply_file_overrides(settings: &mut ClientSettings, raw: &str) {
    let Ok(file_cfg) = toml::from_str::<FileSettings>(raw) else {
        return;
    };

    if let Some(v) = file_cfg.server_url {
        settings.server_url = v;
    }
    if let Some(v) = file_cfg.history_page_size {
        settings.history_page_size = v;
    }
    if let Some(v) = file_cfg.presence_poll_interval_secs {
        settings.presence_poll_interval_secs = v;
    }
    if let Some(v) = file_cfg.reconnect_max_attempts {
        settings.reconnect_max_attempts = v;
    }
    if let Some(v) = file_cfg.reconnect_base_delay_ms {
        settings.reconnect_base_delay_ms = v;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_mirror_reconnect_policy() {
        let settings = ClientSettings::default();
        let policy = ReconnectPolicy::default();

        assert_eq!(settings.reconnect_max_attempts, policy.max_attempts);
        assert_eq!(
            u128::from(settings.reconnect_base_delay_ms),
            policy.base_delay.as_millis()
        );
        assert_eq!(settings.presence_poll_interval_secs, 30);
        assert_eq!(settings.history_page_size, 50);
    }

    #[test]
    fn file_overrides_apply_over_defaults() {
        let mut settings = ClientSettings::default();
        apply_file_overrides(
            &mut settings,
            r#"
                server_url = "http://chat.example:9000"
                history_page_size = 25
                reconnect_max_attempts = 3
            "#,
        );

        assert_eq!(settings.server_url, "http://chat.example:9000");
        assert_eq!(settings.history_page_size, 25);
        assert_eq!(settings.reconnect_max_attempts, 3);
        assert_eq!(settings.presence_poll_interval_secs, 30);
    }

    #[test]
    fn malformed_file_is_ignored() {
        let mut settings = ClientSettings::default();
        apply_file_overrides(&mut settings, "history_page_size = \"not a number\"");

        assert_eq!(settings.history_page_size, 50);
    }

    #[test]
    fn poll_interval_has_a_floor_of_one_second() {
        let settings = ClientSettings {
            presence_poll_interval_secs: 0,
            ..ClientSettings::default()
        };

        assert_eq!(settings.presence_poll_interval(), Duration::from_secs(1));
    }
}
