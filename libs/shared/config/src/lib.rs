use std::env;
use tracing::warn;

pub const DEFAULT_TOPIC_PREFIX: &str = "consultation";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub redis_url: Option<String>,
    pub ice_server_urls: Vec<String>,
    pub signaling_topic_prefix: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let config = Self {
            supabase_url: env::var("SUPABASE_URL")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_URL not set, using empty value");
                    String::new()
                }),
            supabase_anon_key: env::var("SUPABASE_ANON_PUBLIC_KEY")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_ANON_PUBLIC_KEY not set, using empty value");
                    String::new()
                }),
            redis_url: env::var("REDIS_URL").ok().filter(|url| !url.is_empty()),
            ice_server_urls: env::var("ICE_SERVER_URLS")
                .map(|raw| parse_ice_servers(&raw))
                .unwrap_or_else(|_| {
                    warn!("ICE_SERVER_URLS not set, using public STUN servers");
                    Vec::new()
                }),
            signaling_topic_prefix: env::var("SIGNALING_TOPIC_PREFIX")
                .ok()
                .filter(|prefix| !prefix.is_empty())
                .unwrap_or_else(|| DEFAULT_TOPIC_PREFIX.to_string()),
        };

        if !config.is_configured() {
            warn!("Session records disabled - missing Supabase environment variables");
        }

        config
    }

    /// Session records can be written.
    pub fn is_configured(&self) -> bool {
        !self.supabase_url.is_empty() && !self.supabase_anon_key.is_empty()
    }

    pub fn is_signaling_relay_configured(&self) -> bool {
        self.redis_url.is_some()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            supabase_url: String::new(),
            supabase_anon_key: String::new(),
            redis_url: None,
            ice_server_urls: Vec::new(),
            signaling_topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
        }
    }
}

/// Splits a comma separated url list, skipping blanks.
pub fn parse_ice_servers(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(String::from)
        .collect()
}
