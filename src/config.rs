use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://anuneko.com";
pub const DEFAULT_DEVICE_ID: &str = "7b75a432-6b24-48ad-b9d3-3dc57648e3e3";
pub const APP_ID: &str = "com.anuttacon.neko";
pub const CLIENT_TYPE: &str = "4";

const CREATE_TIMEOUT_MS: u64 = 10_000;
const SWITCH_TIMEOUT_MS: u64 = 10_000;
const CONFIRM_TIMEOUT_MS: u64 = 5_000;

/// Connection settings for the AnuNeko backend.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub base_url: String,
    pub token: String,
    pub cookie: Option<String>,
    pub device_id: String,
    pub create_timeout_ms: u64,
    pub switch_timeout_ms: u64,
    pub confirm_timeout_ms: u64,
}

impl BackendConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            token: token.into(),
            cookie: None,
            device_id: DEFAULT_DEVICE_ID.to_string(),
            create_timeout_ms: CREATE_TIMEOUT_MS,
            switch_timeout_ms: SWITCH_TIMEOUT_MS,
            confirm_timeout_ms: CONFIRM_TIMEOUT_MS,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_cookie(mut self, cookie: Option<String>) -> Self {
        self.cookie = cookie;
        self
    }

    /// Reads `ANUNEKO_TOKEN`, `ANUNEKO_COOKIE`, `ANUNEKO_BASE_URL` and `ANUNEKO_DEVICE_ID`.
    /// Returns `None` when no token is configured.
    pub fn from_env() -> Option<Self> {
        let token = env_non_empty("ANUNEKO_TOKEN")?;
        let mut config = Self::new(token).with_cookie(env_non_empty("ANUNEKO_COOKIE"));
        if let Some(base_url) = env_non_empty("ANUNEKO_BASE_URL") {
            config.base_url = base_url;
        }
        if let Some(device_id) = env_non_empty("ANUNEKO_DEVICE_ID") {
            config.device_id = device_id;
        }
        Some(config)
    }

    pub fn create_timeout(&self) -> Duration {
        Duration::from_millis(self.create_timeout_ms)
    }

    pub fn switch_timeout(&self) -> Duration {
        Duration::from_millis(self.switch_timeout_ms)
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.confirm_timeout_ms)
    }

    /// Value sent as `origin` and, with a trailing slash, as `referer`.
    pub fn origin(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }
}

pub(crate) fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
