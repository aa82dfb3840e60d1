/// Configuration management
use crate::error::{ChatError, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_API_URL: &str = "http://127.0.0.1:4000";

const SOCKET_PATH: &str = "/socket";

/// Session configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the REST backend, without trailing slash
    pub api_base_url: String,

    /// URL of the real-time channel
    pub socket_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::for_api(DEFAULT_API_URL)
    }
}

impl Config {
    /// Config for an API base URL, with the socket URL derived from it
    pub fn for_api(api_base_url: &str) -> Self {
        let api_base_url = api_base_url.trim_end_matches('/').to_string();
        let socket_url = socket_url_for(&api_base_url);
        Self {
            api_base_url,
            socket_url,
        }
    }

    /// Build config from command line flags.
    ///
    /// Recognised flags are removed from `args`; whatever remains is the
    /// command and its operands.
    pub fn from_args(args: &mut Vec<String>) -> Result<Self> {
        let mut api_url: Option<String> = None;
        let mut socket_url: Option<String> = None;
        let mut rest = Vec::with_capacity(args.len());

        let mut i = 0;
        while i < args.len() {
            match args[i].as_str() {
                "--api-url" => {
                    let url = args.get(i + 1).ok_or_else(|| {
                        ChatError::Config("--api-url requires a URL argument".to_string())
                    })?;
                    api_url = Some(url.clone());
                    i += 2;
                }
                "--socket-url" => {
                    let url = args.get(i + 1).ok_or_else(|| {
                        ChatError::Config("--socket-url requires a URL argument".to_string())
                    })?;
                    socket_url = Some(url.clone());
                    i += 2;
                }
                other => {
                    rest.push(other.to_string());
                    i += 1;
                }
            }
        }
        *args = rest;

        // Env overrides (nice for scripts)
        if let Ok(url) = std::env::var("PDV_API_URL") {
            api_url = Some(url);
        }
        if let Ok(url) = std::env::var("PDV_SOCKET_URL") {
            socket_url = Some(url);
        }

        let mut config = match api_url {
            Some(url) => Self::for_api(&url),
            None => Self::default(),
        };
        if let Some(url) = socket_url {
            config.socket_url = url;
        }
        config.validate()?;
        Ok(config)
    }

    /// Check that both URLs use a scheme the transports understand.
    ///
    /// TLS is not handled here; put a terminating proxy in front of a
    /// `https://` backend.
    pub fn validate(&self) -> Result<()> {
        if !self.api_base_url.starts_with("http://") {
            return Err(ChatError::Config(format!(
                "API URL must start with http://: {}",
                self.api_base_url
            )));
        }
        if !self.socket_url.starts_with("ws://") {
            return Err(ChatError::Config(format!(
                "Socket URL must start with ws://: {}",
                self.socket_url
            )));
        }
        Ok(())
    }
}

fn socket_url_for(api_base_url: &str) -> String {
    if let Some(rest) = api_base_url.strip_prefix("http://") {
        format!("ws://{}{}", rest, SOCKET_PATH)
    } else {
        format!("{}{}", api_base_url, SOCKET_PATH)
    }
}
