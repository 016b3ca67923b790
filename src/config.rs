//! Environment-driven configuration and room deep-link helpers.

use std::env;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_SIGNAL_URL: &str = "ws://127.0.0.1:8080";

/// Signaling server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

impl ServerConfig {
    /// `PORT` overrides the default, parsed as a decimal integer.
    pub fn from_env() -> Result<Self> {
        let port = match env::var("PORT") {
            Ok(value) => value
                .trim()
                .parse::<u16>()
                .with_context(|| format!("invalid PORT value '{value}'"))?,
            Err(_) => DEFAULT_PORT,
        };
        Ok(Self { port })
    }

    pub fn bind_addr(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: DEFAULT_PORT }
    }
}

/// An ICE server entry handed to the peer connector. STUN needs no
/// credentials; TURN entries carry them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Public STUN endpoints sufficient for the reference functionality.
pub fn default_ice_servers() -> Vec<IceServer> {
    vec![IceServer {
        urls: vec![
            "stun:stun.l.google.com:19302".into(),
            "stun:stun.cloudflare.com:3478".into(),
        ],
        username: None,
        credential: None,
    }]
}

/// Client-side settings. The signaling URL is the single required knob.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub signal_url: Url,
    pub ice_servers: Vec<IceServer>,
}

impl ClientConfig {
    /// `AIRLIFT_SIGNAL_URL` overrides the default endpoint.
    pub fn from_env() -> Result<Self> {
        let raw = env::var("AIRLIFT_SIGNAL_URL").unwrap_or_else(|_| DEFAULT_SIGNAL_URL.to_string());
        let signal_url = Url::parse(&raw).with_context(|| format!("invalid signaling url '{raw}'"))?;
        Ok(Self {
            signal_url,
            ice_servers: default_ice_servers(),
        })
    }

    pub fn with_url(signal_url: Url) -> Self {
        Self {
            signal_url,
            ice_servers: default_ice_servers(),
        }
    }
}

/// Build the shareable deep link: `{origin}?room={CODE}`.
pub fn room_link(origin: &str, room_code: &str) -> Result<String> {
    let mut url = Url::parse(origin).with_context(|| format!("invalid origin '{origin}'"))?;
    url.query_pairs_mut()
        .append_pair("room", &room_code.to_uppercase());
    Ok(url.to_string())
}

/// Pull the `room` query parameter out of a page URL. Returns the uppercased
/// code and the URL with the parameter stripped, or `None` when absent.
pub fn extract_room_code(page_url: &str) -> Option<(String, String)> {
    let url = Url::parse(page_url).ok()?;
    let code = url
        .query_pairs()
        .find(|(key, _)| key == "room")
        .map(|(_, value)| value.to_uppercase())?;
    let remaining: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| key != "room")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let mut cleaned = url;
    if remaining.is_empty() {
        cleaned.set_query(None);
    } else {
        cleaned
            .query_pairs_mut()
            .clear()
            .extend_pairs(remaining.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    }
    Some((code, cleaned.to_string()))
}
