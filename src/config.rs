//! Configuration surface for client construction
//!
//! [`ClientOptions`] carries the full set of connection/session/link tuning
//! knobs a client accepts. The set of recognized keys is closed:
//! unrecognized keys are a hard construction-time error, whether the options
//! come from a TOML file or a programmatic map.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::transport::{AttachObserver, ReceiverSettleMode, SenderSettleMode};

/// Configuration errors raised at construction time, never retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Parse(String),
    #[error("unrecognized configuration option: {0}")]
    UnknownOption(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Underlying transport flavor for the connection socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransportType {
    #[default]
    Amqp,
    AmqpOverWebsocket,
}

/// The closed set of recognized option keys.
const KNOWN_OPTIONS: &[&str] = &[
    "max_frame_size",
    "channel_max",
    "idle_timeout",
    "properties",
    "remote_idle_timeout_empty_frame_send_ratio",
    "outgoing_window",
    "incoming_window",
    "handle_max",
    "send_settle_mode",
    "receive_settle_mode",
    "desired_capabilities",
    "encoding",
    "transport_type",
    "http_proxy",
];

fn default_max_frame_size() -> u32 {
    65_536
}

fn default_channel_max() -> u16 {
    65_535
}

fn default_idle_ratio() -> f32 {
    0.5
}

fn default_window() -> u32 {
    2_048
}

fn default_handle_max() -> u32 {
    1_024
}

fn default_encoding() -> String {
    "UTF-8".to_string()
}

/// Client construction options.
///
/// Each field maps one-to-one onto the corresponding connection, session, or
/// link construction parameter of the transport provider. `on_attach` is
/// programmatic-only and cannot be loaded from a file.
#[derive(Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientOptions {
    /// Maximum AMQP frame size negotiated on the connection, bytes.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: u32,
    /// Highest channel number the connection may use.
    #[serde(default = "default_channel_max")]
    pub channel_max: u16,
    /// Connection idle timeout in milliseconds; `None` disables it.
    #[serde(default)]
    pub idle_timeout: Option<u64>,
    /// Connection properties advertised in the open frame.
    #[serde(default)]
    pub properties: HashMap<String, serde_json::Value>,
    /// Fraction of the peer's idle timeout at which empty frames are sent.
    #[serde(default = "default_idle_ratio")]
    pub remote_idle_timeout_empty_frame_send_ratio: f32,
    /// Session outgoing transfer window.
    #[serde(default = "default_window")]
    pub outgoing_window: u32,
    /// Session incoming transfer window.
    #[serde(default = "default_window")]
    pub incoming_window: u32,
    /// Highest link handle the session may allocate.
    #[serde(default = "default_handle_max")]
    pub handle_max: u32,
    /// Observer invoked when the remote attach frame arrives.
    #[serde(skip)]
    pub on_attach: Option<AttachObserver>,
    /// Sender settlement mode for sender links.
    #[serde(default)]
    pub send_settle_mode: SenderSettleMode,
    /// Receiver settlement mode for receiver links.
    #[serde(default)]
    pub receive_settle_mode: ReceiverSettleMode,
    /// Capabilities requested on link attach.
    #[serde(default)]
    pub desired_capabilities: Vec<String>,
    /// Text encoding handed to the transport for string sections.
    #[serde(default = "default_encoding")]
    pub encoding: String,
    /// Socket flavor for the connection.
    #[serde(default)]
    pub transport_type: TransportType,
    /// Optional HTTP proxy URL (websocket transport only).
    #[serde(default)]
    pub http_proxy: Option<String>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            max_frame_size: default_max_frame_size(),
            channel_max: default_channel_max(),
            idle_timeout: None,
            properties: HashMap::new(),
            remote_idle_timeout_empty_frame_send_ratio: default_idle_ratio(),
            outgoing_window: default_window(),
            incoming_window: default_window(),
            handle_max: default_handle_max(),
            on_attach: None,
            send_settle_mode: SenderSettleMode::default(),
            receive_settle_mode: ReceiverSettleMode::default(),
            desired_capabilities: Vec::new(),
            encoding: default_encoding(),
            transport_type: TransportType::default(),
            http_proxy: None,
        }
    }
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("max_frame_size", &self.max_frame_size)
            .field("channel_max", &self.channel_max)
            .field("idle_timeout", &self.idle_timeout)
            .field(
                "remote_idle_timeout_empty_frame_send_ratio",
                &self.remote_idle_timeout_empty_frame_send_ratio,
            )
            .field("outgoing_window", &self.outgoing_window)
            .field("incoming_window", &self.incoming_window)
            .field("handle_max", &self.handle_max)
            .field("on_attach", &self.on_attach.as_ref().map(|_| "<observer>"))
            .field("send_settle_mode", &self.send_settle_mode)
            .field("receive_settle_mode", &self.receive_settle_mode)
            .field("desired_capabilities", &self.desired_capabilities)
            .field("encoding", &self.encoding)
            .field("transport_type", &self.transport_type)
            .field("http_proxy", &self.http_proxy)
            .finish()
    }
}

impl ClientOptions {
    /// Load options from a TOML file, rejecting unrecognized keys.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let value: toml::Value =
            toml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let table = value
            .as_table()
            .ok_or_else(|| ConfigError::Parse("expected a table at the top level".to_string()))?;
        Self::check_keys(table.keys().map(|k| k.as_str()))?;

        let options: ClientOptions =
            value.try_into().map_err(|e: toml::de::Error| ConfigError::Parse(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    /// Build options from a loose key/value map, rejecting unrecognized
    /// keys before any deserialization happens.
    pub fn from_map(
        map: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Self, ConfigError> {
        Self::check_keys(map.keys().map(|k| k.as_str()))?;
        let options: ClientOptions = serde_json::from_value(serde_json::Value::Object(map))
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    fn check_keys<'a>(keys: impl Iterator<Item = &'a str>) -> Result<(), ConfigError> {
        for key in keys {
            if !KNOWN_OPTIONS.contains(&key) {
                return Err(ConfigError::UnknownOption(key.to_string()));
            }
        }
        Ok(())
    }

    /// Validate field ranges. Called by the clients at construction time.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // AMQP 1.0 mandates a 512-byte minimum max-frame-size.
        if self.max_frame_size < 512 {
            return Err(ConfigError::Invalid(
                "max_frame_size must be at least 512".to_string(),
            ));
        }
        let ratio = self.remote_idle_timeout_empty_frame_send_ratio;
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(ConfigError::Invalid(
                "remote_idle_timeout_empty_frame_send_ratio must be in (0, 1]".to_string(),
            ));
        }
        if self.encoding.is_empty() {
            return Err(ConfigError::Invalid("encoding must not be empty".to_string()));
        }
        if let Some(proxy) = &self.http_proxy {
            Url::parse(proxy)
                .map_err(|e| ConfigError::Invalid(format!("http_proxy is not a valid URL: {e}")))?;
        }
        if self.http_proxy.is_some() && self.transport_type != TransportType::AmqpOverWebsocket {
            return Err(ConfigError::Invalid(
                "http_proxy requires the amqp_over_websocket transport".to_string(),
            ));
        }
        Ok(())
    }

    /// Connection idle timeout as a `Duration`, if configured.
    pub fn idle_timeout_duration(&self) -> Option<Duration> {
        self.idle_timeout.map(Duration::from_millis)
    }

    /// View of the session-level settings for session construction.
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            incoming_window: self.incoming_window,
            outgoing_window: self.outgoing_window,
            handle_max: self.handle_max,
            on_attach: self.on_attach.clone(),
        }
    }
}

/// Session construction parameters, derived from [`ClientOptions`].
#[derive(Clone)]
pub struct SessionOptions {
    pub incoming_window: u32,
    pub outgoing_window: u32,
    pub handle_max: u32,
    pub on_attach: Option<AttachObserver>,
}

impl fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionOptions")
            .field("incoming_window", &self.incoming_window)
            .field("outgoing_window", &self.outgoing_window)
            .field("handle_max", &self.handle_max)
            .field("on_attach", &self.on_attach.as_ref().map(|_| "<observer>"))
            .finish()
    }
}

/// Sender link construction parameters.
#[derive(Debug, Clone)]
pub struct SenderLinkOptions {
    pub name: String,
    pub target: String,
    pub send_settle_mode: SenderSettleMode,
    pub max_message_size: Option<u64>,
    pub desired_capabilities: Vec<String>,
    pub properties: HashMap<String, serde_json::Value>,
}

/// Receiver link construction parameters. `prefetch` is the link credit
/// granted to the peer and the hard upper bound on in-flight deliveries.
#[derive(Debug, Clone)]
pub struct ReceiverLinkOptions {
    pub name: String,
    pub source: String,
    pub receive_settle_mode: ReceiverSettleMode,
    pub prefetch: u32,
    pub max_message_size: Option<u64>,
    pub desired_capabilities: Vec<String>,
    pub properties: HashMap<String, serde_json::Value>,
}
