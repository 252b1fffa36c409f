//! Typed inbound events and the keys handlers subscribe with

use std::fmt;
use std::str::FromStr;

/// Events delivered to registered handlers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Login accepted by the broker
    Connected,
    /// Engine left the connected/connecting state for any reason
    Disconnected,
    /// Broker rejected the auth token
    InvalidAuth,
    /// Broker asked the device to move to another server
    Redirect { host: String, port: u16 },
    /// Virtual pin write, delivered to the pin-specific subscriber
    VirtualWrite { pin: String, values: Vec<String> },
    /// Virtual pin write, delivered to the wildcard subscriber
    VirtualWriteAny { pin: String, values: Vec<String> },
    /// Internal broker message such as `rtc` or `utc`
    Internal { name: String, values: Vec<String> },
}

impl Event {
    /// Registry key this event is delivered to
    pub fn key(&self) -> EventKey {
        match self {
            Event::Connected => EventKey::Connected,
            Event::Disconnected => EventKey::Disconnected,
            Event::InvalidAuth => EventKey::InvalidAuth,
            Event::Redirect { .. } => EventKey::Redirect,
            Event::VirtualWrite { pin, .. } => EventKey::VirtualPin(pin.clone()),
            Event::VirtualWriteAny { .. } => EventKey::AnyVirtualPin,
            Event::Internal { name, .. } => EventKey::Internal(name.clone()),
        }
    }

    /// Values carried by pin and internal events
    pub fn values(&self) -> &[String] {
        match self {
            Event::VirtualWrite { values, .. }
            | Event::VirtualWriteAny { values, .. }
            | Event::Internal { values, .. } => values,
            _ => &[],
        }
    }
}

/// Subscription key
///
/// Renders to the classic event names (`"connected"`, `"V5"`, `"V*"`,
/// `"internal:rtc"`, ...) and parses back from them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKey {
    Connected,
    Disconnected,
    InvalidAuth,
    Redirect,
    VirtualPin(String),
    AnyVirtualPin,
    Internal(String),
}

impl EventKey {
    /// Key for a specific virtual pin
    pub fn pin(pin: impl ToString) -> Self {
        EventKey::VirtualPin(pin.to_string())
    }

    /// Key for an internal message name
    pub fn internal(name: impl Into<String>) -> Self {
        EventKey::Internal(name.into())
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKey::Connected => f.write_str("connected"),
            EventKey::Disconnected => f.write_str("disconnected"),
            EventKey::InvalidAuth => f.write_str("invalid_auth"),
            EventKey::Redirect => f.write_str("redirect"),
            EventKey::VirtualPin(pin) => write!(f, "V{pin}"),
            EventKey::AnyVirtualPin => f.write_str("V*"),
            EventKey::Internal(name) => write!(f, "internal:{name}"),
        }
    }
}

/// Unrecognised event name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown event name: {0}")]
pub struct UnknownEventName(pub String);

impl FromStr for EventKey {
    type Err = UnknownEventName;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "connected" => Ok(EventKey::Connected),
            "disconnected" => Ok(EventKey::Disconnected),
            "invalid_auth" => Ok(EventKey::InvalidAuth),
            "redirect" => Ok(EventKey::Redirect),
            "V*" => Ok(EventKey::AnyVirtualPin),
            _ => {
                if let Some(internal) = name.strip_prefix("internal:") {
                    if !internal.is_empty() {
                        return Ok(EventKey::Internal(internal.to_string()));
                    }
                } else if let Some(pin) = name.strip_prefix('V') {
                    if !pin.is_empty() {
                        return Ok(EventKey::VirtualPin(pin.to_string()));
                    }
                }
                Err(UnknownEventName(name.to_string()))
            }
        }
    }
}
