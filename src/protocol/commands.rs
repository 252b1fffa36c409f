//! Command and status codes of the Blynk wire protocol
//!
//! Commands occupy the first header byte. Status codes are only ever carried
//! in the length field of RESPONSE frames.

use std::fmt;

/// Frame command byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Bare status response, length field carries the status code
    Response,
    Login,
    Ping,
    Bridge,
    HwSync,
    Internal,
    Property,
    Hardware,
    HardwareLogin,
    Redirect,
    EventLog,
    /// Any command byte this client does not know about
    Other(u8),
}

impl Command {
    pub const RESPONSE: u8 = 0;
    pub const LOGIN: u8 = 2;
    pub const PING: u8 = 6;
    pub const BRIDGE: u8 = 15;
    pub const HW_SYNC: u8 = 16;
    pub const INTERNAL: u8 = 17;
    pub const PROPERTY: u8 = 19;
    pub const HARDWARE: u8 = 20;
    pub const HARDWARE_LOGIN: u8 = 29;
    pub const REDIRECT: u8 = 41;
    pub const EVENT_LOG: u8 = 64;

    /// Wire value of this command
    pub fn code(self) -> u8 {
        match self {
            Command::Response => Self::RESPONSE,
            Command::Login => Self::LOGIN,
            Command::Ping => Self::PING,
            Command::Bridge => Self::BRIDGE,
            Command::HwSync => Self::HW_SYNC,
            Command::Internal => Self::INTERNAL,
            Command::Property => Self::PROPERTY,
            Command::Hardware => Self::HARDWARE,
            Command::HardwareLogin => Self::HARDWARE_LOGIN,
            Command::Redirect => Self::REDIRECT,
            Command::EventLog => Self::EVENT_LOG,
            Command::Other(code) => code,
        }
    }

    /// Whether the header length field of this command holds a status code
    /// instead of a payload length
    pub fn carries_status(self) -> bool {
        matches!(self, Command::Response)
    }
}

impl From<u8> for Command {
    fn from(code: u8) -> Self {
        match code {
            Self::RESPONSE => Command::Response,
            Self::LOGIN => Command::Login,
            Self::PING => Command::Ping,
            Self::BRIDGE => Command::Bridge,
            Self::HW_SYNC => Command::HwSync,
            Self::INTERNAL => Command::Internal,
            Self::PROPERTY => Command::Property,
            Self::HARDWARE => Command::Hardware,
            Self::HARDWARE_LOGIN => Command::HardwareLogin,
            Self::REDIRECT => Command::Redirect,
            Self::EVENT_LOG => Command::EventLog,
            other => Command::Other(other),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Other(code) => write!(f, "OTHER({code})"),
            known => write!(f, "{known:?}({})", known.code()),
        }
    }
}

/// Status codes carried by RESPONSE frames
pub mod status {
    pub const SUCCESS: u16 = 200;
    pub const INVALID_TOKEN: u16 = 9;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_codes_match_wire_values() {
        let cases = [
            (Command::Response, 0),
            (Command::Login, 2),
            (Command::Ping, 6),
            (Command::Bridge, 15),
            (Command::HwSync, 16),
            (Command::Internal, 17),
            (Command::Property, 19),
            (Command::Hardware, 20),
            (Command::HardwareLogin, 29),
            (Command::Redirect, 41),
            (Command::EventLog, 64),
        ];

        for (command, code) in cases {
            assert_eq!(command.code(), code);
            assert_eq!(Command::from(code), command);
        }
    }

    #[test]
    fn test_unknown_code_is_preserved() {
        let command = Command::from(99);
        assert_eq!(command, Command::Other(99));
        assert_eq!(command.code(), 99);
    }

    #[test]
    fn test_only_response_carries_status() {
        assert!(Command::Response.carries_status());
        assert!(!Command::Hardware.carries_status());
        assert!(!Command::Ping.carries_status());
    }

    #[test]
    fn test_display() {
        assert_eq!(Command::Ping.to_string(), "Ping(6)");
        assert_eq!(Command::Other(7).to_string(), "OTHER(7)");
    }
}
