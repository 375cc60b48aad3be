use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::{
    clock::Millis,
    error::{ControlError, InvalidRequest},
    types::{CommandEvent, RelayCommandBody},
};

pub const API_KEY_HEADER: &str = "X-API-Key";
pub const MAX_COMMAND_BODY_BYTES: usize = 512;

/// Push-mode gatekeeper: checks the shared secret and remembers the last
/// accepted command.
#[derive(Debug, Clone)]
pub struct CommandAuthority {
    key_digest: [u8; 32],
    last_command_at: Option<Millis>,
    last_requested_on: Option<bool>,
}

impl CommandAuthority {
    pub fn new(api_key: &str) -> Self {
        Self {
            key_digest: digest(api_key.as_bytes()),
            last_command_at: None,
            last_requested_on: None,
        }
    }

    /// Compares digests in constant time so neither content nor length of the
    /// configured key leaks through response timing.
    pub fn authenticate(&self, presented: Option<&str>) -> bool {
        let Some(presented) = presented else {
            return false;
        };
        let presented = digest(presented.as_bytes());
        presented[..].ct_eq(&self.key_digest[..]).into()
    }

    pub fn last_command_at(&self) -> Option<Millis> {
        self.last_command_at
    }

    pub fn last_requested_on(&self) -> Option<bool> {
        self.last_requested_on
    }

    /// Builds a [`CommandEvent`] from a raw request body. The body is only
    /// inspected once the caller is authenticated.
    pub fn build_event(
        &self,
        presented_key: Option<&str>,
        body: Option<&[u8]>,
        now_ms: Millis,
    ) -> Result<CommandEvent, ControlError> {
        let authenticated = self.authenticate(presented_key);
        if !authenticated {
            return Err(ControlError::Unauthorized);
        }
        let requested_on = parse_command_body(body)?;
        Ok(CommandEvent {
            requested_on,
            authenticated,
            received_at: now_ms,
        })
    }

    /// Validates the event and records it. Relay actuation is left to the caller.
    pub fn accept(&mut self, event: &CommandEvent) -> Result<(), ControlError> {
        if !event.authenticated {
            return Err(ControlError::Unauthorized);
        }
        self.last_command_at = Some(event.received_at);
        self.last_requested_on = Some(event.requested_on);
        Ok(())
    }
}

pub fn parse_command_body(body: Option<&[u8]>) -> Result<bool, InvalidRequest> {
    let body = match body {
        Some(body) if !body.iter().all(u8::is_ascii_whitespace) => body,
        _ => return Err(InvalidRequest::MissingBody),
    };
    if body.len() > MAX_COMMAND_BODY_BYTES {
        return Err(InvalidRequest::InvalidJson);
    }
    serde_json::from_slice::<RelayCommandBody>(body)
        .map(|parsed| parsed.on)
        .map_err(|_| InvalidRequest::InvalidJson)
}

fn digest(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(raw: &str) -> Option<&[u8]> {
        Some(raw.as_bytes())
    }

    #[test]
    fn accepts_only_exact_key() {
        let authority = CommandAuthority::new("esp32-secret-key-123");

        assert!(authority.authenticate(Some("esp32-secret-key-123")));
        assert!(!authority.authenticate(Some("esp32-secret-key-12")));
        assert!(!authority.authenticate(Some("ESP32-SECRET-KEY-123")));
        assert!(!authority.authenticate(Some("")));
        assert!(!authority.authenticate(None));
    }

    #[test]
    fn parses_on_and_off_bodies() {
        assert_eq!(parse_command_body(body(r#"{"on":true}"#)), Ok(true));
        assert_eq!(parse_command_body(body(r#"{ "on": false }"#)), Ok(false));
    }

    #[test]
    fn rejects_missing_and_malformed_bodies() {
        assert_eq!(parse_command_body(None), Err(InvalidRequest::MissingBody));
        assert_eq!(
            parse_command_body(body("  \n")),
            Err(InvalidRequest::MissingBody)
        );
        assert_eq!(
            parse_command_body(body("{on:true")),
            Err(InvalidRequest::InvalidJson)
        );
        assert_eq!(
            parse_command_body(body(r#"{"on":"yes"}"#)),
            Err(InvalidRequest::InvalidJson)
        );
        assert_eq!(
            parse_command_body(body(r#"{"off":true}"#)),
            Err(InvalidRequest::InvalidJson)
        );
    }

    #[test]
    fn unauthenticated_request_never_reaches_body_parsing() {
        let authority = CommandAuthority::new("secret");

        let result = authority.build_event(Some("wrong"), body("not json"), 5);

        assert_eq!(result, Err(ControlError::Unauthorized));
    }

    #[test]
    fn accept_records_arrival_time() {
        let mut authority = CommandAuthority::new("secret");
        let event = authority
            .build_event(Some("secret"), body(r#"{"on":true}"#), 1_234)
            .unwrap();

        authority.accept(&event).unwrap();

        assert_eq!(authority.last_command_at(), Some(1_234));
        assert_eq!(authority.last_requested_on(), Some(true));
    }

    #[test]
    fn accept_refuses_unauthenticated_event() {
        let mut authority = CommandAuthority::new("secret");
        let event = CommandEvent {
            requested_on: true,
            authenticated: false,
            received_at: 10,
        };

        assert_eq!(authority.accept(&event), Err(ControlError::Unauthorized));
        assert_eq!(authority.last_command_at(), None);
    }
}
