//! The wire protocol: command bytes, payload framing, and the small JSON
//! shapes carried over it.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};

// Client -> server command bytes.
pub const INPUT: u8 = b'0';
pub const PING: u8 = b'1';
pub const RESIZE_TERMINAL: u8 = b'2';
pub const JSON_DATA: u8 = b'{';

// Server -> client command bytes.
pub const OUTPUT: u8 = b'0';
pub const PONG: u8 = b'1';
pub const SET_WINDOW_TITLE: u8 = b'2';
pub const SET_PREFERENCES: u8 = b'3';
pub const SET_RECONNECT: u8 = b'4';

pub const WS_PATH: &str = "/ws";
pub const WS_SUBPROTOCOL: &str = "tty";

#[derive(Debug, Deserialize)]
pub struct ResizeMessage {
    pub columns: u16,
    pub rows: u16,
}

#[derive(Debug, Deserialize)]
pub struct AuthMessage {
    #[serde(rename = "AuthToken")]
    pub auth_token: Option<String>,
}

/// Builds the three-frame banner sent right after a session is marked
/// initialized: window title, reconnect seconds, client preferences.
pub fn banner_frames(argv0: &str, hostname: &str, reconnect: i64, client_opt: &str) -> [String; 3] {
    [
        format!("{}{} ({})", SET_WINDOW_TITLE as char, argv0, hostname),
        format!("{}{}", SET_RECONNECT as char, reconnect),
        format!("{}{}", SET_PREFERENCES as char, client_opt),
    ]
}

pub fn pong_frame() -> String {
    (PONG as char).to_string()
}

/// Encodes a PTY output chunk as an `OUTPUT` frame (base64 body).
pub fn output_frame(data: &[u8]) -> String {
    format!("{}{}", OUTPUT as char, BASE64.encode(data))
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("empty frame")]
    Empty,
    #[error("unknown command byte: {0:#04x}")]
    UnknownCommand(u8),
}

#[derive(Debug, PartialEq, Eq)]
pub enum ClientCommand<'a> {
    Input(&'a [u8]),
    Ping,
    Resize(&'a [u8]),
    Json(&'a [u8]),
}

/// Splits an assembled client message into its command byte and payload.
pub fn parse_client_command(buf: &[u8]) -> Result<ClientCommand<'_>, ProtocolError> {
    let (&first, rest) = buf.split_first().ok_or(ProtocolError::Empty)?;
    match first {
        INPUT => Ok(ClientCommand::Input(rest)),
        PING => Ok(ClientCommand::Ping),
        RESIZE_TERMINAL => Ok(ClientCommand::Resize(rest)),
        JSON_DATA => Ok(ClientCommand::Json(buf)),
        other => Err(ProtocolError::UnknownCommand(other)),
    }
}

pub fn parse_window_size(payload: &[u8]) -> Result<ResizeMessage, serde_json::Error> {
    serde_json::from_slice(payload)
}

pub fn parse_auth(payload: &[u8]) -> Result<AuthMessage, serde_json::Error> {
    serde_json::from_slice(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_input_command() {
        let buf = b"0hello";
        match parse_client_command(buf).unwrap() {
            ClientCommand::Input(payload) => assert_eq!(payload, b"hello"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parses_ping_with_empty_payload() {
        let buf = b"1";
        assert_eq!(parse_client_command(buf).unwrap(), ClientCommand::Ping);
    }

    #[test]
    fn parses_resize_json() {
        let buf = br#"2{"columns":80,"rows":24}"#;
        match parse_client_command(buf).unwrap() {
            ClientCommand::Resize(payload) => {
                let resize = parse_window_size(payload).unwrap();
                assert_eq!(resize.columns, 80);
                assert_eq!(resize.rows, 24);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn json_data_keeps_full_buffer_including_brace() {
        let buf = br#"{"AuthToken":"abc"}"#;
        match parse_client_command(buf).unwrap() {
            ClientCommand::Json(payload) => {
                let auth = parse_auth(payload).unwrap();
                assert_eq!(auth.auth_token.as_deref(), Some("abc"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_command_byte() {
        let buf = b"9whatever";
        assert!(matches!(
            parse_client_command(buf),
            Err(ProtocolError::UnknownCommand(b'9'))
        ));
    }

    #[test]
    fn rejects_empty_frame() {
        assert!(matches!(parse_client_command(b""), Err(ProtocolError::Empty)));
    }

    #[test]
    fn output_frame_base64_round_trips() {
        let frame = output_frame(b"hi\n");
        assert_eq!(&frame[..1], "0");
        let decoded = BASE64.decode(&frame[1..]).unwrap();
        assert_eq!(decoded, b"hi\n");
    }

    #[test]
    fn banner_frames_are_in_order() {
        let frames = banner_frames("/bin/echo", "myhost", 10, "{}");
        assert!(frames[0].starts_with('\u{2}'));
        assert!(frames[0].contains("/bin/echo"));
        assert!(frames[0].contains("myhost"));
        assert_eq!(frames[1], "\u{4}10");
        assert_eq!(frames[2], "\u{3}{}");
    }
}
