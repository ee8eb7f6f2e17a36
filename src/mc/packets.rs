//! The handful of packets the proxy understands.
//!
//! Only the pre-play slice of the protocol is modeled: handshake, the
//! status request/response pair with its ping, login start, and the
//! client-bound disconnect. Everything after login start is opaque bytes.

use serde::{Deserialize, Serialize};

use super::{write_string, write_varint, Packet, PacketReader, ProtocolError};

pub const HANDSHAKE_ID: i32 = 0x00;
pub const STATUS_REQUEST_ID: i32 = 0x00;
pub const STATUS_RESPONSE_ID: i32 = 0x00;
pub const PING_ID: i32 = 0x01;
pub const LOGIN_START_ID: i32 = 0x00;
pub const DISCONNECT_ID: i32 = 0x00;

/// Intent declared by the handshake's NextState field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Status,
    Login,
    Unknown,
}

impl std::fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandshakeState::Status => write!(f, "status"),
            HandshakeState::Login => write!(f, "login"),
            HandshakeState::Unknown => write!(f, "unknown"),
        }
    }
}

/// The first packet of every connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerBoundHandshake {
    pub protocol_version: i32,
    pub server_address: String,
    pub server_port: u16,
    pub next_state: i32,
}

impl ServerBoundHandshake {
    pub fn state(&self) -> HandshakeState {
        match self.next_state {
            1 => HandshakeState::Status,
            2 => HandshakeState::Login,
            _ => HandshakeState::Unknown,
        }
    }

    /// Hostname for routing: everything after the first NUL is forge data
    /// from legacy clients and is dropped, the rest is lowercased and any
    /// trailing dot trimmed.
    pub fn parse_server_address(&self) -> String {
        let host = self
            .server_address
            .split('\0')
            .next()
            .unwrap_or_default();
        host.trim_end_matches('.').to_lowercase()
    }

    pub fn marshal(&self) -> Packet {
        let mut data = Vec::new();
        write_varint(&mut data, self.protocol_version);
        write_string(&mut data, &self.server_address);
        data.extend_from_slice(&self.server_port.to_be_bytes());
        write_varint(&mut data, self.next_state);
        Packet::new(HANDSHAKE_ID, data)
    }

    pub fn unmarshal(pk: &Packet) -> Result<Self, ProtocolError> {
        if pk.id != HANDSHAKE_ID {
            return Err(ProtocolError::UnexpectedPacketId {
                expected: HANDSHAKE_ID,
                actual: pk.id,
            });
        }
        let mut r = PacketReader::new(&pk.data);
        Ok(Self {
            protocol_version: r.read_varint()?,
            server_address: r.read_string()?,
            server_port: r.read_u16()?,
            next_state: r.read_varint()?,
        })
    }
}

/// Empty status request following a NextState=1 handshake.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerBoundRequest;

impl ServerBoundRequest {
    pub fn marshal(&self) -> Packet {
        Packet::new(STATUS_REQUEST_ID, Vec::new())
    }
}

/// Login start: the player's username.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerLoginStart {
    pub name: String,
}

impl ServerLoginStart {
    pub fn marshal(&self) -> Packet {
        let mut data = Vec::new();
        write_string(&mut data, &self.name);
        Packet::new(LOGIN_START_ID, data)
    }

    pub fn unmarshal(pk: &Packet) -> Result<Self, ProtocolError> {
        if pk.id != LOGIN_START_ID {
            return Err(ProtocolError::UnexpectedPacketId {
                expected: LOGIN_START_ID,
                actual: pk.id,
            });
        }
        // Newer protocol revisions append signature data after the name;
        // trailing bytes are ignored.
        let mut r = PacketReader::new(&pk.data);
        Ok(Self {
            name: r.read_string()?,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatComponent {
    text: String,
}

/// Login-state disconnect with a chat component payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientBoundDisconnect {
    pub reason: String,
}

impl ClientBoundDisconnect {
    pub fn marshal(&self) -> Packet {
        let json = serde_json::to_string(&ChatComponent {
            text: self.reason.clone(),
        })
        .unwrap_or_default();
        let mut data = Vec::new();
        write_string(&mut data, &json);
        Packet::new(DISCONNECT_ID, data)
    }

    pub fn unmarshal(pk: &Packet) -> Result<Self, ProtocolError> {
        if pk.id != DISCONNECT_ID {
            return Err(ProtocolError::UnexpectedPacketId {
                expected: DISCONNECT_ID,
                actual: pk.id,
            });
        }
        let mut r = PacketReader::new(&pk.data);
        let json = r.read_string()?;
        let chat: ChatComponent =
            serde_json::from_str(&json).map_err(|_| ProtocolError::MalformedString)?;
        Ok(Self { reason: chat.text })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StatusVersion {
    name: String,
    protocol: i32,
}

#[derive(Debug, Serialize, Deserialize)]
struct StatusPlayers {
    max: i32,
    online: i32,
}

#[derive(Debug, Serialize, Deserialize)]
struct StatusResponse {
    version: StatusVersion,
    description: ChatComponent,
    players: StatusPlayers,
}

/// The configurable subset of a server-list status reply.
///
/// Mirrors the shape used in config files; player counts are always zero
/// because the proxy never knows them for a synthesized reply.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SimpleStatus {
    pub name: String,
    pub protocol: i32,
    pub description: String,
}

impl SimpleStatus {
    pub fn marshal(&self) -> Packet {
        let body = StatusResponse {
            version: StatusVersion {
                name: self.name.clone(),
                protocol: self.protocol,
            },
            description: ChatComponent {
                text: self.description.clone(),
            },
            players: StatusPlayers { max: 0, online: 0 },
        };
        let json = serde_json::to_string(&body).unwrap_or_default();
        let mut data = Vec::new();
        write_string(&mut data, &json);
        Packet::new(STATUS_RESPONSE_ID, data)
    }

    pub fn unmarshal(pk: &Packet) -> Result<Self, ProtocolError> {
        if pk.id != STATUS_RESPONSE_ID {
            return Err(ProtocolError::UnexpectedPacketId {
                expected: STATUS_RESPONSE_ID,
                actual: pk.id,
            });
        }
        let mut r = PacketReader::new(&pk.data);
        let json = r.read_string()?;
        let body: StatusResponse =
            serde_json::from_str(&json).map_err(|_| ProtocolError::MalformedString)?;
        Ok(Self {
            name: body.version.name,
            protocol: body.version.protocol,
            description: body.description.text,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_handshake() -> ServerBoundHandshake {
        ServerBoundHandshake {
            protocol_version: 755,
            server_address: "play.example.com".to_string(),
            server_port: 25565,
            next_state: 2,
        }
    }

    #[test]
    fn handshake_roundtrip() {
        let hs = sample_handshake();
        let decoded = ServerBoundHandshake::unmarshal(&hs.marshal()).unwrap();
        assert_eq!(decoded, hs);
    }

    #[test]
    fn handshake_state_classification() {
        let mut hs = sample_handshake();
        hs.next_state = 1;
        assert_eq!(hs.state(), HandshakeState::Status);
        hs.next_state = 2;
        assert_eq!(hs.state(), HandshakeState::Login);
        hs.next_state = 3;
        assert_eq!(hs.state(), HandshakeState::Unknown);
        hs.next_state = 0;
        assert_eq!(hs.state(), HandshakeState::Unknown);
    }

    #[test]
    fn server_address_strips_forge_suffix_and_case() {
        let mut hs = sample_handshake();
        hs.server_address = "Play.Example.COM\0FML2\0".to_string();
        assert_eq!(hs.parse_server_address(), "play.example.com");

        hs.server_address = "play.example.com.".to_string();
        assert_eq!(hs.parse_server_address(), "play.example.com");
    }

    #[test]
    fn handshake_wrong_id_rejected() {
        let mut pk = sample_handshake().marshal();
        pk.id = 0x7f;
        assert!(matches!(
            ServerBoundHandshake::unmarshal(&pk),
            Err(ProtocolError::UnexpectedPacketId { .. })
        ));
    }

    #[test]
    fn login_start_roundtrip_ignores_trailing_bytes() {
        let login = ServerLoginStart {
            name: "alice".to_string(),
        };
        let mut pk = login.marshal();
        assert_eq!(ServerLoginStart::unmarshal(&pk).unwrap(), login);

        pk.data.extend_from_slice(&[0xde, 0xad]);
        assert_eq!(ServerLoginStart::unmarshal(&pk).unwrap(), login);
    }

    #[test]
    fn disconnect_roundtrip() {
        let dc = ClientBoundDisconnect {
            reason: "Server is offline".to_string(),
        };
        assert_eq!(ClientBoundDisconnect::unmarshal(&dc.marshal()).unwrap(), dc);
    }

    #[test]
    fn status_json_is_canonical() {
        let status = SimpleStatus {
            name: "off".to_string(),
            protocol: 755,
            description: "down".to_string(),
        };
        let pk = status.marshal();
        let mut r = PacketReader::new(&pk.data);
        let json = r.read_string().unwrap();
        assert_eq!(
            json,
            r#"{"version":{"name":"off","protocol":755},"description":{"text":"down"},"players":{"max":0,"online":0}}"#
        );
        assert_eq!(SimpleStatus::unmarshal(&pk).unwrap(), status);
    }
}
