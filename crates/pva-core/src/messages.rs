//! Application message types of the pva wire protocol.
//!
//! Each frame carries a command byte from [`Command`] and a CBOR-encoded
//! body. Bodies are plain structs here; the frame header lives in
//! [`crate::codec`].

use serde::{Deserialize, Serialize};

use crate::status::Status;
use crate::value::Value;

/// Application-level command byte carried in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Beacon = 0x00,
    ConnectionValidation = 0x01,
    Echo = 0x02,
    SearchRequest = 0x03,
    SearchResponse = 0x04,
    CreateChannel = 0x07,
    DestroyChannel = 0x08,
    ConnectionValidated = 0x09,
    ChannelRpc = 0x14,
    CancelRequest = 0x15,
}

impl From<Command> for u8 {
    fn from(c: Command) -> u8 {
        c as u8
    }
}

impl TryFrom<u8> for Command {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, String> {
        match v {
            0x00 => Ok(Command::Beacon),
            0x01 => Ok(Command::ConnectionValidation),
            0x02 => Ok(Command::Echo),
            0x03 => Ok(Command::SearchRequest),
            0x04 => Ok(Command::SearchResponse),
            0x07 => Ok(Command::CreateChannel),
            0x08 => Ok(Command::DestroyChannel),
            0x09 => Ok(Command::ConnectionValidated),
            0x14 => Ok(Command::ChannelRpc),
            0x15 => Ok(Command::CancelRequest),
            _ => Err(format!("unknown command: {v:#04x}")),
        }
    }
}

/// Subcommand bit for channel RPC: initialize the request.
pub const CHANNEL_RPC_INIT: u8 = 0x08;
/// Subcommand bit for channel RPC: destroy the request after execution.
pub const CHANNEL_RPC_DESTROY: u8 = 0x10;
/// Search flag: the client wants a response even when nothing was found.
pub const SEARCH_REPLY_REQUIRED: u8 = 0x80;

/// First application message on a connection, sent by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionValidationRequest {
    pub server_receive_buffer_size: i32,
    pub server_introspection_registry_max_size: i32,
    pub auth_nz: Vec<String>,
}

/// Client answer to [`ConnectionValidationRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionValidationResponse {
    pub client_receive_buffer_size: i32,
    pub client_introspection_registry_max_size: i32,
    pub connection_qos: i16,
    pub auth_nz: String,
}

/// Handshake acknowledgement; carries no fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionValidated;

/// Channel discovery request, over UDP or an established connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub sequence_id: i32,
    pub flags: u8,
    /// Where to send the response; empty means answer over the transport
    /// the request arrived on.
    pub response_address: String,
    pub response_port: u16,
    pub protocols: Vec<String>,
    pub channels: Vec<SearchChannel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchChannel {
    pub search_instance_id: i32,
    pub channel_name: String,
}

/// Answer to a [`SearchRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    /// Server GUID, hex-encoded.
    pub guid: String,
    pub sequence_id: i32,
    pub server_address: String,
    pub server_port: u16,
    pub protocol: String,
    pub found: bool,
    /// Instance IDs of the channels this server can serve.
    pub search_instance_ids: Vec<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateChannelRequest {
    pub channels: Vec<CreateChannelEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateChannelEntry {
    pub client_channel_id: i32,
    pub channel_name: String,
}

/// Per-channel creation result. `server_channel_id` is only meaningful when
/// the status is OK.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateChannelResponse {
    pub client_channel_id: i32,
    pub server_channel_id: i32,
    pub status: Status,
}

/// Channel RPC, client to server. The subcommand selects between request
/// initialization ([`CHANNEL_RPC_INIT`]) and execution; execution may carry
/// the [`CHANNEL_RPC_DESTROY`] bit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelRpcRequest {
    pub server_channel_id: i32,
    pub request_id: i32,
    pub subcommand: u8,
    pub args: Value,
}

/// Server response to an INIT subcommand, or to a failed request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelRpcResponseInit {
    pub request_id: i32,
    pub subcommand: u8,
    pub status: Status,
}

/// Server response carrying the result of an executed RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelRpcResponse {
    pub request_id: i32,
    pub subcommand: u8,
    pub status: Status,
    pub body: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_round_trips_through_u8() {
        for cmd in [
            Command::Beacon,
            Command::ConnectionValidation,
            Command::Echo,
            Command::SearchRequest,
            Command::SearchResponse,
            Command::CreateChannel,
            Command::DestroyChannel,
            Command::ConnectionValidated,
            Command::ChannelRpc,
            Command::CancelRequest,
        ] {
            assert_eq!(Command::try_from(u8::from(cmd)).unwrap(), cmd);
        }
    }

    #[test]
    fn unknown_command_is_rejected() {
        let err = Command::try_from(0x42).unwrap_err();
        assert!(err.contains("0x42"));
    }
}
