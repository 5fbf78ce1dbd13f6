//! pva-core: shared protocol library for pva.
//!
//! Everything both ends of a connection need: the frame codec, the
//! application message types, dynamically typed values, and status
//! reporting. Transport setup and the server engine live in the server
//! crate.

pub mod codec;
pub mod error;
pub mod messages;
pub mod status;
pub mod value;

pub use codec::{
    decode_datagram, encode_datagram, FrameHeader, FramedReader, FramedWriter, Message,
    CTRL_SET_BYTE_ORDER, FLAG_BIG_ENDIAN, FLAG_CONTROL, FLAG_FROM_SERVER, HEADER_SIZE, MAGIC,
    MAX_PAYLOAD_SIZE, PROTOCOL_VERSION, RECEIVE_BUFFER_SIZE,
};
pub use error::{PvaError, PvaResult};
pub use messages::{
    ChannelRpcRequest, ChannelRpcResponse, ChannelRpcResponseInit, Command,
    ConnectionValidated, ConnectionValidationRequest, ConnectionValidationResponse,
    CreateChannelEntry, CreateChannelRequest, CreateChannelResponse, SearchChannel,
    SearchRequest, SearchResponse, CHANNEL_RPC_DESTROY, CHANNEL_RPC_INIT,
    SEARCH_REPLY_REQUIRED,
};
pub use status::{Severity, Status};
pub use value::{Structure, Value};
