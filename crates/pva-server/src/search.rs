//! Channel discovery.
//!
//! Search requests arrive as UDP datagrams or over an established
//! connection. Either way the responder reports which of the requested
//! channels this server can serve. Replies normally go back the way the
//! request came in; a request may instead name an explicit UDP
//! destination.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pva_core::{
    decode_datagram, encode_datagram, Command, Message, PvaError, PvaResult, SearchRequest,
    SearchResponse, SEARCH_REPLY_REQUIRED,
};

use crate::server::Server;

/// Answers search requests on behalf of one server.
pub(crate) struct Responder {
    server: Weak<Server>,
    guid: String,
    tcp_addr: SocketAddr,
    reply_socket: UdpSocket,
}

impl Responder {
    pub(crate) async fn new(server: &Arc<Server>, tcp_addr: SocketAddr) -> PvaResult<Self> {
        // Bound once per server so connection-originated searches can be
        // answered at an arbitrary UDP destination.
        let reply_socket = UdpSocket::bind("0.0.0.0:0").await?;
        Ok(Responder {
            server: Arc::downgrade(server),
            guid: hex::encode(server.guid()),
            tcp_addr,
            reply_socket,
        })
    }

    /// Answers a search that arrived over a connection. The reply goes
    /// through `out` onto the same connection unless the request names a
    /// UDP destination.
    pub(crate) async fn search_from_tcp(
        &self,
        req: SearchRequest,
        out: &mpsc::Sender<Message>,
    ) -> PvaResult<()> {
        let Some(resp) = self.build_response(&req).await? else {
            return Ok(());
        };
        let msg = Message::encode(Command::SearchResponse, &resp)?;
        if req.response_address.is_empty() {
            out.send(msg).await.map_err(|_| PvaError::Other("connection closed".into()))?;
        } else {
            let target = (req.response_address.as_str(), req.response_port);
            self.reply_socket.send_to(&encode_datagram(&msg, true)?, target).await?;
        }
        Ok(())
    }

    /// Builds the response, or `None` when nothing was found and the
    /// client did not ask for negative replies.
    async fn build_response(&self, req: &SearchRequest) -> PvaResult<Option<SearchResponse>> {
        let Some(server) = self.server.upgrade() else {
            return Ok(None);
        };
        let mut found = Vec::new();
        for channel in &req.channels {
            if server.providers().resolve(&channel.channel_name).await?.is_some() {
                found.push(channel.search_instance_id);
            }
        }
        if found.is_empty() && req.flags & SEARCH_REPLY_REQUIRED == 0 {
            return Ok(None);
        }
        Ok(Some(SearchResponse {
            guid: self.guid.clone(),
            sequence_id: req.sequence_id,
            server_address: self.tcp_addr.ip().to_string(),
            server_port: self.tcp_addr.port(),
            protocol: "tcp".into(),
            found: !found.is_empty(),
            search_instance_ids: found,
        }))
    }

    /// Answers discovery datagrams until shutdown. Malformed datagrams
    /// are dropped, not fatal.
    pub(crate) async fn serve_udp(
        self: Arc<Self>,
        socket: UdpSocket,
        shutdown: CancellationToken,
    ) {
        if let Ok(addr) = socket.local_addr() {
            info!(addr = %addr, "discovery listener ready");
        }
        let mut buf = vec![0u8; 65536];
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = socket.recv_from(&mut buf) => {
                    let (len, peer) = match received {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "udp receive failed");
                            continue;
                        }
                    };
                    if let Err(e) = self.answer_datagram(&socket, &buf[..len], peer).await {
                        debug!(peer = %peer, error = %e, "dropping search datagram");
                    }
                }
            }
        }
    }

    async fn answer_datagram(
        &self,
        socket: &UdpSocket,
        datagram: &[u8],
        peer: SocketAddr,
    ) -> PvaResult<()> {
        let msg = decode_datagram(datagram)?;
        if msg.command != u8::from(Command::SearchRequest) {
            // Other broadcast traffic is not ours to answer.
            return Ok(());
        }
        let req: SearchRequest = msg.decode()?;
        debug!(
            peer = %peer,
            sequence = req.sequence_id,
            channels = req.channels.len(),
            "udp search"
        );
        let Some(resp) = self.build_response(&req).await? else {
            return Ok(());
        };
        let wire = encode_datagram(&Message::encode(Command::SearchResponse, &resp)?, true)?;
        if req.response_address.is_empty() {
            socket.send_to(&wire, peer).await?;
        } else {
            socket.send_to(&wire, (req.response_address.as_str(), req.response_port)).await?;
        }
        Ok(())
    }
}
