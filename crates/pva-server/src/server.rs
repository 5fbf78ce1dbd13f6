//! Listener setup and connection supervision.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use pva_core::PvaResult;

use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::introspect::ServerChannel;
use crate::provider::{ChannelProvider, ProviderRegistry};
use crate::search::Responder;

/// A pva server.
///
/// Channels come from registered providers. The built-in introspection
/// provider is seeded first and serves the "server" channel, so user
/// providers cannot shadow it.
pub struct Server {
    providers: ProviderRegistry,
    guid: [u8; 12],
}

impl Server {
    pub fn new() -> Arc<Self> {
        let mut guid = [0u8; 12];
        rand::thread_rng().fill(&mut guid[..]);
        Arc::new(Server {
            providers: ProviderRegistry::seeded(Arc::new(ServerChannel::new())),
            guid,
        })
    }

    /// Registers a channel provider behind the ones already present.
    pub async fn add_provider(&self, provider: Arc<dyn ChannelProvider>) {
        self.providers.push(provider).await;
    }

    pub(crate) fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub(crate) fn guid(&self) -> &[u8; 12] {
        &self.guid
    }

    /// Binds the configured TCP and UDP ports and serves until shutdown.
    pub async fn listen_and_serve(
        self: Arc<Self>,
        config: &ServerConfig,
        shutdown: CancellationToken,
    ) -> PvaResult<()> {
        let listener = TcpListener::bind(config.tcp_addr()).await?;
        let discovery = UdpSocket::bind(config.udp_addr()).await?;
        self.serve(listener, Some(discovery), shutdown).await
    }

    /// Accepts connections until `shutdown` fires, then drains them. When
    /// a discovery socket is given, search datagrams on it are answered
    /// too.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        discovery: Option<UdpSocket>,
        shutdown: CancellationToken,
    ) -> PvaResult<()> {
        let local = listener.local_addr()?;
        info!(addr = %local, guid = %hex::encode(self.guid), "server listening");

        let responder = Arc::new(Responder::new(&self, local).await?);
        let tracker = TaskTracker::new();
        if let Some(socket) = discovery {
            tracker.spawn(responder.clone().serve_udp(socket, shutdown.child_token()));
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        info!(remote = %remote, "new connection");
                        let conn = Connection::new(
                            self.clone(),
                            responder.clone(),
                            shutdown.child_token(),
                        );
                        tracker.spawn(async move {
                            if let Err(e) = conn.run(stream).await {
                                error!(remote = %remote, error = %e, "error on connection");
                            }
                        });
                    }
                    Err(e) => {
                        // Usually transient (fd exhaustion); keep accepting.
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                },
            }
        }

        info!("server shutting down");
        tracker.close();
        tracker.wait().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncRead;
    use tokio::net::TcpStream;
    use tokio::time::timeout;

    use pva_core::{
        ChannelRpcRequest, ChannelRpcResponse, ChannelRpcResponseInit, Command,
        ConnectionValidationResponse, CreateChannelEntry, CreateChannelRequest,
        CreateChannelResponse, FramedReader, FramedWriter, Message, Structure, Value,
        CHANNEL_RPC_INIT,
    };

    use super::*;

    async fn next<R: AsyncRead + Unpin>(reader: &mut FramedReader<R>) -> Message {
        timeout(Duration::from_secs(5), reader.next())
            .await
            .expect("timed out waiting for a message")
            .unwrap()
            .expect("connection closed unexpectedly")
    }

    #[tokio::test]
    async fn serves_rpc_round_trips_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server = Server::new();
        let task = tokio::spawn(server.clone().serve(listener, None, shutdown.clone()));

        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedReader::new(read_half);
        let mut writer = FramedWriter::client(write_half);

        let validation = next(&mut reader).await;
        assert_eq!(validation.command, u8::from(Command::ConnectionValidation));
        writer
            .send_app(
                &Message::encode(
                    Command::ConnectionValidation,
                    &ConnectionValidationResponse {
                        client_receive_buffer_size: 16384,
                        client_introspection_registry_max_size: 0x7fff,
                        connection_qos: 0,
                        auth_nz: "anonymous".into(),
                    },
                )
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(next(&mut reader).await.command, u8::from(Command::ConnectionValidated));

        writer
            .send_app(
                &Message::encode(
                    Command::CreateChannel,
                    &CreateChannelRequest {
                        channels: vec![CreateChannelEntry {
                            client_channel_id: 1,
                            channel_name: "server".into(),
                        }],
                    },
                )
                .unwrap(),
            )
            .await
            .unwrap();
        let created: CreateChannelResponse = next(&mut reader).await.decode().unwrap();
        assert!(created.status.is_ok());

        writer
            .send_app(
                &Message::encode(
                    Command::ChannelRpc,
                    &ChannelRpcRequest {
                        server_channel_id: 1,
                        request_id: 1,
                        subcommand: CHANNEL_RPC_INIT,
                        args: Value::from(Structure::default()),
                    },
                )
                .unwrap(),
            )
            .await
            .unwrap();
        let init: ChannelRpcResponseInit = next(&mut reader).await.decode().unwrap();
        assert!(init.status.is_ok());

        writer
            .send_app(
                &Message::encode(
                    Command::ChannelRpc,
                    &ChannelRpcRequest {
                        server_channel_id: 1,
                        request_id: 1,
                        subcommand: 0,
                        args: Value::from(Structure::default().with("op", "info")),
                    },
                )
                .unwrap(),
            )
            .await
            .unwrap();
        let resp: ChannelRpcResponse = next(&mut reader).await.decode().unwrap();
        assert!(resp.status.is_ok());
        assert_eq!(resp.body.as_struct().unwrap().string_field("implLang"), Some("Rust"));

        shutdown.cancel();
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn user_providers_cannot_shadow_the_introspection_channel() {
        struct ShadowProvider;
        struct ShadowChannel;

        impl crate::provider::Channel for ShadowChannel {
            fn name(&self) -> &str {
                "server"
            }

            fn rpc_support(&self) -> Option<crate::provider::RpcSupport> {
                None
            }
        }

        #[async_trait::async_trait]
        impl ChannelProvider for ShadowProvider {
            async fn create_channel(
                &self,
                name: &str,
            ) -> PvaResult<Option<Arc<dyn crate::provider::Channel>>> {
                if name == "server" {
                    Ok(Some(Arc::new(ShadowChannel)))
                } else {
                    Ok(None)
                }
            }
        }

        let server = Server::new();
        server.add_provider(Arc::new(ShadowProvider)).await;

        let channel = server.providers().resolve("server").await.unwrap().unwrap();
        // The built-in channel supports RPC; the shadow does not.
        assert!(channel.rpc_support().is_some());
    }

    #[tokio::test]
    async fn each_server_gets_its_own_guid() {
        let a = Server::new();
        let b = Server::new();
        assert_eq!(a.guid().len(), 12);
        assert_ne!(a.guid(), b.guid());
    }
}
