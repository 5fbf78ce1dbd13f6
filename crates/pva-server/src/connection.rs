//! Per-connection protocol engine.
//!
//! The server speaks first: a SET_BYTE_ORDER control frame, then a
//! connection validation request. After that the connection settles into a
//! read loop that dispatches one message at a time. Writes go through a
//! dedicated task so RPC executors running in the background can deliver
//! their responses without racing the handlers.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use pva_core::{
    ChannelRpcRequest, ChannelRpcResponse, ChannelRpcResponseInit, Command, ConnectionValidated,
    ConnectionValidationRequest, ConnectionValidationResponse, CreateChannelRequest,
    CreateChannelResponse, FramedReader, FramedWriter, Message, PvaError, PvaResult,
    SearchRequest, Status, Structure, Value, CHANNEL_RPC_DESTROY, CHANNEL_RPC_INIT,
    CTRL_SET_BYTE_ORDER, RECEIVE_BUFFER_SIZE,
};

use crate::provider::{Channel, RpcSupport};
use crate::search::Responder;
use crate::server::Server;
use crate::state::ConnState;

/// Outcome of a channel RPC body: finished now with a status, failed with
/// an error the caller maps to a status, or handed to a background task
/// that will deliver its own response.
enum RpcDisposition {
    Completed(Status),
    Failed(PvaError),
    Pending,
}

/// One client connection.
pub(crate) struct Connection {
    server: Arc<Server>,
    search: Arc<Responder>,
    state: Arc<ConnState>,
    shutdown: CancellationToken,
    tasks: Mutex<JoinSet<()>>,
}

impl Connection {
    pub(crate) fn new(
        server: Arc<Server>,
        search: Arc<Responder>,
        shutdown: CancellationToken,
    ) -> Self {
        Connection {
            server,
            search,
            state: ConnState::new(),
            shutdown,
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    pub(crate) async fn run(&self, stream: TcpStream) -> PvaResult<()> {
        let (reader, writer) = stream.into_split();
        self.serve(FramedReader::new(reader), FramedWriter::server(writer)).await
    }

    /// Drives the connection until the peer goes away, a fatal error
    /// occurs, or the server shuts down. All connection state is torn down
    /// before this returns.
    pub(crate) async fn serve<R, W>(
        &self,
        mut reader: FramedReader<R>,
        mut writer: FramedWriter<W>,
    ) -> PvaResult<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        writer.send_control(CTRL_SET_BYTE_ORDER, 0).await?;
        let validation = ConnectionValidationRequest {
            server_receive_buffer_size: RECEIVE_BUFFER_SIZE as i32,
            server_introspection_registry_max_size: 0x7fff,
            auth_nz: vec!["anonymous".into()],
        };
        writer.send_app(&Message::encode(Command::ConnectionValidation, &validation)?).await?;

        let (out_tx, out_rx) = mpsc::channel(64);
        let writer_task = tokio::spawn(write_loop(writer, out_rx, self.shutdown.clone()));

        let result = self.read_loop(&mut reader, &out_tx).await;

        let cancelled = self.state.destroy_all().await;
        if cancelled > 0 {
            debug!(requests = cancelled, "cancelled in-flight requests");
        }
        self.shutdown.cancel();
        self.tasks.lock().await.shutdown().await;
        drop(out_tx);
        let _ = writer_task.await;
        result
    }

    async fn read_loop<R: AsyncRead + Unpin>(
        &self,
        reader: &mut FramedReader<R>,
        out: &mpsc::Sender<Message>,
    ) -> PvaResult<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                next = reader.next() => match next? {
                    Some(msg) => {
                        if let Some(resp) = self.dispatch(msg, out).await? {
                            if out.send(resp).await.is_err() {
                                return Ok(());
                            }
                        }
                    }
                    None => {
                        info!("client went away, closing connection");
                        return Ok(());
                    }
                },
            }
        }
    }

    /// Routes one application message. `Ok(None)` means the message needs
    /// no immediate response.
    async fn dispatch(
        &self,
        msg: Message,
        out: &mpsc::Sender<Message>,
    ) -> PvaResult<Option<Message>> {
        match Command::try_from(msg.command) {
            Ok(Command::ConnectionValidation) => self.handle_validation(msg).await,
            Ok(Command::SearchRequest) => self.handle_search(msg, out).await,
            Ok(Command::CreateChannel) => self.handle_create_channel(msg).await,
            Ok(Command::ChannelRpc) => self.handle_channel_rpc(msg, out).await,
            Ok(other) => {
                debug!(command = ?other, "ignoring unhandled command");
                Ok(None)
            }
            Err(_) => {
                debug!(command = msg.command, "ignoring unknown command");
                Ok(None)
            }
        }
    }

    async fn handle_validation(&self, msg: Message) -> PvaResult<Option<Message>> {
        let resp: ConnectionValidationResponse = msg.decode()?;
        info!(
            buffer_size = resp.client_receive_buffer_size,
            qos = resp.connection_qos,
            auth = %resp.auth_nz,
            "connection validated by client"
        );
        Ok(Some(Message::encode(Command::ConnectionValidated, &ConnectionValidated)?))
    }

    async fn handle_search(
        &self,
        msg: Message,
        out: &mpsc::Sender<Message>,
    ) -> PvaResult<Option<Message>> {
        let req: SearchRequest = msg.decode()?;
        debug!(sequence = req.sequence_id, channels = req.channels.len(), "search request");
        self.search.search_from_tcp(req, out).await?;
        Ok(None)
    }

    async fn handle_create_channel(&self, msg: Message) -> PvaResult<Option<Message>> {
        let req: CreateChannelRequest = msg.decode()?;
        let mut resp =
            CreateChannelResponse { client_channel_id: 0, server_channel_id: 0, status: Status::ok() };
        if let [entry] = req.channels.as_slice() {
            info!(
                channel = %entry.channel_name,
                client_id = entry.client_channel_id,
                "create channel request"
            );
            resp.client_channel_id = entry.client_channel_id;
            match self.create_channel(entry.client_channel_id, &entry.channel_name).await {
                Ok(Some(_)) => resp.server_channel_id = entry.client_channel_id,
                Ok(None) => {
                    resp.status =
                        Status::error(format!("unknown channel {:?}", entry.channel_name));
                }
                Err(e) => resp.status = Status::from_error(&e),
            }
            debug!(status = %resp.status, "channel create status");
        } else {
            resp.status = Status::error("wrong number of channels");
        }
        Ok(Some(Message::encode(Command::CreateChannel, &resp)?))
    }

    async fn create_channel(&self, id: i32, name: &str) -> PvaResult<Option<Arc<dyn Channel>>> {
        match self.server.providers().resolve(name).await? {
            Some(channel) => {
                self.state.insert_channel(id, channel.clone()).await;
                Ok(Some(channel))
            }
            None => Ok(None),
        }
    }

    async fn handle_channel_rpc(
        &self,
        msg: Message,
        out: &mpsc::Sender<Message>,
    ) -> PvaResult<Option<Message>> {
        let req: ChannelRpcRequest = msg.decode()?;
        debug!(
            channel_id = req.server_channel_id,
            request_id = req.request_id,
            subcommand = req.subcommand,
            "channel RPC"
        );
        let request_id = req.request_id;
        let subcommand = req.subcommand;
        match self.channel_rpc_body(req, out).await {
            RpcDisposition::Pending => Ok(None),
            RpcDisposition::Completed(status) => Ok(Some(Message::encode(
                Command::ChannelRpc,
                &ChannelRpcResponseInit { request_id, subcommand, status },
            )?)),
            RpcDisposition::Failed(err) => {
                warn!(request_id, error = %err, "channel RPC failed");
                Ok(Some(Message::encode(
                    Command::ChannelRpc,
                    &ChannelRpcResponseInit {
                        request_id,
                        subcommand,
                        status: Status::from_error(&err),
                    },
                )?))
            }
        }
    }

    async fn channel_rpc_body(
        &self,
        req: ChannelRpcRequest,
        out: &mpsc::Sender<Message>,
    ) -> RpcDisposition {
        let Some(channel) = self.state.channel(req.server_channel_id).await else {
            return RpcDisposition::Failed(PvaError::Channel(format!(
                "unknown channel ID {:x}",
                req.server_channel_id
            )));
        };
        let Value::Struct(args) = req.args else {
            return RpcDisposition::Failed(PvaError::InvalidMessage(
                "RPC arguments must be a structure".into(),
            ));
        };
        if req.subcommand == CHANNEL_RPC_INIT {
            self.init_request(channel.as_ref(), req.request_id, &args).await
        } else {
            self.exec_request(req.request_id, req.subcommand, args, out).await
        }
    }

    async fn init_request(
        &self,
        channel: &dyn Channel,
        request_id: i32,
        args: &Structure,
    ) -> RpcDisposition {
        debug!(channel = %channel.name(), request_id, "init channel RPC");
        let doer = match channel.rpc_support() {
            Some(RpcSupport::Factory(factory)) => match factory.create_rpc(args).await {
                Ok(doer) => doer,
                Err(e) => return RpcDisposition::Failed(e),
            },
            Some(RpcSupport::Executor(doer)) => doer,
            None => {
                return RpcDisposition::Failed(PvaError::Channel(format!(
                    "channel {:?} does not support RPC",
                    channel.name()
                )))
            }
        };
        match self.state.add_request(request_id, doer).await {
            Ok(()) => RpcDisposition::Completed(Status::ok()),
            Err(e) => RpcDisposition::Failed(e),
        }
    }

    /// Starts an execution in the background. The response is produced by
    /// the spawned task; the read loop stays free for other traffic.
    async fn exec_request(
        &self,
        request_id: i32,
        subcommand: u8,
        args: Structure,
        out: &mpsc::Sender<Message>,
    ) -> RpcDisposition {
        let (doer, cancel) = match self.state.begin_exec(request_id, &self.shutdown).await {
            Ok(pair) => pair,
            Err(e) => return RpcDisposition::Failed(e),
        };
        let destroy = subcommand & CHANNEL_RPC_DESTROY != 0;
        let state = self.state.clone();
        let out = out.clone();
        let mut tasks = self.tasks.lock().await;
        // Reap handles of executions that already finished.
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            let (status, body) = match doer.rpc(args, cancel).await {
                Ok(value) => (Status::ok(), value),
                Err(e) => {
                    debug!(request_id, error = %e, "RPC executor failed");
                    (Status::from_error(&e), Value::from(Structure::default()))
                }
            };
            let resp = ChannelRpcResponse { request_id, subcommand, status, body };
            match Message::encode(Command::ChannelRpc, &resp) {
                Ok(msg) => {
                    if out.send(msg).await.is_err() {
                        debug!(request_id, "connection closed before the RPC response went out");
                    }
                }
                Err(e) => error!(request_id, error = %e, "encoding RPC response"),
            }
            // The status flips back only after the response is queued.
            state.finish_exec(request_id, destroy).await;
        });
        RpcDisposition::Pending
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> Arc<ConnState> {
        self.state.clone()
    }

    #[cfg(test)]
    pub(crate) async fn task_count(&self) -> usize {
        self.tasks.lock().await.len()
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: FramedWriter<W>,
    mut rx: mpsc::Receiver<Message>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            next = rx.recv() => match next {
                Some(msg) => {
                    if let Err(e) = writer.send_app(&msg).await {
                        warn!(error = %e, "write failed, closing connection");
                        shutdown.cancel();
                        break;
                    }
                }
                None => break,
            },
        }
    }
}
