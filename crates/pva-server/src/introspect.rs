//! The built-in "server" channel.
//!
//! Every server can answer introspection RPCs about itself. The channel is
//! registered ahead of user providers, so the name cannot be shadowed.

use std::sync::Arc;

use async_trait::async_trait;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use pva_core::{PvaResult, Status, Structure, Value};

use crate::provider::{Channel, ChannelProvider, ChannelRpc, RpcSupport};

/// Name under which the introspection channel is served.
pub const SERVER_CHANNEL: &str = "server";

/// Type ID prefix of NTURI requests. Standard tooling wraps the actual
/// query in one of these.
const NTURI_PREFIX: &str = "epics:nt/NTURI:1.";

/// Provider, channel, and executor for the "server" channel. The channel
/// is stateless apart from the process start time, so clones serve
/// everywhere an owned handle is needed.
#[derive(Clone)]
pub(crate) struct ServerChannel {
    start: OffsetDateTime,
}

impl ServerChannel {
    pub(crate) fn new() -> Self {
        ServerChannel { start: OffsetDateTime::now_utc() }
    }

    fn info(&self) -> Value {
        let start = self
            .start
            .format(&Rfc3339)
            .unwrap_or_else(|_| self.start.unix_timestamp().to_string());
        Value::from(
            Structure::default()
                .with("process", process_name())
                .with("startTime", start)
                .with("version", env!("CARGO_PKG_VERSION"))
                .with("implLang", "Rust")
                .with("host", hostname())
                .with("os", std::env::consts::OS)
                .with("arch", std::env::consts::ARCH),
        )
    }
}

#[async_trait]
impl ChannelProvider for ServerChannel {
    async fn create_channel(&self, name: &str) -> PvaResult<Option<Arc<dyn Channel>>> {
        if name == SERVER_CHANNEL {
            Ok(Some(Arc::new(self.clone())))
        } else {
            Ok(None)
        }
    }
}

impl Channel for ServerChannel {
    fn name(&self) -> &str {
        SERVER_CHANNEL
    }

    fn rpc_support(&self) -> Option<RpcSupport> {
        Some(RpcSupport::Executor(Arc::new(self.clone())))
    }
}

#[async_trait]
impl ChannelRpc for ServerChannel {
    async fn rpc(&self, args: Structure, _cancel: CancellationToken) -> PvaResult<Value> {
        let args = unwrap_nturi(args)?;
        if args.field("help").is_some() {
            return Ok(usage());
        }
        match args.string_field("op").unwrap_or_default() {
            "info" => Ok(self.info()),
            _ => Err(Status::error("invalid argument").into()),
        }
    }
}

/// Pulls the query out of an NTURI wrapper; plain structures pass through.
fn unwrap_nturi(args: Structure) -> PvaResult<Structure> {
    if !args.type_id.starts_with(NTURI_PREFIX) {
        return Ok(args);
    }
    match args.field("query") {
        Some(Value::Struct(query)) => Ok(query.clone()),
        _ => Err(Status::error("invalid argument").into()),
    }
}

fn usage() -> Value {
    Value::from(Structure::default().with("help", "ops: info. Example: op=info"))
}

fn process_name() -> String {
    std::env::args().next().unwrap_or_else(|| "pva-server".into())
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}
