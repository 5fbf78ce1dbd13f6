//! Channel providers: the extension seam for serving channels.
//!
//! A [`Server`](crate::Server) holds an ordered registry of providers.
//! Channel creation and search resolution walk the registry in
//! registration order and take the first provider that claims the name.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use pva_core::{PvaResult, Structure, Value};

/// Resolves channel names to channels.
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    /// Creates (or looks up) the named channel. `Ok(None)` means this
    /// provider does not serve the name and resolution moves on to the
    /// next provider.
    async fn create_channel(&self, name: &str) -> PvaResult<Option<Arc<dyn Channel>>>;
}

/// A channel as held by a connection once created.
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    /// RPC capability of this channel. `None` means RPC requests against
    /// the channel are rejected.
    fn rpc_support(&self) -> Option<RpcSupport>;
}

/// How a channel serves RPC requests.
#[derive(Clone)]
pub enum RpcSupport {
    /// A factory builds a dedicated executor per request from the INIT
    /// arguments.
    Factory(Arc<dyn RpcFactory>),
    /// One shared executor serves every request on the channel.
    Executor(Arc<dyn ChannelRpc>),
}

/// Builds RPC executors from INIT arguments.
#[async_trait]
pub trait RpcFactory: Send + Sync {
    async fn create_rpc(&self, args: &Structure) -> PvaResult<Arc<dyn ChannelRpc>>;
}

/// Executes RPC calls for a request.
#[async_trait]
pub trait ChannelRpc: Send + Sync {
    /// Runs one call. `cancel` fires when the request or its connection is
    /// torn down; long-running calls should return early when it does.
    async fn rpc(&self, args: Structure, cancel: CancellationToken) -> PvaResult<Value>;
}

/// Ordered set of channel providers.
pub struct ProviderRegistry {
    providers: RwLock<Vec<Arc<dyn ChannelProvider>>>,
}

impl ProviderRegistry {
    pub(crate) fn seeded(first: Arc<dyn ChannelProvider>) -> Self {
        ProviderRegistry { providers: RwLock::new(vec![first]) }
    }

    pub(crate) async fn push(&self, provider: Arc<dyn ChannelProvider>) {
        self.providers.write().await.push(provider);
    }

    /// Resolves a channel name. The first provider returning a channel
    /// wins; a provider error stops the scan.
    pub(crate) async fn resolve(&self, name: &str) -> PvaResult<Option<Arc<dyn Channel>>> {
        // Snapshot the list so the lock is not held while providers run.
        let providers = self.providers.read().await.clone();
        for provider in providers {
            if let Some(channel) = provider.create_channel(name).await? {
                return Ok(Some(channel));
            }
        }
        Ok(None)
    }
}
