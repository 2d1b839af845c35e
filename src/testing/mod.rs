//! Testing utilities for the view computation cache.
//!
//! [`TestServer`] runs a [`CacheServer`] on an OS-assigned loopback port so
//! remote allocators and stores can be exercised end to end without any
//! fixed port bookkeeping.
//!
//! # Example
//!
//! ```rust,ignore
//! let server = TestServer::start().await?;
//! let client = server.connect().await?;
//!
//! let allocator = RemoteIdentifierAllocator::<String>::new(client.clone());
//! let id = allocator.get_id(&"k1".to_string()).await?;
//!
//! server.shutdown().await;
//! ```

mod allocator_tests;
mod cache_integration_tests;
mod remote_integration_tests;
mod utils;

pub use utils::wait_for;

use crate::allocator::{IdentifierAllocator, InMemoryIdentifierAllocator};
use crate::config::RemoteConfig;
use crate::error::{NetworkError, Result};
use crate::network::{CacheServer, NetworkServer, RemoteClient};
use crate::store::{BinaryStoreFactory, InMemoryBinaryStoreFactory};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A cache server running in the background for tests.
pub struct TestServer {
    addr: SocketAddr,
    handler: Arc<CacheServer>,
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<Result<()>>,
}

impl TestServer {
    /// Start a server over in-memory backends.
    pub async fn start() -> Result<Self> {
        Self::start_with(
            Arc::new(InMemoryIdentifierAllocator::<Vec<u8>>::new()),
            Arc::new(InMemoryBinaryStoreFactory::new()),
        )
        .await
    }

    /// Start a server over the given backends.
    pub async fn start_with(
        allocator: Arc<dyn IdentifierAllocator<Vec<u8>>>,
        store_factory: Arc<dyn BinaryStoreFactory>,
    ) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(NetworkError::Io)?;
        let addr = listener.local_addr().map_err(NetworkError::Io)?;

        let handler = Arc::new(CacheServer::new(allocator, store_factory));
        let (server, shutdown_tx) = NetworkServer::new(addr, handler.clone());
        let task = tokio::spawn(server.serve(listener));

        Ok(Self {
            addr,
            handler,
            shutdown_tx,
            task,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The request handler, for inspecting server-side state.
    pub fn handler(&self) -> &Arc<CacheServer> {
        &self.handler
    }

    /// Open a client connection to this server.
    pub async fn connect(&self) -> Result<Arc<RemoteClient>> {
        RemoteClient::connect(RemoteConfig::new(self.addr)).await
    }

    /// Stop accepting connections and wait for the accept loop to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        let _ = self.task.await;
    }
}
