//! Client side of the remote cache protocol.
//!
//! One TCP connection carries every request. Each request gets a fresh
//! correlation id and a oneshot waiter parked in a concurrent map; a reader
//! task completes waiters as responses arrive, in whatever order the server
//! sends them. Requests have no timeout; a caller that stops waiting by
//! dropping the request future also gives up its waiter.

use crate::config::RemoteConfig;
use crate::error::{Error, NetworkError, Result};
use crate::metrics::CacheMetrics;
use crate::network::rpc::{decode_envelope, frame_envelope, read_frame, write_frame, Envelope, Message};
use crate::types::{CachePartitionKey, NumericId};
use bytes::Bytes;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Requests queued for the writer task before senders wait.
const OUTGOING_QUEUE_DEPTH: usize = 1024;

type PendingMap = DashMap<u64, oneshot::Sender<Message>>;

/// Removes a request's waiter from the pending map when dropped.
struct WaiterGuard<'a> {
    pending: &'a PendingMap,
    correlation_id: u64,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.correlation_id);
    }
}

/// Connection to a cache server shared by remote allocators and stores.
pub struct RemoteClient {
    server_addr: SocketAddr,

    /// Framed requests for the writer task.
    outgoing: mpsc::Sender<Vec<u8>>,

    /// Waiters by correlation id.
    pending: Arc<PendingMap>,

    /// Correlation id generator.
    next_correlation_id: AtomicU64,

    /// Set once the connection is gone; no waiter will ever complete.
    closed: Arc<AtomicBool>,

    metrics: Arc<CacheMetrics>,

    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl RemoteClient {
    /// Connect to the configured server.
    pub async fn connect(config: RemoteConfig) -> Result<Arc<Self>> {
        Self::connect_with_metrics(config, Arc::new(CacheMetrics::new())).await
    }

    /// Connect to the configured server, reporting to the given metrics.
    pub async fn connect_with_metrics(
        config: RemoteConfig,
        metrics: Arc<CacheMetrics>,
    ) -> Result<Arc<Self>> {
        let addr = config.server_addr;
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| NetworkError::ConnectionFailed {
                addr: addr.to_string(),
                reason: "connect timeout".to_string(),
            })?
            .map_err(|e| NetworkError::ConnectionFailed {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true).map_err(NetworkError::Io)?;

        let (reader, writer) = stream.into_split();
        let (outgoing, out_rx) = mpsc::channel(OUTGOING_QUEUE_DEPTH);
        let pending: Arc<PendingMap> = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));

        let reader_task = tokio::spawn(Self::read_responses(
            reader,
            config.max_message_size,
            pending.clone(),
            closed.clone(),
            metrics.clone(),
        ));
        let writer_task = tokio::spawn(Self::write_requests(writer, out_rx));

        info!(server = %addr, "Connected to cache server");

        Ok(Arc::new(Self {
            server_addr: addr,
            outgoing,
            pending,
            next_correlation_id: AtomicU64::new(1),
            closed,
            metrics,
            reader_task,
            writer_task,
        }))
    }

    /// Address of the server this client talks to.
    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    /// Whether the connection has been lost.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of requests waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Send a request and wait for its response.
    ///
    /// A [`Message::Failure`] answer becomes [`Error::Remote`].
    pub async fn request(&self, message: Message) -> Result<Message> {
        let kind = message.kind();
        let correlation_id = self.next_correlation_id.fetch_add(1, Ordering::Relaxed);
        let framed = frame_envelope(&Envelope::new(correlation_id, message))?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(correlation_id, tx);
        // Unregisters the waiter on every exit, including a caller that
        // drops this future before the response arrives.
        let _waiter = WaiterGuard {
            pending: &self.pending,
            correlation_id,
        };

        // The reader clears the map after setting the flag, so a waiter
        // inserted after that clear is caught here.
        if self.is_closed() {
            return Err(NetworkError::ConnectionClosed.into());
        }

        self.metrics.remote_requests.inc(kind);
        trace!(correlation_id, kind, "Sending request");

        if self.outgoing.send(framed).await.is_err() {
            return Err(NetworkError::SendFailed("writer task stopped".to_string()).into());
        }

        match rx.await {
            Ok(Message::Failure { message }) => Err(Error::Remote(message)),
            Ok(response) => Ok(response),
            Err(_) => Err(NetworkError::ConnectionClosed.into()),
        }
    }

    /// Resolve serialized keys to ids, in request order.
    pub async fn lookup(&self, keys: Vec<Vec<u8>>) -> Result<Vec<NumericId>> {
        match self.request(Message::LookupRequest { keys }).await? {
            Message::LookupResponse { ids } => Ok(ids),
            other => Err(unexpected("lookup_request", &other)),
        }
    }

    /// Read a payload from a partition.
    pub async fn get(&self, partition: &CachePartitionKey, id: NumericId) -> Result<Option<Bytes>> {
        let request = Message::GetRequest {
            partition: partition.clone(),
            id,
        };
        match self.request(request).await? {
            Message::GetResponse { payload } => Ok(payload),
            other => Err(unexpected("get_request", &other)),
        }
    }

    /// Store a payload in a partition.
    pub async fn put(&self, partition: &CachePartitionKey, id: NumericId, payload: Bytes) -> Result<()> {
        let request = Message::PutRequest {
            partition: partition.clone(),
            id,
            payload,
        };
        match self.request(request).await? {
            Message::Ack => Ok(()),
            other => Err(unexpected("put_request", &other)),
        }
    }

    /// Drop a partition's store on the server.
    pub async fn delete(&self, partition: &CachePartitionKey) -> Result<()> {
        let request = Message::DeleteRequest {
            partition: partition.clone(),
        };
        match self.request(request).await? {
            Message::Ack => Ok(()),
            other => Err(unexpected("delete_request", &other)),
        }
    }

    async fn write_requests(mut writer: OwnedWriteHalf, mut out_rx: mpsc::Receiver<Vec<u8>>) {
        while let Some(framed) = out_rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &framed).await {
                warn!(error = %e, "Failed to write request, closing writer");
                break;
            }
        }
    }

    async fn read_responses(
        mut reader: OwnedReadHalf,
        max_message_size: usize,
        pending: Arc<PendingMap>,
        closed: Arc<AtomicBool>,
        metrics: Arc<CacheMetrics>,
    ) {
        loop {
            let data = match read_frame(&mut reader, max_message_size).await {
                Ok(Some(data)) => data,
                Ok(None) => {
                    debug!("Server closed the connection");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read response");
                    break;
                }
            };

            let envelope = match decode_envelope(&data) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(error = %e, "Undecodable response, dropping");
                    continue;
                }
            };

            match pending.remove(&envelope.correlation_id) {
                Some((_, tx)) => {
                    metrics.remote_responses.inc();
                    let _ = tx.send(envelope.message);
                }
                None => {
                    metrics.remote_unmatched_responses.inc();
                    warn!(
                        correlation_id = envelope.correlation_id,
                        kind = envelope.message.kind(),
                        "Response for unknown correlation id"
                    );
                }
            }
        }

        // Dropping the senders wakes every parked caller with ConnectionClosed.
        closed.store(true, Ordering::Release);
        pending.clear();
    }
}

impl std::fmt::Debug for RemoteClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteClient")
            .field("server_addr", &self.server_addr)
            .field("pending", &self.pending.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for RemoteClient {
    fn drop(&mut self) {
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

fn unexpected(request: &'static str, response: &Message) -> Error {
    NetworkError::UnexpectedResponse {
        request,
        response: response.kind(),
    }
    .into()
}
