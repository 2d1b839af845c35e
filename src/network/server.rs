//! TCP server for the remote cache protocol.

use crate::error::{NetworkError, Result};
use crate::network::rpc::{
    decode_envelope, frame_envelope, peek_correlation_id, read_frame, write_frame, Envelope,
    Message,
};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Responses queued per connection before request handlers wait.
const OUTGOING_QUEUE_DEPTH: usize = 256;

/// Handler for incoming messages.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle an incoming request and produce its response.
    async fn handle(&self, msg: Message) -> Message;
}

/// TCP server dispatching framed requests to a [`MessageHandler`].
pub struct NetworkServer {
    /// Address to bind to.
    bind_addr: SocketAddr,

    /// Message handler.
    handler: Arc<dyn MessageHandler>,

    /// Largest accepted frame.
    max_message_size: usize,

    /// Shutdown signal receiver.
    shutdown_rx: mpsc::Receiver<()>,
}

impl NetworkServer {
    /// Create a new network server.
    pub fn new(
        bind_addr: SocketAddr,
        handler: Arc<dyn MessageHandler>,
    ) -> (Self, mpsc::Sender<()>) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let server = Self {
            bind_addr,
            handler,
            max_message_size: crate::config::DEFAULT_MAX_MESSAGE_SIZE,
            shutdown_rx,
        };

        (server, shutdown_tx)
    }

    /// Set the largest accepted frame.
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Bind and serve until a shutdown signal arrives.
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .map_err(NetworkError::Io)?;
        self.serve(listener).await
    }

    /// Serve on an already-bound listener until a shutdown signal arrives.
    pub async fn serve(mut self, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr().map_err(NetworkError::Io)?;
        info!(addr = %local_addr, "Cache server listening");

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            debug!(peer = %peer_addr, "Accepted connection");
                            let handler = self.handler.clone();
                            let max_message_size = self.max_message_size;
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, handler, max_message_size).await {
                                    debug!(peer = %peer_addr, error = %e, "Connection handler error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = self.shutdown_rx.recv() => {
                    info!("Cache server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn handle_connection(
        stream: TcpStream,
        handler: Arc<dyn MessageHandler>,
        max_message_size: usize,
    ) -> Result<()> {
        let (mut reader, writer) = stream.into_split();
        let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(OUTGOING_QUEUE_DEPTH);
        let writer_task = tokio::spawn(Self::write_responses(writer, out_rx));

        while let Some(data) = read_frame(&mut reader, max_message_size).await? {
            let (correlation_id, request) = match decode_envelope(&data) {
                Ok(envelope) => (envelope.correlation_id, Some(envelope.message)),
                Err(e) => match peek_correlation_id(&data) {
                    Some(correlation_id) => {
                        warn!(correlation_id, error = %e, "Undecodable request, answering with empty ack");
                        (correlation_id, None)
                    }
                    None => {
                        warn!(len = data.len(), "Request too short to carry a correlation id, dropping");
                        continue;
                    }
                },
            };

            // Requests run concurrently; responses go out in completion order.
            let handler = handler.clone();
            let out_tx = out_tx.clone();
            tokio::spawn(async move {
                let response = match request {
                    Some(message) => handler.handle(message).await,
                    None => Message::Ack,
                };
                match frame_envelope(&Envelope::new(correlation_id, response)) {
                    Ok(framed) => {
                        if out_tx.send(framed).await.is_err() {
                            debug!(correlation_id, "Connection closed before response was sent");
                        }
                    }
                    Err(e) => error!(correlation_id, error = %e, "Failed to encode response"),
                }
            });
        }

        // Writer exits once every in-flight request has released its sender.
        drop(out_tx);
        let _ = writer_task.await;
        Ok(())
    }

    async fn write_responses(mut writer: OwnedWriteHalf, mut out_rx: mpsc::Receiver<Vec<u8>>) {
        while let Some(framed) = out_rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &framed).await {
                debug!(error = %e, "Failed to write response");
                break;
            }
        }
    }
}
