use std::net::SocketAddr;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info};

use crate::{error::ConnectionError, registry::Registration};

/// Upper bound on a single read.
pub const CHUNK_SIZE: usize = 1024;

/// How a handler finished serving its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum Outcome {
    #[display(fmt = "end of stream")]
    EndOfStream,
    #[display(fmt = "disconnected")]
    Disconnected,
    #[display(fmt = "failed")]
    Failed,
    #[display(fmt = "cancelled")]
    Cancelled,
}

/// Serves one client connection until it ends, fails or is cancelled.
pub struct EchoHandler<S> {
    stream: S,
    peer: SocketAddr,
}

impl<S> EchoHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, peer: SocketAddr) -> Self {
        Self { stream, peer }
    }

    /// Echoes until the connection is done, then closes it and drops the
    /// registration, on every exit path.
    pub async fn run(mut self, registration: Registration) -> Outcome {
        let outcome = tokio::select! {
            biased;

            _ = registration.cancellation().cancelled() => {
                debug!("Handler for {} cancelled", self.peer);
                Outcome::Cancelled
            }

            result = echo(&mut self.stream) => match result {
                Ok(echoed) => {
                    debug!("{} closed the stream after {} bytes", self.peer, echoed);
                    Outcome::EndOfStream
                }
                Err(err) if err.is_expected() => {
                    info!("Client {} disconnected: {}", self.peer, err);
                    Outcome::Disconnected
                }
                Err(err) => {
                    error!("Error occurred while handling connection {}: {}", self.peer, err);
                    Outcome::Failed
                }
            }
        };

        drop(self.stream);
        info!("Connection closed {} ({})", self.peer, outcome);
        drop(registration);
        outcome
    }
}

/// Writes back every chunk read from `stream` until end-of-stream and
/// returns the number of bytes echoed.
pub async fn echo<S>(stream: &mut S) -> Result<u64, ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buffer = BytesMut::with_capacity(CHUNK_SIZE);
    let mut echoed = 0;
    loop {
        buffer.clear();
        let read = (&mut *stream)
            .take(CHUNK_SIZE as u64)
            .read_buf(&mut buffer)
            .await?;
        if read == 0 {
            return Ok(echoed);
        }
        stream.write_all(&buffer).await?;
        stream.flush().await?;
        echoed += read as u64;
    }
}

#[cfg(test)]
mod handler_tests {
    use std::{io, net::SocketAddr};

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_test::io::Builder;

    use crate::{
        handler::{echo, EchoHandler, Outcome, CHUNK_SIZE},
        registry::Registry,
        test_support::LogCapture,
    };

    fn peer() -> SocketAddr {
        "127.0.0.1:5000".parse().unwrap()
    }

    #[tokio::test]
    async fn echoes_every_chunk_in_order() {
        let stream = Builder::new()
            .read(b"test ")
            .write(b"test ")
            .read(b"data")
            .write(b"data")
            .build();
        let registry = Registry::new();

        let outcome = EchoHandler::new(stream, peer())
            .run(registry.register())
            .await;

        assert_eq!(outcome, Outcome::EndOfStream);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn empty_stream_ends_without_writing() {
        // The mock panics on any write it was not scripted for.
        let stream = Builder::new().build();
        let registry = Registry::new();

        let outcome = EchoHandler::new(stream, peer())
            .run(registry.register())
            .await;

        assert_eq!(outcome, Outcome::EndOfStream);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn reset_on_read_is_a_disconnect() {
        let stream = Builder::new()
            .read_error(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "Client disconnected",
            ))
            .build();
        let registry = Registry::new();

        let outcome = EchoHandler::new(stream, peer())
            .run(registry.register())
            .await;

        assert_eq!(outcome, Outcome::Disconnected);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn broken_pipe_on_write_is_a_disconnect() {
        let stream = Builder::new()
            .read(b"ping")
            .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "pipe"))
            .build();
        let registry = Registry::new();

        let outcome = EchoHandler::new(stream, peer())
            .run(registry.register())
            .await;

        assert_eq!(outcome, Outcome::Disconnected);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn other_errors_fail_the_handler() {
        let stream = Builder::new()
            .read_error(io::Error::new(io::ErrorKind::InvalidData, "garbage"))
            .build();
        let registry = Registry::new();

        let outcome = EchoHandler::new(stream, peer())
            .run(registry.register())
            .await;

        assert_eq!(outcome, Outcome::Failed);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn cancellation_unblocks_a_pending_read_and_closes() {
        let (mut client, server) = tokio::io::duplex(64);
        let registry = Registry::new();

        let handler = tokio::spawn(EchoHandler::new(server, peer()).run(registry.register()));
        assert_eq!(registry.len(), 1);

        registry.cancel_all();

        assert_eq!(handler.await.unwrap(), Outcome::Cancelled);
        assert!(registry.is_empty());

        let mut buf = [0; 8];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn cancellation_unblocks_a_pending_write() {
        let (client, server) = tokio::io::duplex(64);
        let registry = Registry::new();

        let handler = tokio::spawn(EchoHandler::new(server, peer()).run(registry.register()));

        // The client never reads, so once it has pushed three pipe-fulls the
        // handler is parked writing the second echo.
        let writer = tokio::spawn(async move {
            let mut client = client;
            client.write_all(&[7; 192]).await.unwrap();
            client
        });
        let _client = writer.await.unwrap();
        assert_eq!(registry.len(), 1);

        registry.cancel_all();

        assert_eq!(handler.await.unwrap(), Outcome::Cancelled);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn closing_is_logged_with_the_outcome() {
        let logs = LogCapture::default();
        let _guard = tracing::subscriber::set_default(logs.subscriber());
        let registry = Registry::new();

        EchoHandler::new(Builder::new().build(), peer())
            .run(registry.register())
            .await;

        assert!(logs
            .contents()
            .contains("Connection closed 127.0.0.1:5000 (end of stream)"));
    }

    #[tokio::test]
    async fn payload_larger_than_a_chunk_comes_back_intact() {
        let (client, mut server) = tokio::io::duplex(64);
        let (mut client_read, mut client_write) = tokio::io::split(client);

        let payload: Vec<u8> = (0..CHUNK_SIZE * 5 + 17).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let writer = async move {
            for piece in payload.chunks(300) {
                client_write.write_all(piece).await.unwrap();
            }
            client_write.shutdown().await.unwrap();
        };
        let reader = async move {
            let mut received = vec![0; expected.len()];
            client_read.read_exact(&mut received).await.unwrap();
            assert_eq!(received, expected);
        };

        let (_, _, echoed) = tokio::join!(writer, reader, echo(&mut server));

        assert_eq!(echoed.unwrap(), (CHUNK_SIZE * 5 + 17) as u64);
    }
}
