use std::{
    future::poll_fn,
    io,
    net::SocketAddr,
    task::{Context, Poll},
};

use futures::future::join_all;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{config::ServerConfig, error::StartupError, handler::EchoHandler, registry::Registry};

const BACKLOG: i32 = 1024;

struct Running {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    accept_task: JoinHandle<TcpListener>,
}

/// Owns the listening socket and the accept loop feeding echo handlers.
pub struct Listener {
    host: String,
    port: u16,
    registry: Registry,
    running: Option<Running>,
}

impl Listener {
    pub fn new(host: impl Into<String>, port: u16) -> Listener {
        Listener {
            host: host.into(),
            port,
            registry: Registry::new(),
            running: None,
        }
    }

    pub fn from_config(config: &ServerConfig) -> Listener {
        Listener::new(config.host.clone(), config.port)
    }

    /// Address actually bound, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|running| running.local_addr)
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn active_connections(&self) -> usize {
        self.registry.len()
    }

    /// Binds the listening socket and spawns the accept loop.
    pub async fn start(&mut self) -> Result<SocketAddr, StartupError> {
        if self.running.is_some() {
            return Err(StartupError::AlreadyStarted);
        }

        let (listener, local_addr) = self.open().await.map_err(|err| {
            error!("Failed to start server: {}", err);
            err
        })?;

        info!("Server started on {}:{}", self.host, local_addr.port());

        let shutdown = CancellationToken::new();
        let span = info_span!("echo_server", addr = %local_addr);
        let accept_task = tokio::spawn(
            accept_loop(listener, self.registry.clone(), shutdown.clone()).instrument(span),
        );

        self.running = Some(Running {
            local_addr,
            shutdown,
            accept_task,
        });
        Ok(local_addr)
    }

    /// Stops accepting, cancels and waits for every handler, then closes the
    /// listening socket. Does nothing when not running.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        running.shutdown.cancel();
        let listener = match running.accept_task.await {
            Ok(listener) => Some(listener),
            Err(err) => {
                error!("Connection listener terminated abnormally: {}", err);
                None
            }
        };

        let handlers = self.registry.cancel_all();
        debug!("Waiting for {} connection(s) to close", handlers.len());
        for result in join_all(handlers).await {
            if let Err(err) = result {
                error!("Connection handler terminated abnormally: {}", err);
            }
        }

        drop(listener);
        info!("Server socket closed");
    }

    async fn open(&self) -> Result<(TcpListener, SocketAddr), StartupError> {
        let addr = resolve(&self.host, self.port).await?;
        bind(addr)
            .and_then(|listener| {
                let local_addr = listener.local_addr()?;
                Ok((listener, local_addr))
            })
            .map_err(|source| StartupError::Bind { addr, source })
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.shutdown.cancel();
            self.registry.cancel_all();
        }
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr, StartupError> {
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|source| StartupError::Resolve {
            host: host.to_string(),
            source,
        })?;
    addrs
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| StartupError::NoIpv4Address {
            host: host.to_string(),
        })
}

/// The socket is closed on every error path when it goes out of scope.
fn bind(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;
    TcpListener::from_std(socket.into())
}

/// A source of inbound connections for the accept loop.
pub trait Accept: Send + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn poll_accept(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<(Self::Stream, SocketAddr)>>;
}

impl Accept for TcpListener {
    type Stream = TcpStream;

    fn poll_accept(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<(TcpStream, SocketAddr)>> {
        TcpListener::poll_accept(self, cx)
    }
}

async fn accept_loop<A: Accept>(
    mut acceptor: A,
    registry: Registry,
    shutdown: CancellationToken,
) -> A {
    loop {
        let accepted = tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,
            accepted = poll_fn(|cx| acceptor.poll_accept(cx)) => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                info!("Connection accepted from {}", peer);
                let registration = registry.register();
                let id = registration.id();
                let span = info_span!("connection", %id, %peer);
                let task = tokio::spawn(
                    async move {
                        EchoHandler::new(stream, peer).run(registration).await;
                    }
                    .instrument(span),
                );
                registry.attach(id, task);
            }
            Err(err) if listener_is_broken(&err) => {
                error!("Error in connection listener: {}", err);
                break;
            }
            Err(err) => warn!("Failed to accept connection: {}", err),
        }
    }
    acceptor
}

#[cfg(unix)]
fn listener_is_broken(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EBADF | libc::ENOTSOCK | libc::EINVAL)
    )
}

#[cfg(not(unix))]
fn listener_is_broken(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::InvalidInput
}
