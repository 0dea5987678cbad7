//! Socket listeners
//!
//! Each listener is a tokio task bound to an [`Endpoint`]. Connections are
//! served one at a time by the listener's routine; the next client is
//! accepted when the current one disconnects. Closing a listener wakes both
//! the accept loop and the routine of the connection being served.

pub mod control;
pub mod stream;

use crate::settings::Settings;
use stat_shared::SampleBuffer;
use std::fmt;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum IoError {
    #[error("invalid endpoint {endpoint:?}: {reason}")]
    Endpoint {
        endpoint: String,
        reason: &'static str,
    },

    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },
}

/// Where a listener binds or a client connects
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp { host: String, port: u16 },
}

impl Endpoint {
    /// Parse `unix://path`, `tcp://host:port`, or a bare path (unix)
    pub fn parse(value: &str) -> Result<Self, IoError> {
        let invalid = |reason| IoError::Endpoint {
            endpoint: value.to_string(),
            reason,
        };

        if let Some(address) = value.strip_prefix("tcp://") {
            let (host, port) = address
                .rsplit_once(':')
                .ok_or_else(|| invalid("missing port"))?;
            if host.is_empty() {
                return Err(invalid("missing host"));
            }
            let port = port.parse().map_err(|_| invalid("invalid port"))?;

            return Ok(Endpoint::Tcp {
                host: host.to_string(),
                port,
            });
        }

        let path = value.strip_prefix("unix://").unwrap_or(value);
        if path.is_empty() {
            return Err(invalid("empty socket path"));
        }

        Ok(Endpoint::Unix(PathBuf::from(path)))
    }

    /// Open a client connection
    pub async fn connect(&self) -> io::Result<Connection> {
        match self {
            Endpoint::Unix(path) => UnixStream::connect(path).await.map(Connection::Unix),
            Endpoint::Tcp { host, port } => TcpStream::connect((host.as_str(), *port))
                .await
                .map(Connection::Tcp),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
            Endpoint::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
        }
    }
}

/// A connected socket of either family
pub enum Connection {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Unix(s) => Pin::new(s).poll_read(cx, buf),
            Connection::Tcp(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Connection::Unix(s) => Pin::new(s).poll_write(cx, buf),
            Connection::Tcp(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Unix(s) => Pin::new(s).poll_flush(cx),
            Connection::Tcp(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Unix(s) => Pin::new(s).poll_shutdown(cx),
            Connection::Tcp(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

enum Listener {
    Unix(UnixListener),
    Tcp(TcpListener),
}

impl Listener {
    /// Bind, returning the endpoint actually bound (port 0 resolved)
    async fn bind(endpoint: &Endpoint) -> Result<(Self, Endpoint), IoError> {
        let failed = |source| IoError::Bind {
            endpoint: endpoint.clone(),
            source,
        };

        match endpoint {
            Endpoint::Unix(path) => {
                if let Ok(metadata) = std::fs::symlink_metadata(path) {
                    if !metadata.file_type().is_socket() {
                        return Err(failed(io::Error::new(
                            io::ErrorKind::AlreadyExists,
                            "path exists and is not a socket",
                        )));
                    }
                    debug!("Removing stale socket {}", path.display());
                    std::fs::remove_file(path).map_err(failed)?;
                }
                let listener = UnixListener::bind(path).map_err(failed)?;
                Ok((Listener::Unix(listener), endpoint.clone()))
            }
            Endpoint::Tcp { host, port } => {
                let listener = TcpListener::bind((host.as_str(), *port))
                    .await
                    .map_err(failed)?;
                let bound = listener.local_addr().map_err(failed)?;
                Ok((
                    Listener::Tcp(listener),
                    Endpoint::Tcp {
                        host: host.clone(),
                        port: bound.port(),
                    },
                ))
            }
        }
    }

    async fn accept(&self) -> io::Result<Connection> {
        match self {
            Listener::Unix(l) => l.accept().await.map(|(s, _)| Connection::Unix(s)),
            Listener::Tcp(l) => l.accept().await.map(|(s, _)| Connection::Tcp(s)),
        }
    }
}

/// What a listener does with each connection
#[derive(Clone)]
pub enum Routine {
    /// Write samples as JSON lines until the client or listener goes away
    Stream {
        buffer: Arc<SampleBuffer>,
        settings: Arc<Settings>,
    },

    /// Apply control messages to the settings
    Control { settings: Arc<Settings> },
}

impl Routine {
    fn name(&self) -> &'static str {
        match self {
            Routine::Stream { .. } => "stream",
            Routine::Control { .. } => "control",
        }
    }

    async fn serve(&self, connection: Connection, closed: watch::Receiver<bool>) -> io::Result<()> {
        match self {
            Routine::Stream { buffer, settings } => {
                stream::serve(connection, buffer, settings, closed).await
            }
            Routine::Control { settings } => control::serve(connection, settings, closed).await,
        }
    }
}

/// A running listener
pub struct IoServer {
    endpoint: Endpoint,
    closed: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl IoServer {
    /// Bind `endpoint` and start serving connections with `routine`
    pub async fn spawn(endpoint: &Endpoint, routine: Routine) -> Result<Self, IoError> {
        let (listener, bound) = Listener::bind(endpoint).await?;
        let (closed, receiver) = watch::channel(false);

        info!("{} listener bound to {}", routine.name(), bound);

        let task = tokio::spawn(accept_loop(listener, routine, receiver));

        Ok(Self {
            endpoint: bound,
            closed,
            task,
        })
    }

    /// The bound endpoint, with any ephemeral port resolved
    pub fn local_endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Close the listener and wait for its task to finish
    pub async fn shutdown(self) {
        self.closed.send_replace(true);

        if let Err(e) = self.task.await {
            warn!("Listener task for {} failed: {}", self.endpoint, e);
        }

        if let Endpoint::Unix(path) = &self.endpoint {
            if let Err(e) = std::fs::remove_file(path) {
                debug!("Could not remove socket {}: {}", path.display(), e);
            }
        }

        debug!("Listener {} closed", self.endpoint);
    }
}

async fn accept_loop(listener: Listener, routine: Routine, mut closed: watch::Receiver<bool>) {
    loop {
        if *closed.borrow() {
            break;
        }

        let accepted = tokio::select! {
            changed = closed.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok(connection) => {
                debug!("{} client connected", routine.name());
                if let Err(e) = routine.serve(connection, closed.clone()).await {
                    debug!("{} client dropped: {}", routine.name(), e);
                }
            }
            Err(e) => {
                warn!("{} accept failed: {}", routine.name(), e);
                tokio::select! {
                    _ = closed.changed() => {}
                    _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                }
            }
        }
    }
}
