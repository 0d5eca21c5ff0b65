//! Byte-stream plumbing below the session: addressing, connecting, listening, framing of the
//!  fixed-size envelopes, and the reconnect policy.

use std::fmt::{Debug, Formatter};
use std::io::ErrorKind;
use std::path::PathBuf;
use anyhow::{anyhow, bail};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tracing::{debug, info, warn};
use crate::config::IpcConfig;

pub mod framing;
pub mod reconnect;

/// Where the service process listens. The protocol only needs an ordered, reliable,
///  full-duplex byte stream, so all variants carry the same traffic.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum TransportAddr {
    /// Unix domain socket `bt:<name>` in the configured socket directory
    Local { name: String },
    /// loopback TCP
    Inet { port: u16 },
    /// rpmsg channel to another core, only available on rpmsg-capable systems
    Rpmsg { name: String, cpu: String },
}

impl TransportAddr {
    pub fn local(name: impl Into<String>) -> TransportAddr {
        TransportAddr::Local { name: name.into() }
    }

    pub fn local_path(&self, config: &IpcConfig) -> Option<PathBuf> {
        match self {
            TransportAddr::Local { name } => Some(config.local_socket_dir.join(format!("bt:{}", name))),
            _ => None,
        }
    }
}

/// A connected stream, split into independently owned halves so that a receive loop and
///  writers do not contend for one lock
pub struct IpcStream {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    pub peer: String,
}

impl Debug for IpcStream {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "IpcStream({})", self.peer)
    }
}

impl IpcStream {
    fn from_unix(stream: UnixStream, peer: String) -> IpcStream {
        let (reader, writer) = stream.into_split();
        IpcStream {
            reader: Box::new(reader),
            writer: Box::new(writer),
            peer,
        }
    }

    fn from_tcp(stream: TcpStream, peer: String) -> anyhow::Result<IpcStream> {
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(IpcStream {
            reader: Box::new(reader),
            writer: Box::new(writer),
            peer,
        })
    }
}

/// A single connection attempt, without retries
pub async fn connect(addr: &TransportAddr, config: &IpcConfig) -> anyhow::Result<IpcStream> {
    match addr {
        TransportAddr::Local { .. } => {
            let path = addr.local_path(config)
                .ok_or_else(|| anyhow!("no socket path for {:?}", addr))?;
            let stream = UnixStream::connect(&path).await?;
            Ok(IpcStream::from_unix(stream, path.display().to_string()))
        }
        TransportAddr::Inet { port } => {
            let stream = TcpStream::connect(("127.0.0.1", *port)).await?;
            let peer = stream.peer_addr()?.to_string();
            IpcStream::from_tcp(stream, peer)
        }
        TransportAddr::Rpmsg { name, cpu } => {
            bail!("rpmsg transport ({}@{}) is not supported on this platform", name, cpu)
        }
    }
}

pub enum IpcListener {
    Local { listener: UnixListener, path: PathBuf },
    Inet(TcpListener),
}

impl IpcListener {
    pub async fn bind(addr: &TransportAddr, config: &IpcConfig) -> anyhow::Result<IpcListener> {
        match addr {
            TransportAddr::Local { .. } => {
                let path = addr.local_path(config)
                    .ok_or_else(|| anyhow!("no socket path for {:?}", addr))?;
                match std::fs::remove_file(&path) {
                    Ok(()) => debug!("removed stale socket {}", path.display()),
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                let listener = UnixListener::bind(&path)?;
                info!("listening on {}", path.display());
                Ok(IpcListener::Local { listener, path })
            }
            TransportAddr::Inet { port } => {
                let listener = TcpListener::bind(("127.0.0.1", *port)).await?;
                info!("listening on {}", listener.local_addr()?);
                Ok(IpcListener::Inet(listener))
            }
            TransportAddr::Rpmsg { name, cpu } => {
                bail!("rpmsg transport ({}@{}) is not supported on this platform", name, cpu)
            }
        }
    }

    pub async fn accept(&self) -> anyhow::Result<IpcStream> {
        match self {
            IpcListener::Local { listener, path } => {
                let (stream, _) = listener.accept().await?;
                Ok(IpcStream::from_unix(stream, path.display().to_string()))
            }
            IpcListener::Inet(listener) => {
                let (stream, peer) = listener.accept().await?;
                IpcStream::from_tcp(stream, peer.to_string())
            }
        }
    }

    /// The address clients connect to; for an INET listener bound to port 0 this contains the
    ///  actual port
    pub fn local_addr(&self) -> anyhow::Result<TransportAddr> {
        match self {
            IpcListener::Local { path, .. } => {
                let name = path.file_name()
                    .and_then(|n| n.to_str())
                    .and_then(|n| n.strip_prefix("bt:"))
                    .ok_or_else(|| anyhow!("unexpected socket path {}", path.display()))?;
                Ok(TransportAddr::local(name))
            }
            IpcListener::Inet(listener) => Ok(TransportAddr::Inet { port: listener.local_addr()?.port() }),
        }
    }
}

impl Drop for IpcListener {
    fn drop(&mut self) {
        if let IpcListener::Local { path, .. } = self {
            if let Err(e) = std::fs::remove_file(path.as_path()) {
                warn!("could not remove socket {}: {}", path.display(), e);
            }
        }
    }
}
