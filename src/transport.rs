//! Stream-endpoint plumbing: binds/dials TCP or a Unix domain socket
//! (spec §4.4 "Listening", §6.3 `path` overriding `host`/`port`).

use crate::config::Endpoint;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};

/// A duplex byte stream, TCP or Unix — erased so the rest of the crate
/// doesn't need to be generic over transport.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

pub async fn connect(endpoint: &Endpoint) -> std::io::Result<Box<dyn Transport>> {
    match endpoint {
        Endpoint::Tcp { host, port } => {
            let stream = TcpStream::connect((host.as_str(), *port)).await?;
            stream.set_nodelay(true).ok();
            Ok(Box::new(stream))
        }
        Endpoint::Ipc { path } => {
            let stream = UnixStream::connect(path).await?;
            Ok(Box::new(stream))
        }
    }
}

/// A bound listening endpoint.
pub enum Listener {
    Tcp(TcpListener),
    Ipc(UnixListener),
}

impl Listener {
    pub async fn bind(endpoint: &Endpoint) -> std::io::Result<Listener> {
        match endpoint {
            Endpoint::Tcp { host, port } => {
                let listener = TcpListener::bind((host.as_str(), *port)).await?;
                Ok(Listener::Tcp(listener))
            }
            Endpoint::Ipc { path } => {
                prepare_local_endpoint(path)?;
                let listener = UnixListener::bind(path)?;
                Ok(Listener::Ipc(listener))
            }
        }
    }

    pub async fn accept(&self) -> std::io::Result<Box<dyn Transport>> {
        match self {
            Listener::Tcp(l) => {
                let (stream, _addr) = l.accept().await?;
                stream.set_nodelay(true).ok();
                Ok(Box::new(stream))
            }
            Listener::Ipc(l) => {
                let (stream, _addr) = l.accept().await?;
                Ok(Box::new(stream))
            }
        }
    }
}

/// Ensure the parent directory exists and remove any stale socket file
/// at `path` before binding (spec §4.4 "Listening").
fn prepare_local_endpoint(path: &str) -> std::io::Result<()> {
    let path = Path::new(path);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    Ok(())
}
