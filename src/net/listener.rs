//! Listener bootstrap.
//!
//! # Responsibilities
//! - Resolve a [`BindConfig`] into a concrete listening socket
//! - Apply socket options (SO_REUSEADDR, best-effort TCP_CORK)
//! - Remove stale UNIX socket files before binding
//! - Attach the TLS context in tcp mode
//!
//! # Design Decisions
//! - Backlog is fixed at 10 pending connections
//! - No retry: a failed bind is an operator configuration error
//! - Sockets are created close-on-exec, so a re-exec never leaks them

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpSocket, UnixListener, UnixSocket};

use crate::config::{BindConfig, BindMode, BindTarget, TlsConfig};
use crate::net::tls::{build_server_config, TlsError};

/// Pending connection queue length.
pub const LISTEN_BACKLOG: u32 = 10;

/// Error type for listener bootstrap.
#[derive(Debug, thiserror::Error)]
pub enum BindError {
    /// The addressing scheme for the selected mode is not populated.
    #[error("bind configuration incomplete for {0:?} mode")]
    Incomplete(BindMode),
    /// Host could not be resolved to an address of the expected family.
    #[error("could not resolve {host}: {source}")]
    Resolve { host: String, source: io::Error },
    /// Socket creation or option failure.
    #[error("could not create socket: {0}")]
    Socket(#[source] io::Error),
    /// The bind call failed.
    #[error("could not bind to {target}: {source}")]
    Bind { target: String, source: io::Error },
    /// The listen call failed.
    #[error("could not listen: {0}")]
    Listen(#[source] io::Error),
    /// The TLS context could not be built.
    #[error(transparent)]
    Tls(#[from] TlsError),
}

/// A bound listening socket, ready to be served.
pub enum Listener {
    Tcp {
        inner: TcpListener,
        tls: Option<Arc<rustls::ServerConfig>>,
    },
    Unix {
        inner: UnixListener,
        path: PathBuf,
    },
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Listener::Tcp { inner, tls } => f
                .debug_struct("Tcp")
                .field("local_addr", &inner.local_addr().ok())
                .field("tls", &tls.is_some())
                .finish(),
            Listener::Unix { path, .. } => f.debug_struct("Unix").field("path", path).finish(),
        }
    }
}

impl Listener {
    /// Bind according to `bind`, wrapping with TLS when enabled in tcp mode.
    pub fn bind(bind: &BindConfig, tls: &TlsConfig) -> Result<Self, BindError> {
        let target = bind.target().ok_or(BindError::Incomplete(bind.mode))?;

        match target {
            BindTarget::Unix(path) => {
                if tls.enable {
                    tracing::warn!("TLS is only supported in tcp mode, ignoring");
                }
                let inner = bind_unix(&path)?;
                tracing::info!(path = %path.display(), "Listener bound");
                Ok(Listener::Unix { inner, path })
            }
            BindTarget::Tcp { host, port } => {
                let addr = resolve(&host, port)?;
                tracing::info!("Binding to [{}]:{}", host, port);
                let inner = bind_tcp(addr, bind.tcp_cork)?;

                let tls = if tls.enable {
                    let config = build_server_config(tls)?;
                    tracing::info!("TLS enabled");
                    Some(config)
                } else {
                    None
                };

                Ok(Listener::Tcp { inner, tls })
            }
        }
    }

    /// Local TCP address, if this is a TCP listener.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Listener::Tcp { inner, .. } => inner.local_addr().ok(),
            Listener::Unix { .. } => None,
        }
    }

    /// Socket file path, if this is a UNIX listener.
    pub fn socket_path(&self) -> Option<&Path> {
        match self {
            Listener::Unix { path, .. } => Some(path),
            Listener::Tcp { .. } => None,
        }
    }

    /// Whether connections are TLS-wrapped.
    pub fn is_tls(&self) -> bool {
        matches!(self, Listener::Tcp { tls: Some(_), .. })
    }
}

/// Resolve `host` choosing the address family by the presence of a colon.
pub fn resolve(host: &str, port: u16) -> Result<SocketAddr, BindError> {
    let want_v6 = host.contains(':');
    let literal = host.trim_start_matches('[').trim_end_matches(']');

    if let Ok(ip) = literal.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    let resolve_err = |source| BindError::Resolve {
        host: host.to_string(),
        source,
    };
    (literal, port)
        .to_socket_addrs()
        .map_err(resolve_err)?
        .find(|addr| addr.is_ipv6() == want_v6)
        .ok_or_else(|| {
            resolve_err(io::Error::new(
                io::ErrorKind::NotFound,
                "no address of the expected family",
            ))
        })
}

/// Bind a TCP listener with SO_REUSEADDR and a best-effort TCP_CORK.
pub fn bind_tcp(addr: SocketAddr, cork: bool) -> Result<TcpListener, BindError> {
    let socket = if addr.is_ipv6() {
        TcpSocket::new_v6()
    } else {
        TcpSocket::new_v4()
    }
    .map_err(BindError::Socket)?;

    if cork {
        if let Err(e) = set_tcp_cork(socket.as_raw_fd()) {
            tracing::warn!(error = %e, "Could not set TCP_CORK");
        }
    }

    socket.set_reuseaddr(true).map_err(BindError::Socket)?;
    socket.bind(addr).map_err(|source| BindError::Bind {
        target: addr.to_string(),
        source,
    })?;
    socket.listen(LISTEN_BACKLOG).map_err(BindError::Listen)
}

/// Bind a UNIX listener, removing a stale socket file first.
pub fn bind_unix(path: &Path) -> Result<UnixListener, BindError> {
    let bind_err = |source| BindError::Bind {
        target: path.display().to_string(),
        source,
    };

    if path.symlink_metadata().is_ok() {
        tracing::debug!(path = %path.display(), "Removing stale socket");
        std::fs::remove_file(path).map_err(bind_err)?;
    }

    let socket = UnixSocket::new_stream().map_err(BindError::Socket)?;
    socket.bind(path).map_err(bind_err)?;
    socket.listen(LISTEN_BACKLOG).map_err(BindError::Listen)
}

#[cfg(target_os = "linux")]
fn set_tcp_cork(fd: RawFd) -> io::Result<()> {
    let value: libc::c_int = 1;
    // SAFETY: `fd` is a live socket owned by the caller and `value` outlives the call.
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_CORK,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(target_os = "linux"))]
fn set_tcp_cork(_fd: RawFd) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "TCP_CORK is not available on this platform",
    ))
}
