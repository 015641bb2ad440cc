//! Transport abstraction
//!
//! The engine runs over any ordered, reliable, already-handshaken byte
//! stream. A transport must be cloneable into independent read and write
//! halves (one reader thread, one writer role) and must support an
//! out-of-band shutdown so that a blocked reader can be woken when the
//! connection is torn down.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};

/// Transport operations trait
///
/// Implemented for `TcpStream`. TLS sessions or in-memory pipes can
/// implement it the same way: `try_clone` must return a handle onto the same
/// underlying connection, and `shutdown` must unblock pending reads on every
/// clone.
pub trait Transport: Read + Write + Send + 'static {
    /// Create another handle onto the same connection
    fn try_clone(&self) -> io::Result<Self>
    where
        Self: Sized;

    /// Close both directions of the connection
    fn shutdown(&self) -> io::Result<()>;
}

impl Transport for TcpStream {
    fn try_clone(&self) -> io::Result<Self> {
        TcpStream::try_clone(self)
    }

    fn shutdown(&self) -> io::Result<()> {
        match TcpStream::shutdown(self, Shutdown::Both) {
            // Already closed by the peer.
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

/// Split a transport into a reader, a writer and a closer handle
pub(crate) fn split<T: Transport>(transport: T) -> io::Result<(T, T, T)> {
    let reader = transport.try_clone()?;
    let closer = transport.try_clone()?;
    Ok((reader, transport, closer))
}
