//! Request bodies and the retry seam
//!
//! A request can be attempted again only when it provably never reached the
//! peer's application (see [`Error::is_retryable_unstarted`]) and its body
//! can be produced a second time. [`RetryingClient`] applies that rule on
//! top of any [`ConnectionSource`], which is where an external connection
//! pool plugs in.

use super::cancel::CancelToken;
use super::client::{ClientConn, Request, Response};
use super::config::RetryPolicy;
use super::error::{Error, Result};
use bytes::Bytes;
use crossbeam_channel::{after, never, select};
use std::fmt;
use std::io::{self, Read};
use std::sync::Arc;
use std::time::Duration;

/// Produces a fresh reader over the same body content
pub type Rewind = Arc<dyn Fn() -> io::Result<Box<dyn Read + Send>> + Send + Sync>;

/// Request body
pub enum Body {
    /// No body; HEADERS carries END_STREAM
    Empty,
    /// In-memory body, replayable for free
    Bytes(Bytes),
    /// One-shot reader; a request carrying it is retried only if the
    /// reader was never touched
    Reader(Box<dyn Read + Send>),
    /// Body that can be regenerated for every attempt
    Rewindable(Rewind),
}

impl Body {
    pub fn from_reader<R: Read + Send + 'static>(reader: R) -> Body {
        Body::Reader(Box::new(reader))
    }

    pub fn rewindable<F>(make: F) -> Body
    where
        F: Fn() -> io::Result<Box<dyn Read + Send>> + Send + Sync + 'static,
    {
        Body::Rewindable(Arc::new(make))
    }

    /// True when there is nothing to send
    pub fn is_empty(&self) -> bool {
        match self {
            Body::Empty => true,
            Body::Bytes(bytes) => bytes.is_empty(),
            _ => false,
        }
    }

    /// Length when known up front
    pub fn len(&self) -> Option<u64> {
        match self {
            Body::Empty => Some(0),
            Body::Bytes(bytes) => Some(bytes.len() as u64),
            _ => None,
        }
    }

    /// Another copy of this body for a new attempt
    pub fn try_clone(&self) -> Option<Body> {
        match self {
            Body::Empty => Some(Body::Empty),
            Body::Bytes(bytes) => Some(Body::Bytes(bytes.clone())),
            Body::Reader(_) => None,
            Body::Rewindable(make) => Some(Body::Rewindable(make.clone())),
        }
    }

    pub(crate) fn into_source(self) -> io::Result<BodySource> {
        Ok(match self {
            Body::Empty => BodySource::Bytes(Bytes::new()),
            Body::Bytes(bytes) => BodySource::Bytes(bytes),
            Body::Reader(reader) => BodySource::Reader(reader),
            Body::Rewindable(make) => BodySource::Reader(make()?),
        })
    }
}

impl Default for Body {
    fn default() -> Self {
        Body::Empty
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => f.write_str("Body::Empty"),
            Body::Bytes(bytes) => write!(f, "Body::Bytes({} bytes)", bytes.len()),
            Body::Reader(_) => f.write_str("Body::Reader"),
            Body::Rewindable(_) => f.write_str("Body::Rewindable"),
        }
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Body::Bytes(bytes)
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Body::Bytes(Bytes::from(bytes))
    }
}

impl From<&'static [u8]> for Body {
    fn from(bytes: &'static [u8]) -> Self {
        Body::Bytes(Bytes::from_static(bytes))
    }
}

impl From<&'static str> for Body {
    fn from(text: &'static str) -> Self {
        Body::Bytes(Bytes::from_static(text.as_bytes()))
    }
}

impl From<String> for Body {
    fn from(text: String) -> Self {
        Body::Bytes(Bytes::from(text))
    }
}

/// Chunked view of a body while it is being sent
pub(crate) enum BodySource {
    Bytes(Bytes),
    Reader(Box<dyn Read + Send>),
}

impl BodySource {
    /// Next chunk of at most `max` bytes and whether the body ends with it
    pub(crate) fn next_chunk(&mut self, max: usize) -> io::Result<(Bytes, bool)> {
        match self {
            BodySource::Bytes(bytes) => {
                let chunk = bytes.split_to(bytes.len().min(max));
                Ok((chunk, bytes.is_empty()))
            }
            BodySource::Reader(reader) => {
                let mut buf = vec![0u8; max];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => return Ok((Bytes::new(), true)),
                        Ok(n) => {
                            buf.truncate(n);
                            return Ok((Bytes::from(buf), false));
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }
}

/// Where [`RetryingClient`] gets connections from
///
/// Implemented by connection pools. `get` must return a connection that
/// currently accepts new requests; `mark_dead` is called when a connection
/// failed or stopped accepting requests so the pool can drop it.
pub trait ConnectionSource: Send + Sync {
    fn get(&self) -> Result<ClientConn>;

    fn mark_dead(&self, _conn: &ClientConn) {}
}

impl<F> ConnectionSource for F
where
    F: Fn() -> Result<ClientConn> + Send + Sync,
{
    fn get(&self) -> Result<ClientConn> {
        self()
    }
}

/// Re-submits requests that failed without reaching the peer
pub struct RetryingClient<S: ConnectionSource> {
    source: S,
    policy: RetryPolicy,
}

impl<S: ConnectionSource> RetryingClient<S> {
    pub fn new(source: S, policy: RetryPolicy) -> Self {
        RetryingClient { source, policy }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Send a request, retrying clean refusals
    ///
    /// The first retry is immediate; later ones back off per the policy.
    /// A request whose body was already consumed and cannot be rewound is
    /// never retried.
    pub fn round_trip(&self, request: Request) -> Result<Response> {
        let cancel = request.cancel.clone();
        let mut request = request;
        let mut retry = 0u32;

        loop {
            let conn = self.source.get()?;
            let template = request.try_clone();

            let failure = match conn.try_round_trip(request) {
                Ok(response) => return Ok(response),
                Err(failure) => failure,
            };
            if !conn.can_take_new_request() {
                self.source.mark_dead(&conn);
            }

            let error = failure.error;
            if !error.is_retryable_unstarted() || retry >= self.policy.max_retries {
                return Err(error);
            }
            request = match failure.request.or(template) {
                Some(request) => request,
                None => {
                    tracing::debug!(%error, "not retrying: request body already consumed");
                    return Err(error);
                }
            };

            tracing::debug!(%error, retry, "retrying request");
            if retry > 0 {
                self.sleep(self.policy.backoff(retry), cancel.as_ref())?;
            }
            retry += 1;
        }
    }

    fn sleep(&self, delay: Duration, cancel: Option<&CancelToken>) -> Result<()> {
        if delay.is_zero() {
            return Ok(());
        }
        let (cancelled, _guard) = match cancel {
            Some(token) => {
                let (rx, guard) = token.channel();
                (rx, Some(guard))
            }
            None => (never(), None),
        };
        select! {
            recv(cancelled) -> _ => Err(Error::Canceled),
            recv(after(delay)) -> _ => Ok(()),
        }
    }
}
