//! Blocking in-memory body buffer
//!
//! The connection's read loop writes DATA payloads into a [`Pipe`]; an
//! application thread reads them out. Closing the pipe with an error wakes a
//! blocked reader, which is how stream resets and connection loss interrupt
//! body reads.

use super::error::{Error, Result};
use bytes::{Buf, BytesMut};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Instant;

#[derive(Default)]
struct State {
    buf: BytesMut,
    /// Set once the writer is finished; `None` inside means clean EOF
    closed: Option<Option<Error>>,
    /// Error returned immediately, discarding buffered data
    broken: Option<Error>,
    /// Reader no longer wants data
    reader_gone: bool,
}

/// Single-producer, single-consumer byte pipe
#[derive(Clone, Default)]
pub struct Pipe {
    inner: Arc<(Mutex<State>, Condvar)>,
}

impl Pipe {
    pub fn new() -> Self {
        Pipe::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        match self.inner.0.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Append data
    ///
    /// Fails once the pipe has been closed from either end; the caller
    /// still owns the flow-control credit for rejected data.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        let mut state = self.lock();
        if state.closed.is_some() || state.broken.is_some() || state.reader_gone {
            return Err(Error::ConnectionClosed);
        }
        state.buf.extend_from_slice(data);
        self.inner.1.notify_all();
        Ok(())
    }

    /// Mark end of data; readers see EOF after draining
    pub fn close(&self) {
        self.close_inner(None);
    }

    /// Readers see `err` after draining buffered data
    pub fn close_with_error(&self, err: Error) {
        self.close_inner(Some(err));
    }

    fn close_inner(&self, err: Option<Error>) {
        let mut state = self.lock();
        if state.closed.is_none() {
            state.closed = Some(err);
        }
        self.inner.1.notify_all();
    }

    /// Fail readers immediately, dropping anything buffered
    ///
    /// Returns the number of discarded bytes.
    pub fn break_with_error(&self, err: Error) -> usize {
        let mut state = self.lock();
        let dropped = state.buf.len();
        state.buf.clear();
        if state.broken.is_none() {
            state.broken = Some(err);
        }
        self.inner.1.notify_all();
        dropped
    }

    /// Reader is done; later writes are refused
    ///
    /// Returns the number of discarded bytes.
    pub fn close_reader(&self) -> usize {
        let mut state = self.lock();
        state.reader_gone = true;
        let dropped = state.buf.len();
        state.buf.clear();
        dropped
    }

    /// Bytes waiting to be read
    pub fn buffered(&self) -> usize {
        self.lock().buf.len()
    }

    /// True once the writer closed the pipe cleanly and everything was read
    pub fn is_eof(&self) -> bool {
        let state = self.lock();
        state.buf.is_empty() && matches!(state.closed, Some(None))
    }

    /// Blocking read; `Ok(0)` is EOF
    pub fn read(&self, out: &mut [u8]) -> Result<usize> {
        self.read_deadline(out, None)
    }

    /// Blocking read bounded by an optional deadline
    pub fn read_deadline(&self, out: &mut [u8], deadline: Option<Instant>) -> Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        let mut state = self.lock();
        loop {
            if let Some(err) = &state.broken {
                return Err(err.clone());
            }
            if !state.buf.is_empty() {
                let n = out.len().min(state.buf.len());
                out[..n].copy_from_slice(&state.buf[..n]);
                state.buf.advance(n);
                return Ok(n);
            }
            match &state.closed {
                Some(None) => return Ok(0),
                Some(Some(err)) => return Err(err.clone()),
                None => {}
            }
            state = match deadline {
                None => match self.inner.1.wait(state) {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                },
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::Timeout("body read"));
                    }
                    match self.inner.1.wait_timeout(state, deadline - now) {
                        Ok((guard, _)) => guard,
                        Err(poisoned) => poisoned.into_inner().0,
                    }
                }
            };
        }
    }
}
