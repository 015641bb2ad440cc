//! Connection configuration and builders
//!
//! [`ClientBuilder`] and [`ServerBuilder`] follow the same shape: start from
//! defaults, override what you need, then hand over an established
//! transport.

use super::client::ClientConn;
use super::error::{Error, ErrorCode, Result};
use super::scheduler::{PrioritySchedulerConfig, PriorityWriteScheduler, RandomWriteScheduler, WriteScheduler};
use super::server::{Handler, ServerConn, ServerHandle};
use super::settings::Settings;
use super::DEFAULT_MAX_FRAME_SIZE;
use crate::transport::Transport;
use rand::Rng;
use std::time::Duration;

/// Default receive window per stream on the client (4 MiB)
const CLIENT_STREAM_WINDOW: u32 = 4 << 20;

/// Default connection receive window on the client (1 GiB)
const CLIENT_CONN_WINDOW: u32 = 1 << 30;

/// Default header list limit on the client (10 MiB)
const CLIENT_MAX_HEADER_LIST_SIZE: u32 = 10 << 20;

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Per-stream receive window we advertise
    pub initial_window_size: u32,
    /// Connection receive window we open up to right after the preface
    pub conn_window_size: u32,
    /// Largest frame we accept
    pub max_read_frame_size: u32,
    pub max_header_list_size: u32,
    /// Concurrency assumed before the peer's SETTINGS arrive
    pub initial_max_concurrent_streams: u32,
    /// Concurrency assumed when the peer does not limit it
    pub default_max_concurrent_streams: u32,
    /// Give up waiting for response headers after this long
    pub response_header_timeout: Option<Duration>,
    /// Send a PING after this long without any inbound frame
    pub read_idle_timeout: Option<Duration>,
    /// How long a health-check PING may stay unanswered
    pub ping_timeout: Duration,
    /// Close the connection after this long without streams
    pub idle_timeout: Option<Duration>,
    /// Stream reset codes after which the connection is not reused
    pub do_not_reuse_codes: Vec<ErrorCode>,
    /// Largest DATA payload written per frame when sending bodies
    pub max_body_chunk: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            initial_window_size: CLIENT_STREAM_WINDOW,
            conn_window_size: CLIENT_CONN_WINDOW,
            max_read_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_header_list_size: CLIENT_MAX_HEADER_LIST_SIZE,
            initial_max_concurrent_streams: 100,
            default_max_concurrent_streams: 1000,
            response_header_timeout: None,
            read_idle_timeout: None,
            ping_timeout: Duration::from_secs(15),
            idle_timeout: None,
            do_not_reuse_codes: vec![
                ErrorCode::ProtocolError,
                ErrorCode::InternalError,
                ErrorCode::FlowControlError,
                ErrorCode::CompressionError,
            ],
            max_body_chunk: 16 << 10,
        }
    }
}

impl ClientConfig {
    /// SETTINGS sent right after the preface
    pub fn local_settings(&self) -> Settings {
        Settings {
            enable_push: Some(false),
            initial_window_size: Some(self.initial_window_size),
            max_frame_size: Some(self.max_read_frame_size),
            max_header_list_size: Some(self.max_header_list_size),
            ..Settings::default()
        }
    }
}

/// Builder for client connections
#[derive(Debug, Clone, Default)]
pub struct ClientBuilder {
    config: ClientConfig,
}

impl ClientBuilder {
    /// Create a new client builder
    pub fn new() -> Self {
        ClientBuilder::default()
    }

    /// Set the per-stream receive window
    pub fn initial_window_size(mut self, size: u32) -> Self {
        self.config.initial_window_size = size;
        self
    }

    /// Set the connection receive window
    pub fn conn_window_size(mut self, size: u32) -> Self {
        self.config.conn_window_size = size;
        self
    }

    /// Set the largest accepted frame payload
    pub fn max_read_frame_size(mut self, size: u32) -> Self {
        self.config.max_read_frame_size = size;
        self
    }

    /// Set max header list size
    pub fn max_header_list_size(mut self, size: u32) -> Self {
        self.config.max_header_list_size = size;
        self
    }

    pub fn response_header_timeout(mut self, timeout: Duration) -> Self {
        self.config.response_header_timeout = Some(timeout);
        self
    }

    /// Enable health checks: PING after `idle` without traffic
    pub fn read_idle_timeout(mut self, idle: Duration) -> Self {
        self.config.read_idle_timeout = Some(idle);
        self
    }

    pub fn ping_timeout(mut self, timeout: Duration) -> Self {
        self.config.ping_timeout = timeout;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = Some(timeout);
        self
    }

    /// Replace the set of reset codes that retire the connection
    pub fn do_not_reuse_codes(mut self, codes: Vec<ErrorCode>) -> Self {
        self.config.do_not_reuse_codes = codes;
        self
    }

    pub fn max_body_chunk(mut self, size: usize) -> Self {
        self.config.max_body_chunk = size.max(1);
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Validate the configuration
    pub fn build(self) -> Result<ClientConfig> {
        self.config
            .local_settings()
            .validate()
            .map_err(|e| Error::InvalidSettings(e.reason))?;
        if self.config.conn_window_size > i32::MAX as u32 {
            return Err(Error::InvalidSettings("connection window exceeds 2^31-1".into()));
        }
        Ok(self.config)
    }

    /// Perform the client handshake over an established transport
    pub fn handshake<T: Transport>(self, transport: T) -> Result<ClientConn> {
        let config = self.build()?;
        ClientConn::handshake(transport, config)
    }
}

/// Write scheduling strategy for server connections
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerKind {
    Priority(PrioritySchedulerConfig),
    Random,
}

impl Default for SchedulerKind {
    fn default() -> Self {
        SchedulerKind::Priority(PrioritySchedulerConfig::default())
    }
}

impl SchedulerKind {
    pub(crate) fn build(self) -> Box<dyn WriteScheduler> {
        match self {
            SchedulerKind::Priority(config) => Box::new(PriorityWriteScheduler::new(config)),
            SchedulerKind::Random => Box::new(RandomWriteScheduler::new()),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub max_concurrent_streams: u32,
    /// Per-stream receive window we advertise
    pub initial_window_size: u32,
    /// Connection receive window we open up to after the preface
    pub conn_window_size: u32,
    pub max_read_frame_size: u32,
    pub max_header_list_size: u32,
    /// Time allowed for the client preface and first SETTINGS
    pub preface_timeout: Duration,
    /// Close the connection after this long without streams
    pub idle_timeout: Option<Duration>,
    /// Send a PING after this long without any inbound frame
    pub read_idle_timeout: Option<Duration>,
    pub ping_timeout: Duration,
    /// Upper bound on a graceful shutdown's drain phase
    pub graceful_timeout: Duration,
    /// Delay between an error GOAWAY and closing the transport
    pub abrupt_close_delay: Duration,
    /// Control frames queued beyond this are treated as a flood
    pub max_queued_control_frames: usize,
    pub scheduler: SchedulerKind,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            max_concurrent_streams: 250,
            initial_window_size: 1 << 20,
            conn_window_size: 1 << 20,
            max_read_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_header_list_size: 1 << 20,
            preface_timeout: Duration::from_secs(10),
            idle_timeout: None,
            read_idle_timeout: None,
            ping_timeout: Duration::from_secs(15),
            graceful_timeout: Duration::from_secs(30),
            abrupt_close_delay: Duration::from_secs(1),
            max_queued_control_frames: 10_000,
            scheduler: SchedulerKind::default(),
        }
    }
}

impl ServerConfig {
    /// SETTINGS sent when the connection starts
    pub fn local_settings(&self) -> Settings {
        Settings {
            max_concurrent_streams: Some(self.max_concurrent_streams),
            initial_window_size: Some(self.initial_window_size),
            max_frame_size: Some(self.max_read_frame_size),
            max_header_list_size: Some(self.max_header_list_size),
            ..Settings::default()
        }
    }
}

/// Builder for server connections
#[derive(Debug, Clone, Default)]
pub struct ServerBuilder {
    config: ServerConfig,
}

impl ServerBuilder {
    /// Create a new server builder
    pub fn new() -> Self {
        ServerBuilder::default()
    }

    /// Set max concurrent streams
    pub fn max_concurrent_streams(mut self, max: u32) -> Self {
        self.config.max_concurrent_streams = max;
        self
    }

    /// Set the per-stream receive window
    pub fn initial_window_size(mut self, size: u32) -> Self {
        self.config.initial_window_size = size;
        self
    }

    /// Set the connection receive window
    pub fn conn_window_size(mut self, size: u32) -> Self {
        self.config.conn_window_size = size;
        self
    }

    pub fn max_read_frame_size(mut self, size: u32) -> Self {
        self.config.max_read_frame_size = size;
        self
    }

    pub fn max_header_list_size(mut self, size: u32) -> Self {
        self.config.max_header_list_size = size;
        self
    }

    pub fn preface_timeout(mut self, timeout: Duration) -> Self {
        self.config.preface_timeout = timeout;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = Some(timeout);
        self
    }

    pub fn read_idle_timeout(mut self, idle: Duration) -> Self {
        self.config.read_idle_timeout = Some(idle);
        self
    }

    pub fn ping_timeout(mut self, timeout: Duration) -> Self {
        self.config.ping_timeout = timeout;
        self
    }

    pub fn graceful_timeout(mut self, timeout: Duration) -> Self {
        self.config.graceful_timeout = timeout;
        self
    }

    pub fn abrupt_close_delay(mut self, delay: Duration) -> Self {
        self.config.abrupt_close_delay = delay;
        self
    }

    pub fn max_queued_control_frames(mut self, max: usize) -> Self {
        self.config.max_queued_control_frames = max;
        self
    }

    pub fn scheduler(mut self, kind: SchedulerKind) -> Self {
        self.config.scheduler = kind;
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Validate and return the configuration
    pub fn into_config(self) -> Result<ServerConfig> {
        let settings = self.config.local_settings();
        settings
            .validate()
            .map_err(|e| Error::InvalidSettings(e.reason))?;
        if self.config.conn_window_size > i32::MAX as u32 {
            return Err(Error::InvalidSettings("connection window exceeds 2^31-1".into()));
        }
        Ok(self.config)
    }

    /// Wrap an accepted transport
    ///
    /// Nothing is read or written until [`ServerConn::serve`] runs.
    pub fn build<T, H>(self, transport: T, handler: H) -> Result<(ServerConn<T>, ServerHandle)>
    where
        T: Transport,
        H: Handler,
    {
        let config = self.into_config()?;
        ServerConn::new(transport, handler, config)
    }
}

/// Backoff policy for replaying unprocessed requests
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Random extra delay as a fraction of the backoff
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 6,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// No delay between attempts
    pub fn immediate(max_retries: u32) -> Self {
        RetryPolicy {
            max_retries,
            base_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            jitter: 0.0,
        }
    }

    /// Delay before retry number `retry` (1-based): 2^(retry-1) times the
    /// base, capped, plus up to `jitter` of that
    pub fn backoff(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let exp = 1u32.checked_shl(retry - 1).unwrap_or(u32::MAX);
        let backoff = self
            .base_backoff
            .checked_mul(exp)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff);
        if self.jitter <= 0.0 || backoff.is_zero() {
            return backoff;
        }
        let extra = rand::thread_rng().gen_range(0.0..=self.jitter);
        backoff + backoff.mul_f64(extra)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::h2::settings::SettingsBuilder;

    #[test]
    fn test_client_builder() {
        let config = ClientBuilder::new()
            .initial_window_size(65535)
            .idle_timeout(Duration::from_secs(5))
            .build()
            .unwrap();

        let settings = config.local_settings();
        assert_eq!(settings.header_table_size, None);
        assert_eq!(settings.enable_push, Some(false));
        assert_eq!(settings.initial_window_size, Some(65535));
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_client_builder_rejects_bad_frame_size() {
        let err = ClientBuilder::new().max_read_frame_size(1024).build().unwrap_err();
        assert!(matches!(err, Error::InvalidSettings(_)));
    }

    #[test]
    fn test_server_defaults() {
        let config = ServerBuilder::new().into_config().unwrap();
        assert_eq!(config.max_concurrent_streams, 250);
        assert_eq!(config.max_queued_control_frames, 10_000);
        assert_eq!(config.local_settings().max_concurrent_streams, Some(250));
        assert!(matches!(config.scheduler, SchedulerKind::Priority(_)));
    }

    #[test]
    fn test_default_do_not_reuse_codes() {
        let config = ClientConfig::default();
        assert!(config.do_not_reuse_codes.contains(&ErrorCode::ProtocolError));
        assert!(!config.do_not_reuse_codes.contains(&ErrorCode::Cancel));
        assert!(!config.do_not_reuse_codes.contains(&ErrorCode::RefusedStream));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(4), Duration::from_secs(8));
        assert_eq!(policy.backoff(10), Duration::from_secs(30));
        assert_eq!(policy.backoff(40), Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_jitter_bounded() {
        let policy = RetryPolicy::default();
        for _ in 0..50 {
            let d = policy.backoff(3);
            assert!(d >= Duration::from_secs(4));
            assert!(d <= Duration::from_millis(4400));
        }
    }

    #[test]
    fn test_settings_builder_still_validates() {
        assert!(SettingsBuilder::new().initial_window_size(u32::MAX).build().is_err());
    }
}
