//! Blocking waits for a TCP port to open or close.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::poll::Deadline;

/// Port used for SSH reachability checks.
pub const SSH_PORT: u16 = 22;

/// Port the control-plane API server listens on.
pub const STATE_SERVER_PORT: u16 = 17070;

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const MIN_CONNECT_TIMEOUT: Duration = Duration::from_millis(50);

/// State a caller waits for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PortState {
    /// A TCP connection succeeds.
    Open,
    /// A TCP connection fails.
    Closed,
}

/// Raised when a port does not reach the requested state in time.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("timed out waiting for port {port} on {host}")]
pub struct PortTimeoutError {
    /// Host that was checked.
    pub host: String,
    /// Port that was checked.
    pub port: u16,
}

/// Future returned by [`PortCheck::is_open`].
pub type CheckFuture<'a> = Pin<Box<dyn Future<Output = bool> + Send + 'a>>;

/// Single connection attempt against a host and port.
pub trait PortCheck: Send + Sync {
    /// Returns `true` when a connection succeeds within `limit`.
    fn is_open<'a>(&'a self, host: &'a str, port: u16, limit: Duration) -> CheckFuture<'a>;
}

/// Check that opens a real TCP connection.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpCheck;

impl PortCheck for TcpCheck {
    fn is_open<'a>(&'a self, host: &'a str, port: u16, limit: Duration) -> CheckFuture<'a> {
        Box::pin(async move {
            matches!(
                timeout(limit, TcpStream::connect((host, port))).await,
                Ok(Ok(_))
            )
        })
    }
}

/// Repeatedly checks a port until it reaches the requested state.
#[derive(Clone, Debug)]
pub struct PortWaiter<P = TcpCheck> {
    check: P,
    poll_interval: Duration,
    connect_timeout: Duration,
}

impl PortWaiter<TcpCheck> {
    /// Creates a waiter that checks with real TCP connections.
    #[must_use]
    pub const fn tcp() -> Self {
        Self::new(TcpCheck)
    }
}

impl<P: PortCheck> PortWaiter<P> {
    /// Creates a waiter around `check` with the default pacing.
    #[must_use]
    pub const fn new(check: P) -> Self {
        Self {
            check,
            poll_interval: POLL_INTERVAL,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    /// Overrides the delay between checks.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Overrides the per-check connection timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, limit: Duration) -> Self {
        self.connect_timeout = limit;
        self
    }

    /// Waits until `host:port` is in `state`, probing once per interval.
    ///
    /// # Errors
    ///
    /// Returns [`PortTimeoutError`] when `limit` elapses first.
    pub async fn wait_for_port(
        &self,
        host: &str,
        port: u16,
        limit: Duration,
        state: PortState,
    ) -> Result<(), PortTimeoutError> {
        let mut deadline = Deadline::new(limit, self.poll_interval);
        while let Some(remaining) = deadline.tick().await {
            let attempt = self
                .connect_timeout
                .min(remaining)
                .max(MIN_CONNECT_TIMEOUT);
            let open = self.check.is_open(host, port, attempt).await;
            if open == (state == PortState::Open) {
                return Ok(());
            }
        }

        Err(PortTimeoutError {
            host: host.to_owned(),
            port,
        })
    }
}
