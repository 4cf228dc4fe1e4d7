//! Debounced UDP delivery.
//!
//! One pending timer per sender. Every `send` replaces the pending message
//! and restarts the quiet period; only the message current when the timer
//! expires goes out, as a single datagram.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{lookup_host, UdpSocket};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Convert a configured delay in seconds. Negative or non-finite values mean
/// no delay.
pub fn delay_from_secs(seconds: f64) -> Duration {
    Duration::try_from_secs_f64(seconds).unwrap_or(Duration::ZERO)
}

pub struct DelayedUdpSender {
    runtime: Handle,
    delay: Mutex<Duration>,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl DelayedUdpSender {
    pub fn new(delay: Duration, runtime: Handle) -> Self {
        Self {
            runtime,
            delay: Mutex::new(delay),
            pending: Mutex::new(None),
        }
    }

    pub fn delay(&self) -> Duration {
        *lock(&self.delay)
    }

    /// Takes effect for the next `send`.
    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = delay;
    }

    /// Queue `payload` for `host:port`, superseding any message still waiting.
    pub fn send(&self, host: String, port: u16, payload: Vec<u8>) {
        let delay = self.delay();
        let runtime = self.runtime.clone();

        let mut pending = lock(&self.pending);
        if let Some(previous) = pending.take() {
            if !previous.is_finished() {
                debug!("pending notification superseded");
            }
            previous.abort();
        }

        *pending = Some(self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            // Once the quiet period is over the send can no longer be superseded.
            runtime.spawn(async move {
                match send_datagram(&host, port, &payload).await {
                    Ok(sent) => info!(host = %host, port, bytes = sent, "notification sent"),
                    Err(e) => warn!(host = %host, port, error = %format!("{:#}", e), "failed to send notification"),
                }
            });
        }));
    }
}

impl Drop for DelayedUdpSender {
    fn drop(&mut self) {
        if let Some(pending) = lock(&self.pending).take() {
            pending.abort();
        }
    }
}

/// Resolve `host` and send one datagram from an ephemeral socket of the
/// matching address family.
pub async fn send_datagram(host: &str, port: u16, payload: &[u8]) -> Result<usize> {
    let target = lookup_host((host, port))
        .await
        .with_context(|| format!("failed to resolve {}:{}", host, port))?
        .next()
        .with_context(|| format!("no address for {}:{}", host, port))?;

    let bind: SocketAddr = if target.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };

    let socket = UdpSocket::bind(bind)
        .await
        .with_context(|| format!("failed to bind UDP socket on {}", bind))?;
    socket
        .send_to(payload, target)
        .await
        .with_context(|| format!("failed to send datagram to {}", target))
}
