//! Per-connection liveness monitor.
//!
//! Resolves capability info over its connection, then probes the liveness
//! virtual host every `PingSecond`. The monitor is the only party that
//! closes a connection for failing liveness.

use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::capability::CapabilityCache;
use super::control;
use super::error::{ControlError, TransportError};
use super::transport::{MonitoredConnection, RoundTrip};

/// Upper bound on a single liveness probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest ping or probe period honoured; longer ones are clamped.
pub const MAX_PING_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

/// Ticker firing every `period`, first after one full period. Periods
/// above [`MAX_PING_PERIOD`] are clamped so deadlines stay representable.
pub fn ping_ticker(period: Duration) -> Interval {
    let period = period.min(MAX_PING_PERIOD);
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Why a connection failed its liveness check.
#[derive(Debug, thiserror::Error)]
pub enum LivenessFailure {
    #[error("capability info unavailable: {0}")]
    Capability(#[from] ControlError),

    #[error("liveness probe answered {0}")]
    Status(u16),

    #[error("liveness probe failed: {0}")]
    Probe(TransportError),

    #[error("liveness probe timed out")]
    Timeout,

    #[error("capability info request timed out")]
    CapabilityTimeout,
}

/// How a monitor ended.
#[derive(Debug)]
pub enum MonitorExit {
    Liveness(LivenessFailure),
    /// The connection was closed by something else.
    ConnectionClosed,
}

/// Start the monitor for a freshly established connection.
pub fn spawn_monitor<C>(conn: Arc<C>, capabilities: Arc<CapabilityCache>)
where
    C: MonitoredConnection + 'static,
{
    tokio::spawn(async move {
        run_monitor(conn.as_ref(), &capabilities, PROBE_TIMEOUT).await;
    });
}

/// Monitor `conn` until it fails liveness or closes. The connection is
/// closed on return either way.
pub async fn run_monitor<C>(
    conn: &C,
    capabilities: &CapabilityCache,
    probe_timeout: Duration,
) -> MonitorExit
where
    C: MonitoredConnection,
{
    let exit = watch(conn, capabilities, probe_timeout).await;
    match &exit {
        MonitorExit::Liveness(failure) => {
            warn!(conn_id = conn.id(), error = %failure, "Tunnel connection failed liveness check");
        }
        MonitorExit::ConnectionClosed => {
            debug!(conn_id = conn.id(), "Monitored connection closed");
        }
    }
    conn.close();
    exit
}

async fn watch<C: MonitoredConnection>(
    conn: &C,
    capabilities: &CapabilityCache,
    probe_timeout: Duration,
) -> MonitorExit {
    // A dropped resolve releases the cache lock for other monitors.
    let info = tokio::select! {
        res = tokio::time::timeout(probe_timeout, capabilities.resolve(conn)) => match res {
            Ok(Ok(info)) => info,
            Ok(Err(e)) => return MonitorExit::Liveness(e.into()),
            Err(_) => return MonitorExit::Liveness(LivenessFailure::CapabilityTimeout),
        },
        () = conn.closed() => return MonitorExit::ConnectionClosed,
    };

    let mut timer = ping_ticker(info.ping_interval());
    info!(conn_id = conn.id(), interval_secs = info.ping_second, "Keepalive monitor started");

    loop {
        tokio::select! {
            _ = timer.tick() => {
                if let Err(failure) = probe(conn, probe_timeout).await {
                    return MonitorExit::Liveness(failure);
                }
            }
            () = conn.closed() => return MonitorExit::ConnectionClosed,
        }
    }
}

async fn probe<R: RoundTrip>(conn: &R, probe_timeout: Duration) -> Result<(), LivenessFailure> {
    match tokio::time::timeout(probe_timeout, conn.round_trip(control::liveness_request())).await {
        Err(_) => Err(LivenessFailure::Timeout),
        Ok(Err(e)) => Err(LivenessFailure::Probe(e)),
        Ok(Ok(resp)) if resp.status != StatusCode::OK => {
            Err(LivenessFailure::Status(resp.status.as_u16()))
        }
        Ok(Ok(_)) => Ok(()),
    }
}

#[cfg(test)]
#[path = "keepalive_tests.rs"]
mod tests;
