//! Default durations and an async timeout wrapper.

use std::future::Future;
use std::time::Duration;

use crate::error::{ProtocolError, Result};

/// Wait for an acknowledge response before resending
pub const ACK_TIMEOUT: Duration = Duration::from_millis(1000);

/// Tick of the acknowledge retry loop
pub const RETRY_TICK: Duration = Duration::from_millis(100);

/// Client heartbeat period
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Server drops peers that stayed silent this long
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(15);

/// Period of the server heartbeat sweep
pub const HEARTBEAT_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Bound for the acknowledged disconnect handshake
pub const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Run a fallible future, mapping an elapsed deadline to [`ProtocolError::Timeout`].
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| ProtocolError::Timeout)?
}
