//! Liveness probing shared by space sessions and the user-scoped managers.

use bytes::Bytes;
use spacecast_protocol::{codec, Envelope, EnvelopeType};
use spacecast_transport::{Connection, FrameKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, trace};

/// Arm the read deadline and push it forward on every liveness reply.
pub(crate) fn refresh_on_pong(conn: &Arc<dyn Connection>, pong_wait: Duration) {
    conn.set_read_deadline(Some(Instant::now() + pong_wait));

    // Weak, the connection owns its own handler
    let weak = Arc::downgrade(conn);
    conn.set_liveness_handler(Arc::new(move || {
        if let Some(conn) = weak.upgrade() {
            conn.set_read_deadline(Some(Instant::now() + pong_wait));
        }
    }));
}

/// A ticker firing every `period`, starting one period from now.
pub(crate) fn ticker(period: Duration) -> time::Interval {
    let mut interval = time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    interval
}

/// Send a transport-level ping every `ping_period` until a write fails.
pub(crate) fn spawn_heartbeat(
    conn: Arc<dyn Connection>,
    ping_period: Duration,
    write_wait: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = ticker(ping_period);
        loop {
            interval.tick().await;
            if !conn.is_open() {
                break;
            }

            conn.set_write_deadline(Some(Instant::now() + write_wait));
            if let Err(e) = conn.write_frame(FrameKind::Ping, Bytes::new()).await {
                debug!(connection = %conn.id(), error = %e, "Liveness probe failed");
                break;
            }
        }
        trace!(connection = %conn.id(), "Heartbeat stopped");
    })
}

/// Read until the connection fails, discarding data.
///
/// Used by connections that only receive server pushes. Application-level
/// `ping` envelopes are answered with `pong`; everything else is ignored.
pub(crate) async fn watch_until_closed(
    conn: &Arc<dyn Connection>,
    pong_wait: Duration,
    write_wait: Duration,
) {
    refresh_on_pong(conn, pong_wait);

    loop {
        let frame = match conn.read_frame().await {
            Ok(frame) => frame,
            Err(e) => {
                debug!(connection = %conn.id(), error = %e, "Connection ended");
                break;
            }
        };

        match codec::decode(&frame.data) {
            Ok(envelope) if envelope.kind == EnvelopeType::Ping => {
                let Ok(pong) = codec::encode(&Envelope::pong("", "")) else {
                    continue;
                };
                conn.set_write_deadline(Some(Instant::now() + write_wait));
                if conn.write_frame(FrameKind::Text, pong).await.is_err() {
                    break;
                }
            }
            Ok(envelope) if envelope.kind == EnvelopeType::Pong => {
                conn.set_read_deadline(Some(Instant::now() + pong_wait));
            }
            _ => trace!(connection = %conn.id(), "Ignoring inbound frame"),
        }
    }
}
