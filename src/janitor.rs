//! Periodic reaping and stats logging.
//!
//! A single interval-driven task, generalized from the teacher's on-demand
//! cache-occupancy reporting (`CacheStats`-style methods scattered through
//! `variable_versions`) into a standing background sweep: flow tables don't
//! get queried for their size, they get reported on a clock.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::fragment::FragmentReassembler;
use crate::tcp::TcpEngine;
use crate::udp::UdpEngine;

/// How often the janitor wakes up to sweep and report.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Runs the janitor loop until `shutdown` is cancelled.
pub async fn run(
    tcp: Arc<TcpEngine>,
    udp: Arc<UdpEngine>,
    fragments: Arc<tokio::sync::Mutex<FragmentReassembler>>,
    shutdown: tokio_util::sync::CancellationToken,
) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                fragments.lock().await.sweep_expired();
                let tcp_flows = tcp.live_flow_count().await;
                let udp_flows = udp.live_flow_count().await;
                info!(
                    tcp_flows,
                    udp_flows,
                    "janitor sweep"
                );
            }
        }
    }
}
