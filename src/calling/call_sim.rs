//! Loopback call simulation — negotiates a two-party call end to end through
//! the in-memory relay with loopback engines, no devices or network needed.
//!
//! Fault injection covers the interesting signaling hazards: staged glare,
//! at-least-once redelivery, and degraded local capture.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;

use super::engine::MediaConstraints;
use super::loopback::{LoopbackEngine, LoopbackSource};
use super::media::{CallPhase, CallStatus};
use super::{CallHandle, CallSession, PeerId};
use crate::relay::LocalRelay;

#[derive(Debug, Clone)]
pub struct SimOptions {
    /// Stage both sides offering before either hears the other.
    pub glare: bool,
    /// Fail the caller's video capture to exercise audio-only degradation.
    pub no_video: bool,
    /// Deliver every relayed frame twice.
    pub duplicate_delivery: bool,
    pub timeout: Duration,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            glare: false,
            no_video: false,
            duplicate_delivery: false,
            timeout: Duration::from_secs(5),
        }
    }
}

/// Outcome of a simulated call.
#[derive(Debug)]
pub struct SimReport {
    pub connected: bool,
    pub caller_video: bool,
    pub callee_video: bool,
    pub caller_remote_media: bool,
    pub callee_remote_media: bool,
    pub caller_rollbacks: u64,
    pub callee_rollbacks: u64,
    pub media_warning: Option<String>,
    pub clean_teardown: bool,
}

/// Run a full simulated call: join, negotiate, connect, hang up.
pub async fn run_call_sim(opts: &SimOptions) -> Result<SimReport> {
    let relay = LocalRelay::new();
    relay.set_duplicate_delivery(opts.duplicate_delivery);

    let caller_id = PeerId::new("caller");
    let callee_id = PeerId::new("callee");

    let caller_engine = Arc::new(LoopbackEngine::new());
    let callee_engine = Arc::new(LoopbackEngine::new());
    let caller_source = LoopbackSource {
        fail_video: opts.no_video,
        fail_audio: false,
    };

    // Join order decides who hears about whom. Frames routed before a party
    // subscribes are replayed from the relay backlog, so the staging below is
    // deterministic.
    let caller_channel = relay.join(caller_id.clone());
    let (callee_channel, glare_staged) = if opts.glare {
        // Both learn of each other before either session runs: both offer.
        let ch = relay.join(callee_id.clone());
        relay.announce(&callee_id, &caller_id)?;
        (ch, true)
    } else {
        (relay.join(callee_id.clone()), false)
    };
    if glare_staged {
        tracing::info!("Staged glare: both parties will offer");
    }
    tracing::debug!(
        "Relay room: {} and {}",
        caller_channel.peer(),
        callee_channel.peer()
    );

    let caller = CallSession::spawn(
        Arc::new(caller_channel),
        caller_engine.clone(),
        Arc::new(caller_source),
        MediaConstraints::default(),
    )
    .await;
    let callee = CallSession::spawn(
        Arc::new(callee_channel),
        callee_engine.clone(),
        Arc::new(LoopbackSource::default()),
        MediaConstraints::default(),
    )
    .await;
    caller.start();
    callee.start();

    let mut caller_status = caller.status();
    let mut callee_status = callee.status();

    // Wait for remote media as well: the Connected edge can land before the
    // remote-track event is drained.
    let caller_connected = wait_for(
        &mut caller_status,
        opts.timeout,
        "caller connected with remote media",
        |s| s.phase == CallPhase::Connected && s.remote_media,
    )
    .await?;
    let callee_connected = wait_for(
        &mut callee_status,
        opts.timeout,
        "callee connected with remote media",
        |s| s.phase == CallPhase::Connected && s.remote_media,
    )
    .await?;

    caller.end();
    let disconnected = |s: &CallStatus| s.phase == CallPhase::Disconnected;
    let clean_teardown = wait_for(&mut caller_status, opts.timeout, "caller hangup", disconnected)
        .await
        .is_ok()
        && wait_for(&mut callee_status, opts.timeout, "callee hangup", disconnected)
            .await
            .is_ok();
    join_sessions(caller, callee).await;

    Ok(SimReport {
        connected: true,
        caller_video: caller_connected.local_tracks.video,
        callee_video: callee_connected.local_tracks.video,
        caller_remote_media: caller_connected.remote_media,
        callee_remote_media: callee_connected.remote_media,
        caller_rollbacks: caller_engine.rollback_count(),
        callee_rollbacks: callee_engine.rollback_count(),
        media_warning: caller_connected.media_error,
        clean_teardown,
    })
}

async fn wait_for(
    status: &mut watch::Receiver<CallStatus>,
    timeout: Duration,
    what: &str,
    predicate: impl FnMut(&CallStatus) -> bool,
) -> Result<CallStatus> {
    let snapshot = tokio::time::timeout(timeout, status.wait_for(predicate))
        .await
        .map_err(|_| anyhow::anyhow!("timed out waiting for {}", what))?
        .context("status channel closed")?;
    Ok(snapshot.clone())
}

async fn join_sessions(caller: CallHandle, callee: CallHandle) {
    caller.join().await;
    callee.join().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_plain_call_connects_and_tears_down() {
        let report = run_call_sim(&SimOptions::default()).await.unwrap();
        assert!(report.connected);
        assert!(report.caller_remote_media);
        assert!(report.callee_remote_media);
        assert_eq!(report.caller_rollbacks, 0);
        assert_eq!(report.callee_rollbacks, 0);
        assert!(report.clean_teardown);
        assert!(report.media_warning.is_none());
    }

    #[tokio::test]
    async fn test_glare_converges_with_one_rollback_each() {
        let report = run_call_sim(&SimOptions {
            glare: true,
            ..Default::default()
        })
        .await
        .unwrap();
        assert!(report.connected);
        assert_eq!(report.caller_rollbacks, 1);
        assert_eq!(report.callee_rollbacks, 1);
        assert!(report.clean_teardown);
    }

    #[tokio::test]
    async fn test_redelivery_does_not_break_negotiation() {
        let report = run_call_sim(&SimOptions {
            duplicate_delivery: true,
            ..Default::default()
        })
        .await
        .unwrap();
        assert!(report.connected);
        assert_eq!(report.caller_rollbacks, 0);
        assert!(report.clean_teardown);
    }

    #[tokio::test]
    async fn test_degraded_caller_connects_audio_only() {
        let report = run_call_sim(&SimOptions {
            no_video: true,
            ..Default::default()
        })
        .await
        .unwrap();
        assert!(report.connected);
        assert!(!report.caller_video);
        assert!(report.callee_video);
        assert!(report
            .media_warning
            .as_deref()
            .unwrap()
            .contains("audio-only"));
    }
}
