//! Reconciliation of the local element with server time: initial apply,
//! periodic sync, discrete seeks and server-driven corrections.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::{
    media::{next_matching, race_timeout, MediaEvent, PlayRejection, Race},
    protocol::{CorrectionAction, SeekUpdate, SyncCorrection, SyncUpdate},
    session::{AppliedState, MutationGuard, PlayOutcome, PlaybackSession, PlaybackState},
};

const LOG_TAG: &str = "[Drift]";

/// What a `sync` reconciliation measured and did
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncReport {
    pub drift: f64,
    pub threshold: f64,
    pub reseeked: bool,
}

/// Seek and wait for the element to confirm, or give up after `timeout`.
/// Returns whether the seek was confirmed.
async fn seek_and_settle(session: &PlaybackSession, time: f64, timeout: Duration) -> bool {
    let mut events = session.subscribe();
    session.media().set_current_time(time);
    let seeked = next_matching(&mut events, |e| *e == MediaEvent::Seeked);
    match race_timeout(seeked, timeout).await {
        Race::Event(Some(_)) => true,
        _ => {
            debug!("{LOG_TAG} seek to {time:.2}s not confirmed within {timeout:?}");
            false
        }
    }
}

/// Play under `guard` and move the state machine to match the outcome
async fn play_and_reconcile(session: &PlaybackSession, guard: &MutationGuard<'_>) {
    match session.play_guarded(guard).await {
        PlayOutcome::Started => session.set_state(PlaybackState::Playing),
        PlayOutcome::Rejected(PlayRejection::NotAllowed) => session.enter_waiting_interaction(),
        PlayOutcome::Rejected(rejection) => {
            warn!("{LOG_TAG} play failed: {rejection:?}");
            session.set_state(PlaybackState::Ready);
        }
        PlayOutcome::Superseded => {}
    }
}

/// Join/late-join: jump to the server position, then start or stop playback
pub async fn apply_state(session: &PlaybackSession, target: AppliedState) {
    let guard = session.lock_mutation();
    info!(
        "{LOG_TAG} applying state {:.2}s playing={}",
        target.current_time, target.is_playing
    );

    seek_and_settle(session, target.current_time, session.config().seek_settle_timeout).await;

    if target.is_playing {
        play_and_reconcile(session, &guard).await;
    } else {
        session.media().pause();
        session.set_state(PlaybackState::Ready);
    }
    session.record_applied(target);
}

/// Periodic reconciliation. Returns `None` when the message was ignored.
pub async fn handle_sync(session: &PlaybackSession, update: &SyncUpdate) -> Option<SyncReport> {
    let state = session.state();
    if matches!(state, PlaybackState::Loading | PlaybackState::Idle) {
        debug!("{LOG_TAG} ignoring sync while {state}");
        return None;
    }

    let forced = session.take_forced_sync() || update.forced;
    let threshold = session.config().threshold(forced);
    let guard = session.lock_mutation();

    let drift = (session.media().current_time() - update.current_time).abs();
    let reseeked = drift > threshold;
    let applied = AppliedState {
        current_time: update.current_time,
        is_playing: update.is_playing,
    };

    if state == PlaybackState::WaitingInteraction {
        session.media().set_current_time(update.current_time);
        session.record_applied(applied);
        return Some(SyncReport {
            drift,
            threshold,
            reseeked,
        });
    }

    if reseeked {
        debug!("{LOG_TAG} drift {drift:.3}s over {threshold}s, reseeking");
        seek_and_settle(session, update.current_time, session.config().seek_settle_timeout).await;
    }

    if update.is_playing {
        if session.media().is_paused() {
            play_and_reconcile(session, &guard).await;
        } else {
            session.set_state(PlaybackState::Playing);
        }
    } else {
        if !session.media().is_paused() {
            session.media().pause();
        }
        session.set_state(PlaybackState::Ready);
    }
    session.record_applied(applied);

    Some(SyncReport {
        drift,
        threshold,
        reseeked,
    })
}

/// Discrete remote seek. Returns false when ignored.
pub async fn handle_seek(session: &PlaybackSession, seek: &SeekUpdate) -> bool {
    let state = session.state();
    if matches!(state, PlaybackState::Loading | PlaybackState::Idle) {
        debug!("{LOG_TAG} ignoring seek while {state}");
        return false;
    }

    let _guard = session.lock_mutation();
    debug!(
        "{LOG_TAG} remote seek to {:.2}s by {}",
        seek.current_time,
        seek.triggered_by.as_deref().unwrap_or("server")
    );
    if state == PlaybackState::WaitingInteraction {
        session.media().set_current_time(seek.current_time);
    } else {
        seek_and_settle(session, seek.current_time, session.config().seek_settle_timeout).await;
    }
    session.record_applied(AppliedState {
        current_time: seek.current_time,
        is_playing: state == PlaybackState::Playing,
    });
    true
}

/// Server-driven correction; only applies while Playing. Returns false when
/// ignored.
pub async fn handle_sync_correction(session: &PlaybackSession, correction: &SyncCorrection) -> bool {
    if session.state() != PlaybackState::Playing {
        return false;
    }

    match correction.action {
        CorrectionAction::Rate => {
            let rate = correction.rate.filter(|r| *r > 0.0).unwrap_or(1.0);
            let _guard = session.lock_mutation();
            let media = session.media();
            if (media.playback_rate() - rate).abs() > session.config().rate_epsilon {
                debug!("{LOG_TAG} playback rate -> {rate}");
                media.set_playback_rate(rate);
            }
            true
        }
        CorrectionAction::Buffer => {
            let Some(target) = correction.target_time else {
                warn!("{LOG_TAG} buffer correction without a target time");
                return false;
            };
            let guard = session.lock_mutation();
            info!(
                "{LOG_TAG} hard correction to {target:.2}s (drift {:.2}s)",
                correction.drift.unwrap_or_default()
            );

            session.media().pause();
            seek_and_settle(session, target, session.config().buffer_seek_timeout).await;
            play_and_reconcile(session, &guard).await;
            session.media().set_playback_rate(1.0);
            session.record_applied(AppliedState {
                current_time: target,
                is_playing: true,
            });
            true
        }
    }
}
