use std::{fmt, sync::Arc};

use parking_lot::Mutex;
use tokio::{sync::broadcast, task::JoinHandle, time};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    config::SyncConfig,
    error::MediaLoadError,
    loader::MediaFormat,
    media::{
        race_timeout, EngineFactory, MediaElement, MediaEvent, MediaEventSink, PlayRejection,
        Race, StreamingEngine,
    },
    transport::HeartbeatSource,
};

const LOG_TAG: &str = "[Playback]";

/// Player states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Loading,
    WaitingInteraction,
    Ready,
    Playing,
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Loading => "loading",
            Self::WaitingInteraction => "waiting_interaction",
            Self::Ready => "ready",
            Self::Playing => "playing",
        };
        f.write_str(name)
    }
}

/// Outward notifications for locally initiated player actions. The
/// orchestrator implements this and turns each call into a transport send.
pub trait PlayerNotifier: Send + Sync {
    fn on_play(&self, time: f64);

    fn on_pause(&self, time: f64);

    fn on_seek(&self, time: f64);

    fn on_buffer_start(&self);

    fn on_buffer_end(&self);

    /// Periodic state request while waiting for a user gesture
    fn on_sync_request(&self);

    fn on_interaction_required(&self) {}

    fn on_interaction_complete(&self, _outcome: &Result<(), PlayRejection>) {}
}

/// Identity of the source currently loaded into the element
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedSource {
    pub url: String,
    pub format: MediaFormat,
    pub title: String,
}

/// Last server time/flag pair applied to the element
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AppliedState {
    pub current_time: f64,
    pub is_playing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PlayOutcome {
    Started,
    Rejected(PlayRejection),
    /// A newer mutation began while this play was pending
    Superseded,
}

/// The local playback session: media handle, loaded source, streaming
/// engine, state and mutation lock. One per room.
pub struct PlaybackSession {
    id: Uuid,
    config: Arc<SyncConfig>,
    media: Arc<dyn MediaElement>,
    engines: Arc<dyn EngineFactory>,
    notifier: Arc<dyn PlayerNotifier>,
    events: broadcast::Sender<MediaEvent>,
    inner: Mutex<SessionInner>,
}

struct SessionInner {
    state: PlaybackState,
    lock_depth: u32,
    generation: u64,
    loading: bool,
    source: Option<LoadedSource>,
    engine: Option<Arc<dyn StreamingEngine>>,
    last_applied: Option<AppliedState>,
    sync_poll: Option<JoinHandle<()>>,
    force_next_sync: bool,
}

enum Outbound {
    Play(f64),
    Pause(f64),
    Seek(f64),
    BufferStart,
    BufferEnd,
}

impl PlaybackSession {
    pub fn new(
        media: Arc<dyn MediaElement>,
        engines: Arc<dyn EngineFactory>,
        notifier: Arc<dyn PlayerNotifier>,
        config: Arc<SyncConfig>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        let session = Arc::new(Self {
            id: Uuid::new_v4(),
            config,
            media,
            engines,
            notifier,
            events,
            inner: Mutex::new(SessionInner {
                state: PlaybackState::Idle,
                lock_depth: 0,
                generation: 0,
                loading: false,
                source: None,
                engine: None,
                last_applied: None,
                sync_poll: None,
                force_next_sync: false,
            }),
        });
        session
            .media
            .bind(MediaEventSink::new(Arc::downgrade(&session)));
        session
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn media(&self) -> &dyn MediaElement {
        self.media.as_ref()
    }

    pub(crate) fn engines(&self) -> &dyn EngineFactory {
        self.engines.as_ref()
    }

    pub fn state(&self) -> PlaybackState {
        self.inner.lock().state
    }

    /// True while a remote-driven mutation is in progress
    pub fn is_locked(&self) -> bool {
        self.inner.lock().lock_depth > 0
    }

    pub fn loaded_source(&self) -> Option<LoadedSource> {
        self.inner.lock().source.clone()
    }

    pub fn last_applied(&self) -> Option<AppliedState> {
        self.inner.lock().last_applied
    }

    pub fn has_engine(&self) -> bool {
        self.inner.lock().engine.is_some()
    }

    pub fn is_sync_polling(&self) -> bool {
        self.inner.lock().sync_poll.is_some()
    }

    /// Subscribe to every media event, guarded or not
    pub fn subscribe(&self) -> broadcast::Receiver<MediaEvent> {
        self.events.subscribe()
    }

    /// Entry point for the host media element. Publishes the event to
    /// internal waiters, then decides whether it counts as local user intent.
    pub fn media_event(&self, event: MediaEvent) {
        let _ = self.events.send(event.clone());

        let ended = self.media.is_ended();
        let time = self.media.current_time();

        let outbound = {
            let mut inner = self.inner.lock();
            if inner.lock_depth > 0 {
                debug!("{LOG_TAG} {} suppressed {event:?} during remote mutation", self.id);
                return;
            }
            match (&event, inner.state) {
                (MediaEvent::Play, PlaybackState::Ready) => {
                    inner.transition(PlaybackState::Playing);
                    Some(Outbound::Play(time))
                }
                (MediaEvent::Pause, PlaybackState::Playing) if !ended => {
                    inner.transition(PlaybackState::Ready);
                    Some(Outbound::Pause(time))
                }
                (MediaEvent::Seeked, PlaybackState::Ready | PlaybackState::Playing) => {
                    Some(Outbound::Seek(time))
                }
                (MediaEvent::Waiting, PlaybackState::Playing) => Some(Outbound::BufferStart),
                (MediaEvent::Playing, PlaybackState::Playing) => Some(Outbound::BufferEnd),
                _ => None,
            }
        };

        match outbound {
            Some(Outbound::Play(t)) => self.notifier.on_play(t),
            Some(Outbound::Pause(t)) => self.notifier.on_pause(t),
            Some(Outbound::Seek(t)) => self.notifier.on_seek(t),
            Some(Outbound::BufferStart) => self.notifier.on_buffer_start(),
            Some(Outbound::BufferEnd) => self.notifier.on_buffer_end(),
            None => {}
        }
    }

    /// Take the mutation lock for the lifetime of the returned guard
    pub fn lock_mutation(&self) -> MutationGuard<'_> {
        let mut inner = self.inner.lock();
        inner.lock_depth += 1;
        inner.generation += 1;
        MutationGuard {
            session: self,
            generation: inner.generation,
        }
    }

    /// Explicit reconciliation transition; callers hold the mutation lock
    pub(crate) fn set_state(&self, to: PlaybackState) {
        let poll = {
            let mut inner = self.inner.lock();
            inner.transition(to)
        };
        if let Some(poll) = poll {
            poll.abort();
        }
    }

    pub(crate) fn record_applied(&self, applied: AppliedState) {
        self.inner.lock().last_applied = Some(applied);
    }

    /// One-shot flag asking the next `sync` for the tight threshold
    pub(crate) fn take_forced_sync(&self) -> bool {
        std::mem::take(&mut self.inner.lock().force_next_sync)
    }

    /// Play with the configured timeout. The outcome is reported as
    /// superseded when `guard` is no longer the newest mutation.
    pub(crate) async fn play_guarded(&self, guard: &MutationGuard<'_>) -> PlayOutcome {
        let result = self.safe_play().await;
        if !guard.is_current() {
            debug!("{LOG_TAG} {} ignoring stale play completion", self.id);
            return PlayOutcome::Superseded;
        }
        match result {
            Ok(()) => PlayOutcome::Started,
            Err(rejection) => PlayOutcome::Rejected(rejection),
        }
    }

    async fn safe_play(&self) -> Result<(), PlayRejection> {
        match race_timeout(self.media.play(), self.config.play_timeout).await {
            Race::Event(result) => result,
            Race::TimedOut => Err(PlayRejection::Timeout),
        }
    }

    /// Autoplay was refused: park in WaitingInteraction and poll the server
    /// for state until the user acts.
    pub(crate) fn enter_waiting_interaction(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.state == PlaybackState::WaitingInteraction {
                return;
            }
            inner.transition(PlaybackState::WaitingInteraction);

            let notifier = Arc::clone(&self.notifier);
            let period = self.config.interaction_sync_poll;
            let previous = inner.sync_poll.replace(tokio::spawn(async move {
                let mut ticker = time::interval_at(time::Instant::now() + period, period);
                loop {
                    ticker.tick().await;
                    notifier.on_sync_request();
                }
            }));
            if let Some(previous) = previous {
                previous.abort();
            }
        }
        info!("{LOG_TAG} {} autoplay blocked, waiting for user interaction", self.id);
        self.notifier.on_interaction_required();
    }

    /// First user gesture after autoplay was refused. Returns `None` when the
    /// session was not waiting for one.
    pub async fn user_gesture(&self) -> Option<Result<(), PlayRejection>> {
        if self.state() != PlaybackState::WaitingInteraction {
            return None;
        }
        self.stop_sync_poll();

        let guard = self.lock_mutation();
        let outcome = self.safe_play().await;
        if guard.is_current() {
            match &outcome {
                Ok(()) => {
                    self.set_state(PlaybackState::Playing);
                    self.inner.lock().force_next_sync = true;
                }
                Err(rejection) => {
                    warn!("{LOG_TAG} {} play after gesture failed: {rejection:?}", self.id);
                    self.set_state(PlaybackState::Ready);
                }
            }
        }
        drop(guard);

        self.notifier.on_interaction_complete(&outcome);
        Some(outcome)
    }

    fn stop_sync_poll(&self) {
        let poll = self.inner.lock().sync_poll.take();
        if let Some(poll) = poll {
            poll.abort();
        }
    }

    /// Mark a load as started. Fails if one is already in flight.
    pub(crate) fn begin_load(&self) -> Result<LoadTicket<'_>, MediaLoadError> {
        let poll = {
            let mut inner = self.inner.lock();
            if inner.loading {
                return Err(MediaLoadError::InFlight);
            }
            inner.loading = true;
            inner.transition(PlaybackState::Loading)
        };
        if let Some(poll) = poll {
            poll.abort();
        }
        Ok(LoadTicket { session: self })
    }

    pub(crate) fn finish_load(&self, source: Option<LoadedSource>) {
        let poll = {
            let mut inner = self.inner.lock();
            match source {
                Some(source) => {
                    info!(
                        "{LOG_TAG} {} loaded {} ({})",
                        self.id, source.url, source.format
                    );
                    inner.source = Some(source);
                    inner.transition(PlaybackState::Ready)
                }
                None => inner.transition(PlaybackState::Idle),
            }
        };
        if let Some(poll) = poll {
            poll.abort();
        }
    }

    /// Install a new engine instance, destroying the previous one first
    pub(crate) fn install_engine(&self, engine: Arc<dyn StreamingEngine>) {
        self.destroy_engine();
        self.inner.lock().engine = Some(engine);
    }

    pub(crate) fn destroy_engine(&self) {
        let previous = self.inner.lock().engine.take();
        if let Some(engine) = previous {
            engine.destroy();
        }
    }
}

impl SessionInner {
    /// Apply a transition and hand back the sync poll if leaving
    /// WaitingInteraction, so the caller can stop it outside the lock.
    fn transition(&mut self, to: PlaybackState) -> Option<JoinHandle<()>> {
        if self.state == to {
            return None;
        }
        debug!("{LOG_TAG} state {} -> {}", self.state, to);
        let leaving_wait = self.state == PlaybackState::WaitingInteraction;
        self.state = to;
        if leaving_wait {
            self.sync_poll.take()
        } else {
            None
        }
    }
}

impl HeartbeatSource for PlaybackSession {
    fn heartbeat_time(&self) -> Option<f64> {
        (self.state() == PlaybackState::Playing).then(|| self.media.current_time())
    }
}

impl Drop for PlaybackSession {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if let Some(poll) = inner.sync_poll.take() {
            poll.abort();
        }
        if let Some(engine) = inner.engine.take() {
            engine.destroy();
        }
    }
}

/// Scoped mutation lock. Released on drop, on every exit path.
pub struct MutationGuard<'a> {
    session: &'a PlaybackSession,
    generation: u64,
}

impl MutationGuard<'_> {
    /// False once a newer mutation has started
    pub fn is_current(&self) -> bool {
        self.session.inner.lock().generation == self.generation
    }
}

impl Drop for MutationGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.session.inner.lock();
        inner.lock_depth = inner.lock_depth.saturating_sub(1);
    }
}

/// Marks a load in flight until dropped
pub(crate) struct LoadTicket<'a> {
    session: &'a PlaybackSession,
}

impl Drop for LoadTicket<'_> {
    fn drop(&mut self) {
        self.session.inner.lock().loading = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{session_with, FakeMedia, Sent};

    #[tokio::test]
    async fn test_local_play_from_ready_is_broadcast() {
        let (session, media, notifier) = session_with(FakeMedia::new());
        session.set_state(PlaybackState::Ready);
        media.set_position(12.0);

        session.media_event(MediaEvent::Play);

        assert_eq!(session.state(), PlaybackState::Playing);
        assert_eq!(notifier.sent(), vec![Sent::Play(12.0)]);
    }

    #[tokio::test]
    async fn test_events_suppressed_while_locked() {
        let (session, _media, notifier) = session_with(FakeMedia::new());
        session.set_state(PlaybackState::Ready);
        {
            let _guard = session.lock_mutation();
            session.media_event(MediaEvent::Play);
            session.media_event(MediaEvent::Seeked);
        }
        assert!(!session.is_locked());
        assert_eq!(session.state(), PlaybackState::Ready);
        assert!(notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn test_pause_only_counts_from_playing() {
        let (session, media, notifier) = session_with(FakeMedia::new());
        session.set_state(PlaybackState::Ready);
        session.media_event(MediaEvent::Pause);
        assert!(notifier.sent().is_empty());

        session.set_state(PlaybackState::Playing);
        media.set_ended(true);
        session.media_event(MediaEvent::Pause);
        assert!(notifier.sent().is_empty());
        assert_eq!(session.state(), PlaybackState::Playing);

        media.set_ended(false);
        media.set_position(30.0);
        session.media_event(MediaEvent::Pause);
        assert_eq!(notifier.sent(), vec![Sent::Pause(30.0)]);
        assert_eq!(session.state(), PlaybackState::Ready);
    }

    #[tokio::test]
    async fn test_buffering_and_seek_guards() {
        let (session, _media, notifier) = session_with(FakeMedia::new());
        session.media_event(MediaEvent::Seeked);
        session.media_event(MediaEvent::Waiting);
        assert!(notifier.sent().is_empty());

        session.set_state(PlaybackState::Playing);
        session.media_event(MediaEvent::Waiting);
        session.media_event(MediaEvent::Playing);
        session.media_event(MediaEvent::Seeked);
        assert_eq!(
            notifier.sent(),
            vec![Sent::BufferStart, Sent::BufferEnd, Sent::Seek(0.0)]
        );

        session.set_state(PlaybackState::WaitingInteraction);
        session.media_event(MediaEvent::Playing);
        assert_eq!(notifier.sent().len(), 3);
    }

    #[tokio::test]
    async fn test_nested_guards_release_fully() {
        let (session, _media, _notifier) = session_with(FakeMedia::new());
        let outer = session.lock_mutation();
        let inner = session.lock_mutation();
        assert!(!outer.is_current());
        assert!(inner.is_current());
        drop(inner);
        assert!(session.is_locked());
        drop(outer);
        assert!(!session.is_locked());
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_interaction_polls_until_gesture() {
        let (session, media, notifier) = session_with(FakeMedia::new());
        session.set_state(PlaybackState::Ready);
        session.enter_waiting_interaction();
        assert!(session.is_sync_polling());

        time::sleep(std::time::Duration::from_millis(3500)).await;
        assert_eq!(notifier.count(&Sent::SyncRequest), 3);
        assert_eq!(notifier.count(&Sent::InteractionRequired), 1);

        media.allow_autoplay(true);
        let outcome = session.user_gesture().await;
        assert_eq!(outcome, Some(Ok(())));
        assert_eq!(session.state(), PlaybackState::Playing);
        assert!(!session.is_sync_polling());
        assert!(!session.is_locked());
        assert!(session.take_forced_sync());
        assert!(!session.take_forced_sync());

        time::sleep(std::time::Duration::from_secs(3)).await;
        assert_eq!(notifier.count(&Sent::SyncRequest), 3);
        assert_eq!(session.user_gesture().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gesture_with_failed_play_falls_back_to_ready() {
        let (session, media, notifier) = session_with(FakeMedia::new());
        session.enter_waiting_interaction();
        media.hang_play(true);

        let outcome = session.user_gesture().await;
        assert_eq!(outcome, Some(Err(PlayRejection::Timeout)));
        assert_eq!(session.state(), PlaybackState::Ready);
        assert!(!session.is_locked());
        assert_eq!(
            notifier.count(&Sent::InteractionComplete(Err(PlayRejection::Timeout))),
            1
        );
    }

    #[tokio::test]
    async fn test_second_load_is_rejected_while_first_in_flight() {
        let (session, _media, _notifier) = session_with(FakeMedia::new());
        let ticket = session.begin_load().unwrap();
        assert_eq!(session.state(), PlaybackState::Loading);
        assert!(matches!(session.begin_load(), Err(MediaLoadError::InFlight)));
        drop(ticket);
        assert!(session.begin_load().is_ok());
    }

    #[tokio::test]
    async fn test_heartbeat_reports_time_only_while_playing() {
        let (session, media, _notifier) = session_with(FakeMedia::new());
        media.set_position(42.0);
        assert_eq!(session.heartbeat_time(), None);
        session.set_state(PlaybackState::Playing);
        assert_eq!(session.heartbeat_time(), Some(42.0));
    }
}
