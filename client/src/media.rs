//! Host capabilities the engine drives: the media element, the adaptive
//! streaming engine, and the event plumbing between them and the session.

use std::{
    future::Future,
    sync::{Arc, Weak},
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::session::PlaybackSession;

/// Events raised by the host media element
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    Play,
    Pause,
    Seeked,
    Waiting,
    Playing,
    CanPlay,
    LoadedMetadata,
    Error(String),
}

/// Readiness levels of a media element, ordered
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReadyState {
    HaveNothing,
    HaveMetadata,
    HaveCurrentData,
    HaveFutureData,
    HaveEnoughData,
}

/// Why a play request did not start playback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayRejection {
    /// Host forbids unsolicited playback until a user gesture
    NotAllowed,
    /// Interrupted by a newer load or pause
    Aborted,
    Timeout,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubtitleTrack {
    pub url: String,
    pub label: String,
    pub language: String,
}

/// Local media handle. Implementations report events through the
/// [`MediaEventSink`] passed to [`MediaElement::bind`], synchronously with
/// the state change that caused them.
#[async_trait]
pub trait MediaElement: Send + Sync {
    fn bind(&self, sink: MediaEventSink);

    fn current_time(&self) -> f64;

    fn set_current_time(&self, seconds: f64);

    fn is_paused(&self) -> bool;

    fn is_ended(&self) -> bool;

    fn ready_state(&self) -> ReadyState;

    fn playback_rate(&self) -> f64;

    fn set_playback_rate(&self, rate: f64);

    async fn play(&self) -> Result<(), PlayRejection>;

    fn pause(&self);

    fn set_source(&self, url: &str);

    fn attach_subtitle(&self, track: SubtitleTrack);

    fn detach_subtitles(&self);
}

/// Error classes reported by a streaming engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineErrorKind {
    Network,
    Media,
    Other,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    ManifestParsed,
    Error {
        kind: EngineErrorKind,
        fatal: bool,
        details: String,
    },
}

#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    /// Extra request headers for every manifest/segment request
    pub request_headers: Vec<(String, String)>,
}

/// One adaptive-streaming engine instance bound to the media element
pub trait StreamingEngine: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<EngineEvent>;

    fn load_source(&self, url: &str);

    fn attach_media(&self);

    fn destroy(&self);
}

pub trait EngineFactory: Send + Sync {
    fn is_supported(&self) -> bool;

    fn create(&self, options: EngineOptions) -> Arc<dyn StreamingEngine>;
}

/// Factory for hosts without adaptive streaming support; HLS falls back to
/// native source assignment.
pub struct NoEngine;

impl EngineFactory for NoEngine {
    fn is_supported(&self) -> bool {
        false
    }

    fn create(&self, _options: EngineOptions) -> Arc<dyn StreamingEngine> {
        Arc::new(NoEngine)
    }
}

impl StreamingEngine for NoEngine {
    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        broadcast::channel(1).1
    }

    fn load_source(&self, _url: &str) {}

    fn attach_media(&self) {}

    fn destroy(&self) {}
}

/// Handle the media element uses to report events to its session
#[derive(Clone)]
pub struct MediaEventSink {
    session: Weak<PlaybackSession>,
}

impl MediaEventSink {
    pub(crate) fn new(session: Weak<PlaybackSession>) -> Self {
        Self { session }
    }

    pub fn emit(&self, event: MediaEvent) {
        if let Some(session) = self.session.upgrade() {
            session.media_event(event);
        }
    }
}

/// Outcome of racing a signal against a timeout
#[derive(Debug, Clone, PartialEq)]
pub enum Race<T> {
    Event(T),
    TimedOut,
}

impl<T> Race<T> {
    pub fn is_timed_out(&self) -> bool {
        matches!(self, Race::TimedOut)
    }
}

/// Wait for `signal` or `timeout`, whichever settles first. The signal wins
/// an exact tie.
pub async fn race_timeout<F: Future>(signal: F, timeout: Duration) -> Race<F::Output> {
    tokio::select! {
        biased;
        value = signal => Race::Event(value),
        _ = tokio::time::sleep(timeout) => Race::TimedOut,
    }
}

/// Resolve when `rx` yields an event matching `pred`. Resolves to `None` if
/// the sender is gone.
pub async fn next_matching<E, F>(rx: &mut broadcast::Receiver<E>, mut pred: F) -> Option<E>
where
    E: Clone,
    F: FnMut(&E) -> bool,
{
    loop {
        match rx.recv().await {
            Ok(event) if pred(&event) => return Some(event),
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!("Media event waiter lagged by {skipped} events");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}
