//! Scripted fakes for the media element, streaming engine, proxy probe and
//! the outward notification hooks.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::{
    config::SyncConfig,
    loader::{ProxyProbe, ProxyStatus},
    media::{
        EngineErrorKind, EngineEvent, EngineFactory, EngineOptions, MediaElement, MediaEvent,
        MediaEventSink, NoEngine, PlayRejection, ReadyState, StreamingEngine, SubtitleTrack,
    },
    orchestrator::{Notice, RoomObserver},
    protocol::{ChatMessage, Member, VideoChanged},
    session::{PlaybackSession, PlayerNotifier},
};

/// Player-visible calls made on a [`FakeMedia`]
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    SetTime(f64),
    Play,
    Pause,
    SetRate(f64),
}

/// How a [`FakeMedia`] reacts to a new source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceScript {
    /// Metadata then canplay
    Ready,
    Error,
    /// Becomes ready without raising any event
    SilentReady,
    Silent,
}

type SourceScripter = Arc<dyn Fn(&str) -> SourceScript + Send + Sync>;

struct MediaState {
    position: f64,
    paused: bool,
    ended: bool,
    ready: ReadyState,
    rate: f64,
    autoplay: bool,
    hang_play: bool,
    play_delay: Option<Duration>,
    play_rejection: Option<PlayRejection>,
    silent_seeks: bool,
    scripter: Option<SourceScripter>,
    calls: Vec<Call>,
    sources: Vec<String>,
    subtitles: Vec<SubtitleTrack>,
    detaches: usize,
}

pub struct FakeMedia {
    state: Mutex<MediaState>,
    sink: Mutex<Option<MediaEventSink>>,
}

impl FakeMedia {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MediaState {
                position: 0.0,
                paused: true,
                ended: false,
                ready: ReadyState::HaveNothing,
                rate: 1.0,
                autoplay: true,
                hang_play: false,
                play_delay: None,
                play_rejection: None,
                silent_seeks: false,
                scripter: None,
                calls: Vec::new(),
                sources: Vec::new(),
                subtitles: Vec::new(),
                detaches: 0,
            }),
            sink: Mutex::new(None),
        })
    }

    fn emit(&self, event: MediaEvent) {
        let sink = self.sink.lock().clone();
        if let Some(sink) = sink {
            sink.emit(event);
        }
    }

    pub fn set_position(&self, seconds: f64) {
        self.state.lock().position = seconds;
    }

    pub fn position(&self) -> f64 {
        self.state.lock().position
    }

    pub fn set_ended(&self, ended: bool) {
        self.state.lock().ended = ended;
    }

    pub fn set_paused(&self, paused: bool) {
        self.state.lock().paused = paused;
    }

    pub fn set_ready_state(&self, ready: ReadyState) {
        self.state.lock().ready = ready;
    }

    /// Change the rate without recording a call
    pub fn set_playback_rate_raw(&self, rate: f64) {
        self.state.lock().rate = rate;
    }

    pub fn allow_autoplay(&self, allowed: bool) {
        self.state.lock().autoplay = allowed;
    }

    /// Make `play` never settle
    pub fn hang_play(&self, hang: bool) {
        self.state.lock().hang_play = hang;
    }

    pub fn delay_play(&self, delay: Duration) {
        self.state.lock().play_delay = Some(delay);
    }

    pub fn reject_play(&self, rejection: Option<PlayRejection>) {
        self.state.lock().play_rejection = rejection;
    }

    /// Seeks move the position but never confirm
    pub fn silent_seeks(&self, silent: bool) {
        self.state.lock().silent_seeks = silent;
    }

    pub fn script_sources<F>(&self, scripter: F)
    where
        F: Fn(&str) -> SourceScript + Send + Sync + 'static,
    {
        self.state.lock().scripter = Some(Arc::new(scripter));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn sources(&self) -> Vec<String> {
        self.state.lock().sources.clone()
    }

    pub fn subtitles(&self) -> Vec<SubtitleTrack> {
        self.state.lock().subtitles.clone()
    }

    pub fn count_detaches(&self) -> usize {
        self.state.lock().detaches
    }
}

#[async_trait]
impl MediaElement for FakeMedia {
    fn bind(&self, sink: MediaEventSink) {
        *self.sink.lock() = Some(sink);
    }

    fn current_time(&self) -> f64 {
        self.state.lock().position
    }

    fn set_current_time(&self, seconds: f64) {
        let silent = {
            let mut state = self.state.lock();
            state.calls.push(Call::SetTime(seconds));
            state.position = seconds;
            state.silent_seeks
        };
        if !silent {
            self.emit(MediaEvent::Seeked);
        }
    }

    fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    fn is_ended(&self) -> bool {
        self.state.lock().ended
    }

    fn ready_state(&self) -> ReadyState {
        self.state.lock().ready
    }

    fn playback_rate(&self) -> f64 {
        self.state.lock().rate
    }

    fn set_playback_rate(&self, rate: f64) {
        let mut state = self.state.lock();
        state.calls.push(Call::SetRate(rate));
        state.rate = rate;
    }

    async fn play(&self) -> Result<(), PlayRejection> {
        let (hang, delay) = {
            let mut state = self.state.lock();
            state.calls.push(Call::Play);
            (state.hang_play, state.play_delay)
        };
        if hang {
            std::future::pending::<()>().await;
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let was_paused = {
            let mut state = self.state.lock();
            if !state.autoplay {
                return Err(PlayRejection::NotAllowed);
            }
            if let Some(rejection) = state.play_rejection.clone() {
                return Err(rejection);
            }
            std::mem::replace(&mut state.paused, false)
        };
        if was_paused {
            self.emit(MediaEvent::Play);
        }
        Ok(())
    }

    fn pause(&self) {
        let was_playing = {
            let mut state = self.state.lock();
            state.calls.push(Call::Pause);
            !std::mem::replace(&mut state.paused, true)
        };
        if was_playing {
            self.emit(MediaEvent::Pause);
        }
    }

    fn set_source(&self, url: &str) {
        let scripter = {
            let mut state = self.state.lock();
            state.sources.push(url.to_string());
            state.ready = ReadyState::HaveNothing;
            state.scripter.clone()
        };
        let script = scripter.map_or(SourceScript::Ready, |scripter| scripter(url));
        match script {
            SourceScript::Ready => {
                self.set_ready_state(ReadyState::HaveEnoughData);
                self.emit(MediaEvent::LoadedMetadata);
                self.emit(MediaEvent::CanPlay);
            }
            SourceScript::Error => self.emit(MediaEvent::Error("MEDIA_ERR_SRC_NOT_SUPPORTED".into())),
            SourceScript::SilentReady => self.set_ready_state(ReadyState::HaveEnoughData),
            SourceScript::Silent => {}
        }
    }

    fn attach_subtitle(&self, track: SubtitleTrack) {
        self.state.lock().subtitles.push(track);
    }

    fn detach_subtitles(&self) {
        let mut state = self.state.lock();
        state.subtitles.clear();
        state.detaches += 1;
    }
}

/// How a [`FakeEngine`] answers `load_source`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineScript {
    Manifest,
    NetworkFatal,
    MediaFatal,
    OtherFatal,
    /// Never reports anything
    Silent,
}

pub struct FakeEngine {
    options: EngineOptions,
    script: EngineScript,
    events: broadcast::Sender<EngineEvent>,
    loaded: Mutex<Vec<String>>,
    destroyed: AtomicBool,
}

impl FakeEngine {
    pub fn loaded_urls(&self) -> Vec<String> {
        self.loaded.lock().clone()
    }

    pub fn options(&self) -> EngineOptions {
        self.options.clone()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn fatal(&self, kind: EngineErrorKind, details: &str) {
        let _ = self.events.send(EngineEvent::Error {
            kind,
            fatal: false,
            details: "fragLoadTimeOut".into(),
        });
        let _ = self.events.send(EngineEvent::Error {
            kind,
            fatal: true,
            details: details.into(),
        });
    }
}

impl StreamingEngine for FakeEngine {
    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    fn load_source(&self, url: &str) {
        self.loaded.lock().push(url.to_string());
        match self.script {
            EngineScript::Manifest => {
                let _ = self.events.send(EngineEvent::ManifestParsed);
            }
            EngineScript::NetworkFatal => self.fatal(EngineErrorKind::Network, "manifestLoadError"),
            EngineScript::MediaFatal => self.fatal(EngineErrorKind::Media, "bufferAppendError"),
            EngineScript::OtherFatal => self.fatal(EngineErrorKind::Other, "internalException"),
            EngineScript::Silent => {}
        }
    }

    fn attach_media(&self) {}

    fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }
}

pub struct FakeEngineFactory {
    supported: bool,
    scripts: Mutex<VecDeque<EngineScript>>,
    created: Mutex<Vec<Arc<FakeEngine>>>,
}

impl FakeEngineFactory {
    /// One script per engine instance, in creation order
    pub fn new(scripts: Vec<EngineScript>) -> Arc<Self> {
        Arc::new(Self {
            supported: true,
            scripts: Mutex::new(scripts.into()),
            created: Mutex::new(Vec::new()),
        })
    }

    pub fn unsupported() -> Arc<Self> {
        Arc::new(Self {
            supported: false,
            scripts: Mutex::new(VecDeque::new()),
            created: Mutex::new(Vec::new()),
        })
    }

    pub fn created(&self) -> Vec<Arc<FakeEngine>> {
        self.created.lock().clone()
    }
}

impl EngineFactory for FakeEngineFactory {
    fn is_supported(&self) -> bool {
        self.supported
    }

    fn create(&self, options: EngineOptions) -> Arc<dyn StreamingEngine> {
        let script = self
            .scripts
            .lock()
            .pop_front()
            .unwrap_or(EngineScript::Silent);
        let (events, _) = broadcast::channel(16);
        let engine = Arc::new(FakeEngine {
            options,
            script,
            events,
            loaded: Mutex::new(Vec::new()),
            destroyed: AtomicBool::new(false),
        });
        self.created.lock().push(Arc::clone(&engine));
        engine
    }
}

/// Outward notifications recorded by [`RecordingNotifier`]
#[derive(Debug, Clone, PartialEq)]
pub enum Sent {
    Play(f64),
    Pause(f64),
    Seek(f64),
    BufferStart,
    BufferEnd,
    SyncRequest,
    InteractionRequired,
    InteractionComplete(Result<(), PlayRejection>),
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Sent>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().clone()
    }

    pub fn count(&self, wanted: &Sent) -> usize {
        self.sent.lock().iter().filter(|s| *s == wanted).count()
    }

    fn record(&self, sent: Sent) {
        self.sent.lock().push(sent);
    }
}

impl PlayerNotifier for RecordingNotifier {
    fn on_play(&self, time: f64) {
        self.record(Sent::Play(time));
    }

    fn on_pause(&self, time: f64) {
        self.record(Sent::Pause(time));
    }

    fn on_seek(&self, time: f64) {
        self.record(Sent::Seek(time));
    }

    fn on_buffer_start(&self) {
        self.record(Sent::BufferStart);
    }

    fn on_buffer_end(&self) {
        self.record(Sent::BufferEnd);
    }

    fn on_sync_request(&self) {
        self.record(Sent::SyncRequest);
    }

    fn on_interaction_required(&self) {
        self.record(Sent::InteractionRequired);
    }

    fn on_interaction_complete(&self, outcome: &Result<(), PlayRejection>) {
        self.record(Sent::InteractionComplete(outcome.clone()));
    }
}

pub type SessionParts = (Arc<PlaybackSession>, Arc<FakeMedia>, Arc<RecordingNotifier>);

/// Session over `media` without adaptive streaming support
pub fn session_with(media: Arc<FakeMedia>) -> SessionParts {
    build_session(media, Arc::new(NoEngine))
}

pub fn session_with_engine(media: Arc<FakeMedia>, engines: Arc<FakeEngineFactory>) -> SessionParts {
    build_session(media, engines)
}

fn build_session(media: Arc<FakeMedia>, engines: Arc<dyn EngineFactory>) -> SessionParts {
    let notifier = Arc::new(RecordingNotifier::default());
    let session = PlaybackSession::new(
        media.clone(),
        engines,
        notifier.clone(),
        Arc::new(SyncConfig::default()),
    );
    (session, media, notifier)
}

pub struct FakeProbe {
    status: ProxyStatus,
    probed: Mutex<Vec<String>>,
}

impl FakeProbe {
    pub fn new(status: ProxyStatus) -> Self {
        Self {
            status,
            probed: Mutex::new(Vec::new()),
        }
    }

    pub fn probed(&self) -> Vec<String> {
        self.probed.lock().clone()
    }
}

#[async_trait]
impl ProxyProbe for FakeProbe {
    async fn probe(&self, endpoint: &str) -> ProxyStatus {
        self.probed.lock().push(endpoint.to_string());
        self.status
    }
}

/// Room activity recorded by [`RecordingObserver`]
#[derive(Debug, Clone, PartialEq)]
pub enum Observed {
    Roster(usize),
    Joined(String),
    Left(String),
    Chat(String),
    History(usize),
    VideoChanged(String),
    Notice(Notice),
}

#[derive(Default)]
pub struct RecordingObserver {
    seen: Mutex<Vec<Observed>>,
}

impl RecordingObserver {
    pub fn seen(&self) -> Vec<Observed> {
        self.seen.lock().clone()
    }
}

impl RoomObserver for RecordingObserver {
    fn on_roster(&self, users: &[Member]) {
        self.seen.lock().push(Observed::Roster(users.len()));
    }

    fn on_member_joined(&self, member: &Member) {
        self.seen.lock().push(Observed::Joined(member.username.clone()));
    }

    fn on_member_left(&self, username: &str) {
        self.seen.lock().push(Observed::Left(username.to_string()));
    }

    fn on_chat(&self, message: &ChatMessage) {
        self.seen.lock().push(Observed::Chat(message.message.clone()));
    }

    fn on_chat_history(&self, messages: &[ChatMessage]) {
        self.seen.lock().push(Observed::History(messages.len()));
    }

    fn on_video_changed(&self, change: &VideoChanged) {
        self.seen.lock().push(Observed::VideoChanged(change.url.clone()));
    }

    fn on_notice(&self, notice: Notice) {
        self.seen.lock().push(Observed::Notice(notice));
    }
}
