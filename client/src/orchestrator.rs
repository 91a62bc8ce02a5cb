use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{
    config::SyncConfig,
    drift,
    error::{MediaLoadError, TransportError},
    loader::{LoadReport, LoadRequest, MediaSourceLoader, ProxyProbe},
    media::{
        next_matching, race_timeout, EngineFactory, MediaElement, MediaEvent, PlayRejection,
        ReadyState,
    },
    protocol::{ChatMessage, ClientMessage, Member, MessageKind, RoomState, ServerMessage, VideoChanged},
    session::{AppliedState, PlaybackSession, PlayerNotifier},
    transport::{ConnectionStatus, HeartbeatSource, TransportChannel},
};

const LOG_TAG: &str = "[Room]";

/// User-facing notices, by severity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// The engine has stopped and will not recover on its own
    Fatal(String),
    Error(String),
    Warning(String),
    Info(String),
}

/// Presentation hooks for room activity. Every method defaults to a no-op.
pub trait RoomObserver: Send + Sync {
    fn on_roster(&self, _users: &[Member]) {}

    fn on_member_joined(&self, _member: &Member) {}

    fn on_member_left(&self, _username: &str) {}

    fn on_chat(&self, _message: &ChatMessage) {}

    fn on_chat_history(&self, _messages: &[ChatMessage]) {}

    fn on_video_changed(&self, _change: &VideoChanged) {}

    fn on_notice(&self, _notice: Notice) {}
}

/// Turns guarded local player events into transport sends
struct TransportNotifier {
    transport: Arc<TransportChannel>,
    observer: Arc<dyn RoomObserver>,
}

impl PlayerNotifier for TransportNotifier {
    fn on_play(&self, time: f64) {
        self.transport.send(&ClientMessage::Play { time });
    }

    fn on_pause(&self, time: f64) {
        self.transport.send(&ClientMessage::Pause { time });
    }

    fn on_seek(&self, time: f64) {
        self.transport.send(&ClientMessage::Seek { time });
    }

    fn on_buffer_start(&self) {
        self.transport.send(&ClientMessage::BufferStart);
    }

    fn on_buffer_end(&self) {
        self.transport.send(&ClientMessage::BufferEnd);
    }

    fn on_sync_request(&self) {
        self.transport.send(&ClientMessage::GetState);
    }

    fn on_interaction_required(&self) {
        self.observer
            .on_notice(Notice::Info("Playback is waiting for user interaction".into()));
    }

    fn on_interaction_complete(&self, outcome: &Result<(), PlayRejection>) {
        match outcome {
            Ok(()) => self.transport.send(&ClientMessage::GetState),
            Err(PlayRejection::Timeout) => self
                .observer
                .on_notice(Notice::Warning("Video did not start in time, try again".into())),
            Err(rejection) => self
                .observer
                .on_notice(Notice::Warning(format!("Video could not start: {rejection:?}"))),
        }
    }
}

/// Routes inbound room messages to the loader and drift corrector, and
/// local player events back out over the transport.
pub struct SyncOrchestrator {
    transport: Arc<TransportChannel>,
    session: Arc<PlaybackSession>,
    loader: MediaSourceLoader,
    observer: Arc<dyn RoomObserver>,
    status_watch: Mutex<Option<JoinHandle<()>>>,
}

impl SyncOrchestrator {
    pub fn new(
        config: Arc<SyncConfig>,
        media: Arc<dyn MediaElement>,
        engines: Arc<dyn EngineFactory>,
        probe: Arc<dyn ProxyProbe>,
        observer: Arc<dyn RoomObserver>,
    ) -> Arc<Self> {
        let transport = Arc::new(TransportChannel::new(Arc::clone(&config)));
        let notifier = Arc::new(TransportNotifier {
            transport: Arc::clone(&transport),
            observer: Arc::clone(&observer),
        });
        let session = PlaybackSession::new(media, engines, notifier, config);
        transport.set_heartbeat_source(Arc::clone(&session) as Arc<dyn HeartbeatSource>);

        let orchestrator = Arc::new(Self {
            transport,
            session,
            loader: MediaSourceLoader::new(probe),
            observer,
            status_watch: Mutex::new(None),
        });
        orchestrator.register_handlers();
        orchestrator
    }

    pub fn session(&self) -> &Arc<PlaybackSession> {
        &self.session
    }

    pub fn transport(&self) -> &Arc<TransportChannel> {
        &self.transport
    }

    fn register_handlers(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        for kind in [
            MessageKind::RoomState,
            MessageKind::UserJoined,
            MessageKind::UserLeft,
            MessageKind::Sync,
            MessageKind::SyncCorrection,
            MessageKind::Seek,
            MessageKind::Chat,
            MessageKind::VideoChanged,
            MessageKind::Error,
        ] {
            let weak = weak.clone();
            self.transport.on_message(kind, move |message| {
                let orchestrator = weak.upgrade();
                async move {
                    if let Some(orchestrator) = orchestrator {
                        orchestrator.handle_message(message).await;
                    }
                }
            });
        }
    }

    /// Connect to the room and surface a fatal notice if the channel ever
    /// gives up reconnecting.
    pub async fn connect(&self, url: &str) -> Result<(), TransportError> {
        let mut status = self.transport.status();
        let observer = Arc::clone(&self.observer);
        let watcher = tokio::spawn(async move {
            while status.changed().await.is_ok() {
                if *status.borrow_and_update() == ConnectionStatus::Failed {
                    error!("{LOG_TAG} connection to the room is lost for good");
                    observer.on_notice(Notice::Fatal(
                        "Connection to the room was lost. Reload to try again.".into(),
                    ));
                    break;
                }
            }
        });
        if let Some(previous) = self.status_watch.lock().replace(watcher) {
            previous.abort();
        }

        self.transport.connect(url).await
    }

    /// Connect, then announce ourselves to the room
    pub async fn run(&self, url: &str, username: &str, avatar: &str) -> Result<(), TransportError> {
        self.connect(url).await?;
        self.join(username, avatar);
        Ok(())
    }

    pub fn join(&self, username: &str, avatar: &str) {
        info!("{LOG_TAG} joining as {avatar} {username}");
        self.transport.send(&ClientMessage::Join {
            username: username.to_string(),
            avatar: avatar.to_string(),
        });
    }

    /// Ask the room to switch sources. Returns false if `url` is blank.
    pub fn change_video(&self, url: &str, user_agent: &str, referer: &str, subtitle_url: &str) -> bool {
        let url = url.trim();
        if url.is_empty() {
            self.observer
                .on_notice(Notice::Warning("Enter a video URL first".into()));
            return false;
        }
        self.transport.send(&ClientMessage::VideoChange {
            url: url.to_string(),
            user_agent: user_agent.trim().to_string(),
            referer: referer.trim().to_string(),
            subtitle_url: subtitle_url.trim().to_string(),
        });
        true
    }

    /// Returns false for blank messages, which are not sent
    pub fn send_chat(&self, text: &str) -> bool {
        let message = text.trim();
        if message.is_empty() {
            return false;
        }
        self.transport.send(&ClientMessage::Chat {
            message: message.to_string(),
        });
        true
    }

    pub async fn user_gesture(&self) -> Option<Result<(), PlayRejection>> {
        self.session.user_gesture().await
    }

    pub async fn handle_message(&self, message: ServerMessage) {
        match message {
            ServerMessage::RoomState(state) => self.handle_room_state(&state).await,
            ServerMessage::UserJoined(joined) => {
                self.observer.on_roster(&joined.users);
                self.observer.on_member_joined(&Member {
                    username: joined.username,
                    avatar: joined.avatar,
                });
            }
            ServerMessage::UserLeft(left) => {
                self.observer.on_roster(&left.users);
                self.observer.on_member_left(&left.username);
            }
            ServerMessage::Sync(update) => {
                if let Some(report) = drift::handle_sync(&self.session, &update).await {
                    debug!(
                        "{LOG_TAG} sync drift {:.3}s (threshold {}s, reseeked {})",
                        report.drift, report.threshold, report.reseeked
                    );
                }
            }
            ServerMessage::SyncCorrection(correction) => {
                drift::handle_sync_correction(&self.session, &correction).await;
            }
            ServerMessage::Seek(seek) => {
                drift::handle_seek(&self.session, &seek).await;
            }
            ServerMessage::Chat(chat) => self.observer.on_chat(&chat),
            ServerMessage::VideoChanged(change) => self.handle_video_changed(&change).await,
            ServerMessage::Error { message } => {
                warn!("{LOG_TAG} server error: {message}");
                self.observer.on_notice(Notice::Error(message));
            }
            ServerMessage::Pong => {}
        }
    }

    /// Full snapshot: load if the source changed, wait for metadata, then
    /// apply time and play state. Runs entirely under the mutation lock.
    async fn handle_room_state(&self, state: &RoomState) {
        self.observer.on_roster(&state.users);

        if !state.video_url.is_empty() {
            let _guard = self.session.lock_mutation();
            let loaded = self.session.loaded_source().map(|source| source.url);

            let ready = if loaded.as_deref() == Some(state.video_url.as_str()) {
                debug!("{LOG_TAG} {} already loaded", state.video_url);
                true
            } else {
                match self.load(&LoadRequest::from(state)).await {
                    Ok(_) => {
                        self.wait_for_metadata().await;
                        true
                    }
                    Err(_) => false,
                }
            };

            if ready {
                drift::apply_state(
                    &self.session,
                    AppliedState {
                        current_time: state.current_time,
                        is_playing: state.is_playing,
                    },
                )
                .await;
            }
        }

        if !state.chat_messages.is_empty() {
            self.observer.on_chat_history(&state.chat_messages);
        }
    }

    async fn handle_video_changed(&self, change: &VideoChanged) {
        info!(
            "{LOG_TAG} {} changed the video to {}",
            change.changed_by.as_deref().unwrap_or("someone"),
            change.url
        );
        if self.load(&LoadRequest::from(change)).await.is_ok() {
            self.observer.on_video_changed(change);
            self.observer.on_notice(Notice::Info(format!(
                "{} loaded a new video",
                change.changed_by.as_deref().unwrap_or("Someone")
            )));
        }
    }

    async fn load(&self, request: &LoadRequest) -> Result<LoadReport, MediaLoadError> {
        let result = self.loader.load(&self.session, request).await;
        match &result {
            Ok(report) => info!(
                "{LOG_TAG} source ready via {:?} after {} attempt(s)",
                report.route, report.attempts
            ),
            Err(MediaLoadError::InFlight) => debug!("{LOG_TAG} load already in flight"),
            Err(e @ MediaLoadError::ProxyDisabled) => {
                warn!("{LOG_TAG} {e}");
                self.observer.on_notice(Notice::Warning(
                    "Video proxy is disabled on this server, the source cannot be reached".into(),
                ));
            }
            Err(e) => {
                warn!("{LOG_TAG} {e}");
                self.observer.on_notice(Notice::Error(e.to_string()));
            }
        }
        result
    }

    async fn wait_for_metadata(&self) {
        let mut events = self.session.subscribe();
        if self.session.media().ready_state() >= ReadyState::HaveMetadata {
            return;
        }
        let metadata = next_matching(&mut events, |e| *e == MediaEvent::LoadedMetadata);
        if race_timeout(metadata, self.session.config().metadata_timeout)
            .await
            .is_timed_out()
        {
            warn!("{LOG_TAG} no metadata before applying room state");
        }
    }
}

impl Drop for SyncOrchestrator {
    fn drop(&mut self) {
        if let Some(watcher) = self.status_watch.lock().take() {
            watcher.abort();
        }
        self.transport.close();
    }
}
