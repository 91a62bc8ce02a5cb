//! Terminal-only host: a clocked media element that checks sources over
//! HTTP and a streaming engine that validates HLS manifests. Enough to follow
//! a room and watch drift corrections in the logs.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{header, Client};
use tokio::{sync::broadcast, task::JoinHandle, time::Instant};
use tracing::{debug, info, warn};

use crate::{
    media::{
        EngineErrorKind, EngineEvent, EngineFactory, EngineOptions, MediaElement, MediaEvent,
        MediaEventSink, PlayRejection, ReadyState, StreamingEngine, SubtitleTrack,
    },
    orchestrator::{Notice, RoomObserver},
    protocol::{ChatMessage, Member, VideoChanged},
    utils::format_time,
};

const LOG_TAG: &str = "[Headless]";
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

struct Clock {
    anchor: Instant,
    base: f64,
    paused: bool,
    rate: f64,
    ready: ReadyState,
    source: Option<String>,
    /// Bumped on every new source so stale probes are ignored
    load_id: u64,
    subtitles: Vec<SubtitleTrack>,
}

impl Clock {
    fn position(&self) -> f64 {
        if self.paused {
            self.base
        } else {
            self.base + self.anchor.elapsed().as_secs_f64() * self.rate
        }
    }

    fn rebase(&mut self, position: f64) {
        self.base = position;
        self.anchor = Instant::now();
    }
}

/// Media element backed by a wall clock instead of a decoder
pub struct HeadlessPlayer {
    this: Weak<HeadlessPlayer>,
    client: Client,
    clock: Mutex<Clock>,
    sink: Mutex<Option<MediaEventSink>>,
    probe: Mutex<Option<JoinHandle<()>>>,
}

impl HeadlessPlayer {
    pub fn new(client: Client) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            client,
            clock: Mutex::new(Clock {
                anchor: Instant::now(),
                base: 0.0,
                paused: true,
                rate: 1.0,
                ready: ReadyState::HaveNothing,
                source: None,
                load_id: 0,
                subtitles: Vec::new(),
            }),
            sink: Mutex::new(None),
            probe: Mutex::new(None),
        })
    }

    pub fn source(&self) -> Option<String> {
        self.clock.lock().source.clone()
    }

    pub fn subtitles(&self) -> Vec<SubtitleTrack> {
        self.clock.lock().subtitles.clone()
    }

    fn emit(&self, event: MediaEvent) {
        let sink = self.sink.lock().clone();
        if let Some(sink) = sink {
            sink.emit(event);
        }
    }

    /// Source became decodable: raise the readiness events once
    fn mark_ready(&self, load_id: u64) {
        {
            let mut clock = self.clock.lock();
            if clock.load_id != load_id || clock.ready >= ReadyState::HaveMetadata {
                return;
            }
            clock.ready = ReadyState::HaveEnoughData;
        }
        self.emit(MediaEvent::LoadedMetadata);
        self.emit(MediaEvent::CanPlay);
    }

    fn mark_failed(&self, load_id: u64, reason: String) {
        if self.clock.lock().load_id != load_id {
            return;
        }
        self.emit(MediaEvent::Error(reason));
    }
}

#[async_trait]
impl MediaElement for HeadlessPlayer {
    fn bind(&self, sink: MediaEventSink) {
        *self.sink.lock() = Some(sink);
    }

    fn current_time(&self) -> f64 {
        self.clock.lock().position()
    }

    fn set_current_time(&self, seconds: f64) {
        self.clock.lock().rebase(seconds.max(0.0));
        self.emit(MediaEvent::Seeked);
    }

    fn is_paused(&self) -> bool {
        self.clock.lock().paused
    }

    fn is_ended(&self) -> bool {
        false
    }

    fn ready_state(&self) -> ReadyState {
        self.clock.lock().ready
    }

    fn playback_rate(&self) -> f64 {
        self.clock.lock().rate
    }

    fn set_playback_rate(&self, rate: f64) {
        let mut clock = self.clock.lock();
        let position = clock.position();
        clock.rebase(position);
        clock.rate = rate;
    }

    async fn play(&self) -> Result<(), PlayRejection> {
        let started = {
            let mut clock = self.clock.lock();
            if clock.source.is_none() {
                return Err(PlayRejection::Failed("no source loaded".into()));
            }
            if clock.paused {
                let position = clock.position();
                clock.rebase(position);
                clock.paused = false;
                true
            } else {
                false
            }
        };
        if started {
            self.emit(MediaEvent::Play);
            self.emit(MediaEvent::Playing);
        }
        Ok(())
    }

    fn pause(&self) {
        let stopped = {
            let mut clock = self.clock.lock();
            if clock.paused {
                false
            } else {
                let position = clock.position();
                clock.rebase(position);
                clock.paused = true;
                true
            }
        };
        if stopped {
            self.emit(MediaEvent::Pause);
        }
    }

    fn set_source(&self, url: &str) {
        let load_id = {
            let mut clock = self.clock.lock();
            clock.load_id += 1;
            clock.source = Some(url.to_string());
            clock.ready = ReadyState::HaveNothing;
            clock.paused = true;
            clock.rate = 1.0;
            clock.rebase(0.0);
            clock.load_id
        };

        let this = self.this.clone();
        let client = self.client.clone();
        let url = url.to_string();
        let task = tokio::spawn(async move {
            let result = client
                .get(&url)
                .header(header::RANGE, "bytes=0-1023")
                .timeout(FETCH_TIMEOUT)
                .send()
                .await;
            let Some(player) = this.upgrade() else {
                return;
            };
            match result {
                Ok(response) if response.status().is_success() => {
                    debug!("{LOG_TAG} source {url} answered {}", response.status());
                    player.mark_ready(load_id);
                }
                Ok(response) => player.mark_failed(load_id, format!("HTTP {}", response.status())),
                Err(e) => player.mark_failed(load_id, e.to_string()),
            }
        });
        if let Some(previous) = self.probe.lock().replace(task) {
            previous.abort();
        }
    }

    fn attach_subtitle(&self, track: SubtitleTrack) {
        info!("{LOG_TAG} subtitles: {}", track.url);
        self.clock.lock().subtitles.push(track);
    }

    fn detach_subtitles(&self) {
        self.clock.lock().subtitles.clear();
    }
}

/// Engine that fetches the manifest and checks it is a playlist
pub struct HeadlessEngine {
    player: Arc<HeadlessPlayer>,
    client: Client,
    options: EngineOptions,
    events: broadcast::Sender<EngineEvent>,
    manifest_url: Mutex<Option<String>>,
    attached_load: Arc<Mutex<Option<u64>>>,
    fetch: Mutex<Option<JoinHandle<()>>>,
}

impl StreamingEngine for HeadlessEngine {
    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    fn load_source(&self, url: &str) {
        let mut request = self.client.get(url).timeout(FETCH_TIMEOUT);
        for (name, value) in &self.options.request_headers {
            request = request.header(name.as_str(), value.as_str());
        }
        *self.manifest_url.lock() = Some(url.to_string());
        let events = self.events.clone();
        let player = Arc::clone(&self.player);
        let attached_load = Arc::clone(&self.attached_load);
        let url = url.to_string();

        let task = tokio::spawn(async move {
            let outcome = match request.send().await {
                Ok(response) if response.status().is_success() => match response.text().await {
                    Ok(body) if body.trim_start().starts_with("#EXTM3U") => Ok(()),
                    Ok(_) => Err((EngineErrorKind::Media, "manifestParsingError".to_string())),
                    Err(e) => Err((EngineErrorKind::Network, e.to_string())),
                },
                Ok(response) => Err((
                    EngineErrorKind::Network,
                    format!("manifestLoadError: HTTP {}", response.status()),
                )),
                Err(e) => Err((EngineErrorKind::Network, format!("manifestLoadError: {e}"))),
            };
            match outcome {
                Ok(()) => {
                    debug!("{LOG_TAG} manifest ok: {url}");
                    let attached = *attached_load.lock();
                    if let Some(load_id) = attached {
                        player.mark_ready(load_id);
                    }
                    let _ = events.send(EngineEvent::ManifestParsed);
                }
                Err((kind, details)) => {
                    warn!("{LOG_TAG} manifest failed for {url}: {details}");
                    let _ = events.send(EngineEvent::Error {
                        kind,
                        fatal: true,
                        details,
                    });
                }
            }
        });
        if let Some(previous) = self.fetch.lock().replace(task) {
            previous.abort();
        }
    }

    /// Take over the player: its previous source is gone
    fn attach_media(&self) {
        let manifest_url = self.manifest_url.lock().clone();
        let load_id = {
            let mut clock = self.player.clock.lock();
            clock.load_id += 1;
            clock.source = manifest_url;
            clock.ready = ReadyState::HaveNothing;
            clock.paused = true;
            clock.rate = 1.0;
            clock.rebase(0.0);
            clock.load_id
        };
        *self.attached_load.lock() = Some(load_id);
    }

    fn destroy(&self) {
        if let Some(task) = self.fetch.lock().take() {
            task.abort();
        }
        self.attached_load.lock().take();
    }
}

pub struct HeadlessEngineFactory {
    player: Arc<HeadlessPlayer>,
    client: Client,
}

impl HeadlessEngineFactory {
    pub fn new(player: Arc<HeadlessPlayer>, client: Client) -> Self {
        Self { player, client }
    }
}

impl EngineFactory for HeadlessEngineFactory {
    fn is_supported(&self) -> bool {
        true
    }

    fn create(&self, options: EngineOptions) -> Arc<dyn StreamingEngine> {
        let (events, _) = broadcast::channel(16);
        Arc::new(HeadlessEngine {
            player: Arc::clone(&self.player),
            client: self.client.clone(),
            options,
            events,
            manifest_url: Mutex::new(None),
            attached_load: Arc::new(Mutex::new(None)),
            fetch: Mutex::new(None),
        })
    }
}

/// Writes room activity to the log
pub struct LogObserver {
    player: Arc<HeadlessPlayer>,
}

impl LogObserver {
    pub fn new(player: Arc<HeadlessPlayer>) -> Self {
        Self { player }
    }
}

impl RoomObserver for LogObserver {
    fn on_roster(&self, users: &[Member]) {
        let names: Vec<&str> = users.iter().map(|m| m.username.as_str()).collect();
        info!("{LOG_TAG} {} in room: {}", users.len(), names.join(", "));
    }

    fn on_member_joined(&self, member: &Member) {
        info!("{LOG_TAG} {} {} joined", member.avatar, member.username);
    }

    fn on_member_left(&self, username: &str) {
        info!("{LOG_TAG} {username} left");
    }

    fn on_chat(&self, message: &ChatMessage) {
        info!(
            "{LOG_TAG} [{}] <{}> {}",
            format_time(self.player.current_time()),
            message.username,
            message.message
        );
    }

    fn on_chat_history(&self, messages: &[ChatMessage]) {
        info!("{LOG_TAG} {} earlier chat messages", messages.len());
    }

    fn on_video_changed(&self, change: &VideoChanged) {
        let duration = change.duration.map(format_time).unwrap_or_else(|| "live".into());
        info!(
            "{LOG_TAG} now playing '{}' ({duration})",
            if change.title.is_empty() { &change.url } else { &change.title }
        );
    }

    fn on_notice(&self, notice: Notice) {
        match notice {
            Notice::Fatal(text) | Notice::Error(text) => tracing::error!("{LOG_TAG} {text}"),
            Notice::Warning(text) => warn!("{LOG_TAG} {text}"),
            Notice::Info(text) => info!("{LOG_TAG} {text}"),
        }
    }
}
