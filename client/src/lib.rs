//! Synchronized watch-party playback engine: keeps a local media element in
//! lockstep with a room's authoritative playback state.

pub mod config;
pub mod constants;
pub mod drift;
pub mod error;
pub mod headless;
pub mod loader;
pub mod media;
pub mod orchestrator;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod utils;

#[cfg(test)]
mod testing;

pub use config::SyncConfig;
pub use error::{MediaLoadError, ProtocolError, TransportError};
pub use loader::{detect_format, LoadReport, LoadRequest, MediaFormat, MediaSourceLoader};
pub use media::{MediaElement, MediaEvent, PlayRejection, StreamingEngine};
pub use orchestrator::{Notice, RoomObserver, SyncOrchestrator};
pub use session::{PlaybackSession, PlaybackState, PlayerNotifier};
pub use transport::{ConnectionStatus, HeartbeatSource, TransportChannel};
