//! Session layer: lifecycle, the streaming pipeline, the control server
//! and its collaborators.

pub mod collab;
pub mod discovery;
pub mod handle;
pub mod pipeline;
pub mod server;
pub mod state;

pub use collab::{AllowListAuthorizer, AuthDecision, InputInjector, LoggingInjector, PeerAuthorizer, platform_injector};
pub use discovery::{DEFAULT_DISCOVERY_PORT, ServiceAdvertiser, ServiceRecord, UdpAnnouncer};
pub use handle::{SessionConfig, SessionHandle, SessionParts};
pub use pipeline::{Pipeline, PipelineCommand, PipelineConfig};
pub use server::{
    Collaborators, ControlServer, DEFAULT_CONTROL_PORT, LocalIdentity, ServerConfig, SourceFactory,
    key_fingerprint, select_codec,
};
pub use state::{DropReason, SessionEvent, SessionInfo, SessionState, SessionStatus};
