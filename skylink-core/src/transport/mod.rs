//! Network transport: NAT classification, path establishment and the
//! framed link that carries video, input and control traffic.

pub mod link;
pub mod nat;
pub mod p2p;
pub mod queue;
pub mod stun;

pub use link::{Link, LinkConfig, LinkSender, LinkState, LinkStats, LinkStatsSnapshot};
pub use nat::{
    NatCache, NatClassifier, NatDetectionConfig, NatDetectionResult, NatType, ProbeRequest,
    StunProber, SuccessRateTable, TraversalDifficulty,
};
pub use p2p::{
    AsyncStream, BoxedStream, CandidateKind, Established, P2pConnection, P2pState, PathConnector,
    PathKind, PeerCandidate, TcpConnector, TraversalConfig, establish,
};
pub use queue::{PushOutcome, SendQueue};
pub use stun::{StunServer, UdpStunProber};
