//! WebRTC-to-plain-RTP bridge engine: session lifecycle, dual
//! session-description processing, UDP port allocation, SDES-SRTP, and the
//! bidirectional media relay. The embedding host and the WebRTC engine are
//! narrow trait boundaries in [`host`]; everything else here is
//! self-contained.

pub mod host;
pub mod media_session;
pub mod port_allocator;
pub mod relay;
pub mod request_handler;
pub mod sdp_bridge;
pub mod session_manager;
pub mod srtp;

pub use host::{AudioLevelExtension, Host, MediaRecorder, RecorderTarget, RtpExtensions, VideoOrientationExtension};
pub use media_session::{MediaSession, MediumState, Recorders, Session, SwitchingContext};
pub use port_allocator::{AddressFamily, AllocatedPorts, PortAllocator};
pub use request_handler::Outcome;
pub use session_manager::SessionManager;
pub use srtp::{LocalKeying, RemoteKeying, SrtpGuard};
