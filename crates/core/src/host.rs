//! Narrow trait boundaries to the embedding host and to the recorder
//! subsystem — the collaborators the bridge engine calls out to but does
//! not implement itself.

use async_trait::async_trait;
use rtpbridge_protocol::{Jsep, SessionHandle};
use serde::Serialize;

/// Header-extension side channel extracted from inbound RTP, handed to the
/// host alongside the raw payload.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RtpExtensions {
    pub audio_level: Option<AudioLevelExtension>,
    pub video_orientation: Option<VideoOrientationExtension>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AudioLevelExtension {
    pub vad: bool,
    pub level: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VideoOrientationExtension {
    pub rotation: u16,
    pub back_camera: bool,
    pub flipped: bool,
}

/// Upcalls the core makes into the embedding host. A real host wires these
/// onto a WebRTC PeerConnection and a plugin event bus; the `cli` crate
/// wires them onto stdout and an in-memory loopback for exercising the
/// engine standalone.
#[async_trait]
pub trait Host: Send + Sync {
    /// Deliver a peer-originated RTP frame upward, SSRC-rewritten and
    /// with any header-extension side information already extracted.
    async fn relay_rtp(
        &self,
        handle: SessionHandle,
        is_video: bool,
        payload: &[u8],
        extensions: RtpExtensions,
    );

    /// Deliver a peer-originated RTCP packet upward.
    async fn relay_rtcp(&self, handle: SessionHandle, is_video: bool, payload: &[u8]);

    /// Ask the WebRTC side to send a keyframe.
    async fn send_pli(&self, handle: SessionHandle);

    /// Tear down the WebRTC side of this session.
    async fn close_pc(&self, handle: SessionHandle);

    /// Emit a lifecycle notification for external observers. Only called
    /// when `events_enabled()` returns true.
    async fn notify_event(&self, handle: SessionHandle, payload: serde_json::Value);

    /// Gate `notify_event` calls; lets the host turn off eventing cheaply.
    fn events_enabled(&self) -> bool;

    /// Deliver the asynchronous response to a request the host previously
    /// enqueued via `SessionManager::handle_message`, matched back up by
    /// `transaction`. `jsep` carries the WebRTC-side description to signal
    /// back, when the request produced one.
    async fn push_event(
        &self,
        handle: SessionHandle,
        transaction: String,
        envelope: serde_json::Value,
        jsep: Option<Jsep>,
    );

    /// Open a recorder for one direction of one medium, named after the
    /// negotiated codec. The on-disk container format is the host's
    /// concern; the core only ever writes RTP payloads through the
    /// returned handle.
    fn open_recorder(
        &self,
        handle: SessionHandle,
        target: RecorderTarget,
        codec_name: &str,
        filename_base: &str,
    ) -> Result<Box<dyn MediaRecorder>, String>;
}

/// Which of the four recorder slots a `Request::Recording { action: start }`
/// is opening.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderTarget {
    UserAudio,
    UserVideo,
    PeerAudio,
    PeerVideo,
}

/// A single direction's on-disk (or otherwise externally stored) media
/// recorder. Opened with the negotiated codec name and closed idempotently.
pub trait MediaRecorder: Send + Sync {
    /// Append one RTP payload (already de-SRTP'd) to the recording.
    fn write_rtp(&self, payload: &[u8], timestamp: u32, marker: bool);

    /// The filename or identifier this recorder is writing to, surfaced
    /// back through `query_session`.
    fn target(&self) -> &str;

    /// Flush and close. Safe to call more than once.
    fn close(&self);
}
