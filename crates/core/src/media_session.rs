//! Per-session media state: the aggregate that `SDPBridge`, `Relay`, and
//! `RequestHandler` all read and mutate.

use std::sync::{Arc, Mutex};

use rtpbridge_protocol::SrtpProfile;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

use crate::srtp::SrtpGuard;

/// Normalizes outbound sequence numbers and timestamps across a peer SSRC
/// change so the far end sees a continuous stream instead of a jump.
#[derive(Debug, Default, Clone, Copy)]
pub struct SwitchingContext {
    last_ssrc: Option<u32>,
    seq_offset: i32,
    ts_offset: i64,
    last_seq: u16,
    last_ts: u32,
}

impl SwitchingContext {
    /// Given the incoming packet's ssrc/seq/ts, return the seq/ts to write
    /// on the outbound (rewritten) packet.
    pub fn update(&mut self, ssrc: u32, seq: u16, ts: u32) -> (u16, u32) {
        match self.last_ssrc {
            None => {
                self.last_ssrc = Some(ssrc);
                self.last_seq = seq;
                self.last_ts = ts;
                (seq, ts)
            }
            Some(last) if last == ssrc => {
                let out_seq = (seq as i32 + self.seq_offset) as u16;
                let out_ts = (ts as i64 + self.ts_offset) as u32;
                self.last_seq = out_seq;
                self.last_ts = out_ts;
                (out_seq, out_ts)
            }
            Some(_) => {
                // New SSRC: pick offsets that make this packet continue
                // immediately after the last one we emitted.
                let next_seq = self.last_seq.wrapping_add(1);
                let next_ts = self.last_ts.wrapping_add(3000);
                self.seq_offset = next_seq as i32 - seq as i32;
                self.ts_offset = next_ts as i64 - ts as i64;
                self.last_ssrc = Some(ssrc);
                self.last_seq = next_seq;
                self.last_ts = next_ts;
                (next_seq, next_ts)
            }
        }
    }
}

/// Per-medium (audio or video) state.
#[derive(Default)]
pub struct MediumState {
    pub has: bool,
    pub local_rtp_port: u16,
    pub local_rtcp_port: u16,
    pub remote_ip: Option<String>,
    pub remote_rtp_port: u16,
    pub remote_rtcp_port: u16,
    pub rtp_socket: Option<Arc<UdpSocket>>,
    pub rtcp_socket: Option<Arc<UdpSocket>>,
    pub local_ssrc: u32,
    pub peer_ssrc: u32,
    pub pt: i32,
    pub pt_name: Option<String>,
    pub send: bool,
    pub switching: SwitchingContext,
    pub srtp_profile: Option<SrtpProfile>,
    pub crypto_tag: u32,
    pub local_crypto_line: Option<String>,
    pub encrypt: Option<SrtpGuard>,
    pub decrypt: Option<SrtpGuard>,
}

impl MediumState {
    pub fn is_bound(&self) -> bool {
        self.rtp_socket.is_some() && self.rtcp_socket.is_some()
    }
}

pub struct MediaSession {
    pub audio: MediumState,
    pub video: MediumState,

    pub opusred_pt: i32,
    pub simulcast_ssrc: u32,

    pub require_srtp: bool,
    pub has_srtp_local: bool,
    pub has_srtp_remote: bool,

    pub video_pli_supported: bool,
    pub video_orientation_extension_id: i32,
    pub audio_level_extension_id: i32,

    pub ready: bool,
    pub updated: bool,
    pub destroyed: bool,
    pub hangingup: bool,

    pub webrtc_sdp: Option<String>,
    pub plain_rtp_sdp: Option<String>,

    pub error_count: u32,
}

impl Default for MediaSession {
    fn default() -> Self {
        Self {
            audio: MediumState::default(),
            video: MediumState::default(),
            opusred_pt: -1,
            simulcast_ssrc: 0,
            require_srtp: false,
            has_srtp_local: false,
            has_srtp_remote: false,
            video_pli_supported: false,
            video_orientation_extension_id: -1,
            audio_level_extension_id: -1,
            ready: false,
            updated: false,
            destroyed: false,
            hangingup: false,
            webrtc_sdp: None,
            plain_rtp_sdp: None,
            error_count: 0,
        }
    }
}

impl MediaSession {
    pub fn medium(&self, is_video: bool) -> &MediumState {
        if is_video { &self.video } else { &self.audio }
    }

    pub fn medium_mut(&mut self, is_video: bool) -> &mut MediumState {
        if is_video { &mut self.video } else { &mut self.audio }
    }

    /// Clears remote state, codec selections, direction flags, switching
    /// contexts, and extension ids. Does not close sockets.
    pub fn reset_media(&mut self) {
        for medium in [&mut self.audio, &mut self.video] {
            medium.remote_ip = None;
            medium.remote_rtp_port = 0;
            medium.remote_rtcp_port = 0;
            medium.pt = -1;
            medium.pt_name = None;
            medium.send = true;
            medium.switching = SwitchingContext::default();
            medium.has = false;
        }
        self.opusred_pt = -1;
        self.video_pli_supported = false;
        self.video_orientation_extension_id = -1;
        self.audio_level_extension_id = -1;
        self.has_srtp_remote = false;
    }

    /// Closes all four media sockets and zeroes local ports/SSRCs/SRTP
    /// state, then resets the rest of the media view.
    pub fn cleanup_media(&mut self) {
        for medium in [&mut self.audio, &mut self.video] {
            medium.rtp_socket = None;
            medium.rtcp_socket = None;
            medium.local_rtp_port = 0;
            medium.local_rtcp_port = 0;
            medium.local_ssrc = 0;
            medium.peer_ssrc = 0;
            medium.encrypt = None;
            medium.decrypt = None;
            medium.srtp_profile = None;
            medium.local_crypto_line = None;
            medium.crypto_tag = 0;
        }
        self.has_srtp_local = false;
        self.ready = false;
        self.reset_media();
    }
}

impl Drop for MediaSession {
    fn drop(&mut self) {
        if self.audio.is_bound() || self.video.is_bound() {
            debug!("media session dropped while sockets were still bound, releasing ports");
        }
    }
}

/// The recorder handles for one session, held under their own mutex so
/// recording start/stop never contends with the media-field lock.
#[derive(Default)]
pub struct Recorders {
    pub user_audio: Option<Box<dyn crate::host::MediaRecorder>>,
    pub user_video: Option<Box<dyn crate::host::MediaRecorder>>,
    pub peer_audio: Option<Box<dyn crate::host::MediaRecorder>>,
    pub peer_video: Option<Box<dyn crate::host::MediaRecorder>>,
}

/// The full per-session aggregate: media state plus recorders, shared
/// between the `SessionManager` map and the running `Relay` task.
pub struct Session {
    pub handle: Uuid,
    pub media: Mutex<MediaSession>,
    pub recorders: Mutex<Recorders>,
    pub notify: Notify,
}

impl Session {
    pub fn new(handle: Uuid) -> Self {
        Self {
            handle,
            media: Mutex::new(MediaSession::default()),
            recorders: Mutex::new(Recorders::default()),
            notify: Notify::new(),
        }
    }

    /// Marks the session updated and wakes the relay so it re-resolves
    /// peer endpoints before the next datagram.
    pub fn mark_updated(&self) {
        {
            let mut media = self.media.lock().unwrap();
            media.updated = true;
        }
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn switching_context_passes_through_first_ssrc_unchanged() {
        let mut ctx = SwitchingContext::default();
        let (seq, ts) = ctx.update(111, 5, 1000);
        assert_eq!((seq, ts), (5, 1000));
    }

    #[test]
    fn switching_context_continues_seq_after_ssrc_change() {
        let mut ctx = SwitchingContext::default();
        ctx.update(111, 100, 48000);
        let (seq, _ts) = ctx.update(222, 0, 0);
        assert_eq!(seq, 101);
    }

    #[test]
    fn reset_media_clears_remote_state_but_keeps_sockets() {
        let mut session = MediaSession::default();
        session.audio.remote_rtp_port = 20000;
        session.audio.pt = 111;
        session.video_pli_supported = true;
        session.reset_media();
        assert_eq!(session.audio.remote_rtp_port, 0);
        assert_eq!(session.audio.pt, -1);
        assert!(!session.video_pli_supported);
    }

    #[test]
    fn cleanup_media_zeroes_local_ports() {
        let mut session = MediaSession::default();
        session.audio.local_rtp_port = 10000;
        session.has_srtp_local = true;
        session.ready = true;
        session.cleanup_media();
        assert_eq!(session.audio.local_rtp_port, 0);
        assert!(!session.has_srtp_local);
        assert!(!session.ready);
    }
}
