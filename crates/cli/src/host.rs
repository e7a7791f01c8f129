//! A demo [`rtpbridge_core::Host`] that has no real WebRTC engine or
//! plugin bus behind it: upcalls are rendered as newline-delimited JSON on
//! stdout, and recordings are flat length-prefixed payload dumps on disk.
//! Good enough to drive `rtpbridge-core` end to end from a terminal.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use rtpbridge_core::{AudioLevelExtension, Host, MediaRecorder, RecorderTarget, RtpExtensions, VideoOrientationExtension};
use rtpbridge_protocol::{Jsep, SessionHandle};
use serde::Serialize;
use tracing::debug;

#[derive(Serialize)]
struct Upcall<'a> {
    upcall: &'a str,
    handle: SessionHandle,
    #[serde(skip_serializing_if = "Option::is_none")]
    transaction: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    is_video: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bytes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    audio_level: Option<AudioLevelExtension>,
    #[serde(skip_serializing_if = "Option::is_none")]
    video_orientation: Option<VideoOrientationExtension>,
    #[serde(skip_serializing_if = "Option::is_none")]
    event: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    jsep: Option<&'a Jsep>,
}

fn print_line<T: Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(line) => println!("{line}"),
        Err(e) => debug!("failed to serialize upcall: {e}"),
    }
}

pub struct CliHost {
    pub record_dir: PathBuf,
    pub events_enabled: bool,
}

#[async_trait]
impl Host for CliHost {
    async fn relay_rtp(&self, handle: SessionHandle, is_video: bool, payload: &[u8], extensions: RtpExtensions) {
        print_line(&Upcall {
            upcall: "relay_rtp",
            handle,
            transaction: None,
            is_video: Some(is_video),
            bytes: Some(payload.len()),
            audio_level: extensions.audio_level,
            video_orientation: extensions.video_orientation,
            event: None,
            jsep: None,
        });
    }

    async fn relay_rtcp(&self, handle: SessionHandle, is_video: bool, payload: &[u8]) {
        print_line(&Upcall {
            upcall: "relay_rtcp",
            handle,
            transaction: None,
            is_video: Some(is_video),
            bytes: Some(payload.len()),
            audio_level: None,
            video_orientation: None,
            event: None,
            jsep: None,
        });
    }

    async fn send_pli(&self, handle: SessionHandle) {
        print_line(&Upcall {
            upcall: "send_pli",
            handle,
            transaction: None,
            is_video: None,
            bytes: None,
            audio_level: None,
            video_orientation: None,
            event: None,
            jsep: None,
        });
    }

    async fn close_pc(&self, handle: SessionHandle) {
        print_line(&Upcall {
            upcall: "close_pc",
            handle,
            transaction: None,
            is_video: None,
            bytes: None,
            audio_level: None,
            video_orientation: None,
            event: None,
            jsep: None,
        });
    }

    async fn notify_event(&self, handle: SessionHandle, payload: serde_json::Value) {
        if !self.events_enabled {
            return;
        }
        print_line(&Upcall {
            upcall: "notify_event",
            handle,
            transaction: None,
            is_video: None,
            bytes: None,
            audio_level: None,
            video_orientation: None,
            event: Some(payload),
            jsep: None,
        });
    }

    fn events_enabled(&self) -> bool {
        self.events_enabled
    }

    async fn push_event(
        &self,
        handle: SessionHandle,
        transaction: String,
        envelope: serde_json::Value,
        jsep: Option<Jsep>,
    ) {
        print_line(&Upcall {
            upcall: "push_event",
            handle,
            transaction: Some(&transaction),
            is_video: None,
            bytes: None,
            audio_level: None,
            video_orientation: None,
            event: Some(envelope),
            jsep: jsep.as_ref(),
        });
    }

    fn open_recorder(
        &self,
        handle: SessionHandle,
        target: RecorderTarget,
        codec_name: &str,
        filename_base: &str,
    ) -> Result<Box<dyn MediaRecorder>, String> {
        let suffix = match target {
            RecorderTarget::UserAudio => "user-audio",
            RecorderTarget::UserVideo => "user-video",
            RecorderTarget::PeerAudio => "peer-audio",
            RecorderTarget::PeerVideo => "peer-video",
        };
        let filename = format!("{filename_base}-{suffix}.{codec_name}.raw");
        let path = self.record_dir.join(filename);
        let file = File::create(&path).map_err(|e| format!("failed to open recorder for {handle}: {e}"))?;
        Ok(Box::new(FileRecorder {
            target: path.display().to_string(),
            file: Mutex::new(file),
        }))
    }
}

/// Appends each RTP payload as a 4-byte little-endian length prefix
/// followed by the raw bytes. No container format: framing is the only
/// concession needed to make the dump byte-addressable later.
struct FileRecorder {
    target: String,
    file: Mutex<File>,
}

impl MediaRecorder for FileRecorder {
    fn write_rtp(&self, payload: &[u8], _timestamp: u32, _marker: bool) {
        let mut file = self.file.lock().unwrap();
        let len = payload.len() as u32;
        if file.write_all(&len.to_le_bytes()).is_err() {
            return;
        }
        let _ = file.write_all(payload);
    }

    fn target(&self) -> &str {
        &self.target
    }

    fn close(&self) {
        let _ = self.file.lock().unwrap().flush();
    }
}
