use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque session handle, minted by the embedding host on `create_session`.
pub type SessionHandle = Uuid;

/// SDES-SRTP negotiation mode requested by `generate`/`process`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SrtpMode {
    SdesOptional,
    SdesMandatory,
}

/// SRTP cipher/auth profile, named exactly as it appears in `a=crypto` lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SrtpProfile {
    #[serde(rename = "AES_CM_128_HMAC_SHA1_32")]
    Aes128CmSha1_32,
    #[serde(rename = "AES_CM_128_HMAC_SHA1_80")]
    Aes128CmSha1_80,
    #[serde(rename = "AEAD_AES_128_GCM")]
    AeadAes128Gcm,
    #[serde(rename = "AEAD_AES_256_GCM")]
    AeadAes256Gcm,
}

impl SrtpProfile {
    /// The `a=crypto` profile token, and the raw master-key-plus-salt
    /// length in bytes, per the profile table.
    pub fn name_and_master_len(self) -> (&'static str, usize) {
        match self {
            SrtpProfile::Aes128CmSha1_32 => ("AES_CM_128_HMAC_SHA1_32", 30),
            SrtpProfile::Aes128CmSha1_80 => ("AES_CM_128_HMAC_SHA1_80", 30),
            SrtpProfile::AeadAes128Gcm => ("AEAD_AES_128_GCM", 28),
            SrtpProfile::AeadAes256Gcm => ("AEAD_AES_256_GCM", 44),
        }
    }

    pub fn key_len(self) -> usize {
        match self {
            SrtpProfile::Aes128CmSha1_32 | SrtpProfile::Aes128CmSha1_80 => 16,
            SrtpProfile::AeadAes128Gcm => 16,
            SrtpProfile::AeadAes256Gcm => 32,
        }
    }

    pub fn salt_len(self) -> usize {
        match self {
            SrtpProfile::Aes128CmSha1_32 | SrtpProfile::Aes128CmSha1_80 => 14,
            SrtpProfile::AeadAes128Gcm | SrtpProfile::AeadAes256Gcm => 12,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "AES_CM_128_HMAC_SHA1_32" => Some(SrtpProfile::Aes128CmSha1_32),
            "AES_CM_128_HMAC_SHA1_80" => Some(SrtpProfile::Aes128CmSha1_80),
            "AEAD_AES_128_GCM" => Some(SrtpProfile::AeadAes128Gcm),
            "AEAD_AES_256_GCM" => Some(SrtpProfile::AeadAes256Gcm),
            _ => None,
        }
    }
}

/// A session description, tagged with its offer/answer role.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Jsep {
    #[serde(rename = "type")]
    pub kind: JsepType,
    pub sdp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JsepType {
    Offer,
    Answer,
}

/// Inbound requests the host enqueues for the single request worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum Request {
    Generate {
        #[serde(skip_serializing_if = "Option::is_none")]
        info: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        srtp: Option<SrtpMode>,
        #[serde(skip_serializing_if = "Option::is_none")]
        srtp_profile: Option<SrtpProfile>,
        #[serde(default)]
        update: bool,
        #[serde(default)]
        e2ee: bool,
    },
    Process {
        #[serde(rename = "type")]
        kind: JsepType,
        sdp: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        info: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        srtp: Option<SrtpMode>,
        #[serde(skip_serializing_if = "Option::is_none")]
        srtp_profile: Option<SrtpProfile>,
        #[serde(default)]
        update: bool,
        #[serde(default)]
        e2ee: bool,
    },
    Hangup {},
    Recording {
        action: RecordingAction,
        #[serde(default)]
        audio: bool,
        #[serde(default)]
        video: bool,
        #[serde(default)]
        peer_audio: bool,
        #[serde(default)]
        peer_video: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
    },
    Keyframe {
        #[serde(default)]
        user: bool,
        #[serde(default)]
        peer: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingAction {
    Start,
    Stop,
}

/// Asynchronous responses pushed back to the caller via `push_event`.
/// Every variant also carries `{nosip:"event"}` in the rendered JSON,
/// added by the caller when serializing the final envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    Generated {
        #[serde(rename = "type")]
        kind: JsepType,
        sdp: String,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        update: bool,
    },
    Processed {
        #[serde(skip_serializing_if = "Option::is_none")]
        srtp: Option<&'static str>,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        update: bool,
    },
    Hangingup {},
    Recordingupdated {},
    Keyframesent {},
}

/// Full JSON envelope wrapping an [`Event`], matching the `{nosip:"event"}`
/// marker the external interface prescribes for every response.
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    pub nosip: &'static str,
    #[serde(flatten)]
    pub event: Event,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<serde_json::Value>,
}

impl EventEnvelope {
    pub fn new(event: Event, info: Option<serde_json::Value>) -> Self {
        Self {
            nosip: "event",
            event,
            info,
        }
    }
}

/// Snapshot returned by the `query_session` downcall.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionQuery {
    pub audio_srtp: bool,
    pub video_srtp: bool,
    pub audio_recording: Option<String>,
    pub video_recording: Option<String>,
    pub peer_audio_recording: Option<String>,
    pub peer_video_recording: Option<String>,
}
