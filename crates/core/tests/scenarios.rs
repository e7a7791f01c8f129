//! End-to-end scenarios driving a real `SessionManager` (real UDP sockets,
//! real SRTP, real SDP rewriting) against an in-memory host double.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rtpbridge_core::host::{Host, MediaRecorder, RecorderTarget, RtpExtensions};
use rtpbridge_core::{SessionManager, SrtpGuard};
use rtpbridge_protocol::{BridgeConfig, Jsep, JsepType, Request, RecordingAction, SessionHandle, SrtpMode, SrtpProfile};
use tokio::net::UdpSocket;
use webrtc_util::marshal::{Marshal, Unmarshal};

/// Captures every upcall the core makes so tests can assert on them.
#[derive(Default)]
struct Captured {
    pushed: Vec<(String, serde_json::Value, Option<Jsep>)>,
    relayed_rtp: Vec<(bool, Vec<u8>, RtpExtensions)>,
    pli_to_user: u32,
    recorder_requests: Vec<(RecorderTarget, String)>,
}

struct TestHost {
    state: Mutex<Captured>,
    record_dir: std::path::PathBuf,
}

impl TestHost {
    fn new(record_dir: std::path::PathBuf) -> Self {
        Self {
            state: Mutex::new(Captured::default()),
            record_dir,
        }
    }

    fn last_push(&self) -> (String, serde_json::Value, Option<Jsep>) {
        self.state.lock().unwrap().pushed.last().cloned().expect("no event was pushed")
    }
}

struct TestRecorder {
    target: String,
}

impl MediaRecorder for TestRecorder {
    fn write_rtp(&self, _payload: &[u8], _timestamp: u32, _marker: bool) {}
    fn target(&self) -> &str {
        &self.target
    }
    fn close(&self) {}
}

#[async_trait::async_trait]
impl Host for TestHost {
    async fn relay_rtp(&self, _handle: SessionHandle, is_video: bool, payload: &[u8], extensions: RtpExtensions) {
        self.state.lock().unwrap().relayed_rtp.push((is_video, payload.to_vec(), extensions));
    }

    async fn relay_rtcp(&self, _handle: SessionHandle, _is_video: bool, _payload: &[u8]) {}

    async fn send_pli(&self, _handle: SessionHandle) {
        self.state.lock().unwrap().pli_to_user += 1;
    }

    async fn close_pc(&self, _handle: SessionHandle) {}

    async fn notify_event(&self, _handle: SessionHandle, _payload: serde_json::Value) {}

    fn events_enabled(&self) -> bool {
        false
    }

    async fn push_event(
        &self,
        _handle: SessionHandle,
        transaction: String,
        envelope: serde_json::Value,
        jsep: Option<Jsep>,
    ) {
        self.state.lock().unwrap().pushed.push((transaction, envelope, jsep));
    }

    fn open_recorder(
        &self,
        _handle: SessionHandle,
        target: RecorderTarget,
        codec_name: &str,
        _filename_base: &str,
    ) -> Result<Box<dyn MediaRecorder>, String> {
        self.state.lock().unwrap().recorder_requests.push((target, codec_name.to_string()));
        Ok(Box::new(TestRecorder {
            target: self.record_dir.join(format!("{codec_name}.raw")).display().to_string(),
        }))
    }
}

fn config(port_range: &str, sdp_ip: &str) -> BridgeConfig {
    BridgeConfig {
        local_ip: Some(Ipv4Addr::LOCALHOST.to_string()),
        sdp_ip: Some(sdp_ip.to_string()),
        rtp_port_range: port_range.to_string(),
        events: false,
        dscp_audio_rtp: None,
        dscp_video_rtp: None,
    }
}

const OFFER: &str = "v=0\r\n\
o=- 1 1 IN IP4 127.0.0.1\r\n\
s=-\r\n\
c=IN IP4 127.0.0.1\r\n\
t=0 0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
a=rtpmap:111 opus/48000/2\r\n\
a=sendrecv\r\n";

fn crypto_line(tag: u32, key: &[u8], salt: &[u8]) -> String {
    let mut combined = Vec::with_capacity(key.len() + salt.len());
    combined.extend_from_slice(key);
    combined.extend_from_slice(salt);
    let encoded = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, combined);
    format!("a=crypto:{tag} AES_CM_128_HMAC_SHA1_80 inline:{encoded}\r\n")
}

/// A: generate with an optional-SRTP offer renders an even local port, the
/// advertised address, `RTP/SAVP`, and a single well-formed crypto line.
#[tokio::test]
async fn a_generate_offer_renders_plain_rtp_description_with_optional_srtp() {
    let host = Arc::new(TestHost::new(std::path::PathBuf::from("/tmp")));
    let manager = SessionManager::new(&config("31000-31020", "203.0.113.9"), host.clone());
    let handle = SessionHandle::new_v4();
    manager.create_session(handle);

    manager
        .handle_message(
            handle,
            "t-a".into(),
            Request::Generate {
                info: None,
                srtp: Some(SrtpMode::SdesOptional),
                srtp_profile: None,
                update: false,
                e2ee: false,
            },
            Some(Jsep {
                kind: JsepType::Offer,
                sdp: OFFER.to_string(),
            }),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let (_, envelope, jsep) = host.last_push();
    assert_eq!(envelope["event"], "generated");
    let jsep = jsep.expect("generate emits a jsep");
    assert_eq!(jsep.kind, JsepType::Offer);
    assert!(jsep.sdp.contains("c=IN IP4 203.0.113.9"));
    assert!(jsep.sdp.contains("RTP/SAVP"));
    assert!(jsep.sdp.contains("a=crypto:1 AES_CM_128_HMAC_SHA1_80 inline:"));

    let port: u16 = jsep
        .sdp
        .lines()
        .find(|l| l.starts_with("m=audio"))
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|p| p.parse().ok())
        .expect("rendered description has an audio port");
    assert_eq!(port % 2, 0, "rtp port must be even");
}

/// B: a matching answer with a valid crypto line negotiates SRTP, starts the
/// relay, and the relay actually forwards an inbound RTP frame with its
/// payload untouched (invariant 6).
#[tokio::test]
async fn b_process_answer_negotiates_srtp_and_relay_forwards_rtp() {
    let host = Arc::new(TestHost::new(std::path::PathBuf::from("/tmp")));
    let manager = SessionManager::new(&config("31100-31160", "203.0.113.9"), host.clone());
    let handle = SessionHandle::new_v4();
    manager.create_session(handle);

    manager
        .handle_message(
            handle,
            "t-gen".into(),
            Request::Generate {
                info: None,
                srtp: Some(SrtpMode::SdesOptional),
                srtp_profile: None,
                update: false,
                e2ee: false,
            },
            Some(Jsep {
                kind: JsepType::Offer,
                sdp: OFFER.to_string(),
            }),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let (_, _, generated_jsep) = host.last_push();
    let local_port: u16 = generated_jsep
        .unwrap()
        .sdp
        .lines()
        .find(|l| l.starts_with("m=audio"))
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|p| p.parse().ok())
        .unwrap();

    // The "remote peer" binds a fixed port pair outside the allocator's range.
    let peer_rtp = UdpSocket::bind("127.0.0.1:19000").await.unwrap();
    let key = [0x11u8; 16];
    let salt = [0x22u8; 14];

    let answer = format!(
        "v=0\r\no=- 2 2 IN IP4 127.0.0.1\r\ns=-\r\nc=IN IP4 127.0.0.1\r\nt=0 0\r\n\
m=audio 19000 RTP/SAVP 111\r\na=rtpmap:111 opus/48000/2\r\n{}a=sendrecv\r\n",
        crypto_line(1, &key, &salt)
    );

    manager
        .handle_message(
            handle,
            "t-proc".into(),
            Request::Process {
                kind: JsepType::Answer,
                sdp: answer,
                info: None,
                srtp: None,
                srtp_profile: None,
                update: false,
                e2ee: false,
            },
            None,
        )
        .await
        .unwrap();

    let (_, envelope, _) = host.last_push();
    assert_eq!(envelope["event"], "processed");
    assert_eq!(envelope["srtp"], "AES_CM_128_HMAC_SHA1_80");

    let query = manager.query_session(handle).unwrap();
    assert!(query.audio_srtp);

    // Give the relay task time to start and connect its sockets.
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Encrypt an RTP frame the same way a real peer would, using the key we
    // just offered in the answer's crypto line, and send it in.
    let mut guard = SrtpGuard::new(SrtpProfile::Aes128CmSha1_80, &key, &salt).unwrap();
    let mut packet = rtp::packet::Packet::default();
    packet.header.sequence_number = 1;
    packet.header.ssrc = 0xcafe_babe;
    packet.payload = bytes::Bytes::from_static(b"opus-frame-bytes");
    let plain = packet.marshal().unwrap();
    let protected = guard.encrypt_rtp(&plain).unwrap();

    peer_rtp.send_to(&protected, format!("127.0.0.1:{local_port}")).await.unwrap();

    let mut relayed = None;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let state = host.state.lock().unwrap();
        if let Some(last) = state.relayed_rtp.last() {
            relayed = Some(last.clone());
            break;
        }
    }
    let (is_video, payload, _extensions) = relayed.expect("relay forwarded the inbound rtp frame");
    assert!(!is_video);

    let mut cursor: &[u8] = &payload;
    let forwarded = rtp::packet::Packet::unmarshal(&mut cursor).unwrap();
    assert_eq!(forwarded.payload.as_ref(), b"opus-frame-bytes");
}

/// C: SRTP mandated on a generate answer while no remote crypto was ever
/// observed is rejected with `TOO_STRICT`, and no session state mutates.
#[tokio::test]
async fn c_srtp_mandate_mismatch_is_rejected_without_mutating_state() {
    let host = Arc::new(TestHost::new(std::path::PathBuf::from("/tmp")));
    let manager = SessionManager::new(&config("31200-31220", "203.0.113.9"), host.clone());
    let handle = SessionHandle::new_v4();
    manager.create_session(handle);

    let before = manager.query_session(handle).unwrap();

    let answer_sdp = OFFER.replace("m=audio 9 UDP/TLS/RTP/SAVPF 111", "m=audio 20000 RTP/AVP 111");
    let err = manager
        .handle_message(
            handle,
            "t-c".into(),
            Request::Generate {
                info: None,
                srtp: Some(SrtpMode::SdesMandatory),
                srtp_profile: None,
                update: false,
                e2ee: false,
            },
            Some(Jsep {
                kind: JsepType::Answer,
                sdp: answer_sdp,
            }),
        )
        .await
        .unwrap_err();

    assert_eq!(err.code(), 450);
    let after = manager.query_session(handle).unwrap();
    assert_eq!(before.audio_srtp, after.audio_srtp);
    assert!(!after.audio_srtp);
}

/// D: starting a user-audio recorder opens it with the negotiated codec
/// name and also requests a keyframe when the user-video recorder starts.
#[tokio::test]
async fn d_recording_start_user_audio_opens_recorder_with_negotiated_codec() {
    let host = Arc::new(TestHost::new(std::path::PathBuf::from("/tmp")));
    let manager = SessionManager::new(&config("31300-31320", "203.0.113.9"), host.clone());
    let handle = SessionHandle::new_v4();
    manager.create_session(handle);

    manager
        .handle_message(
            handle,
            "t-gen".into(),
            Request::Generate {
                info: None,
                srtp: None,
                srtp_profile: None,
                update: false,
                e2ee: false,
            },
            Some(Jsep {
                kind: JsepType::Offer,
                sdp: OFFER.to_string(),
            }),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let answer = OFFER.replace("m=audio 9 UDP/TLS/RTP/SAVPF 111", "m=audio 20000 RTP/AVP 111");
    manager
        .handle_message(
            handle,
            "t-proc".into(),
            Request::Process {
                kind: JsepType::Answer,
                sdp: answer,
                info: None,
                srtp: None,
                srtp_profile: None,
                update: false,
                e2ee: false,
            },
            None,
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    manager
        .handle_message(
            handle,
            "t-rec".into(),
            Request::Recording {
                action: RecordingAction::Start,
                audio: true,
                video: false,
                peer_audio: false,
                peer_video: false,
                filename: Some("call-123".into()),
            },
            None,
        )
        .await
        .unwrap();

    let (_, envelope, _) = host.last_push();
    assert_eq!(envelope["event"], "recordingupdated");

    let requests = host.state.lock().unwrap().recorder_requests.clone();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].0, RecorderTarget::UserAudio);
    assert_eq!(requests[0].1, "opus");

    let query = manager.query_session(handle).unwrap();
    assert!(query.audio_recording.is_some());
}

/// E: a keyframe request for the peer while `video_pli_supported` is false
/// (this session never negotiated video) sends nothing and still reports
/// `keyframesent`.
#[tokio::test]
async fn e_keyframe_to_peer_without_pli_support_sends_no_rtcp() {
    let host = Arc::new(TestHost::new(std::path::PathBuf::from("/tmp")));
    let manager = SessionManager::new(&config("31400-31420", "203.0.113.9"), host.clone());
    let handle = SessionHandle::new_v4();
    manager.create_session(handle);

    manager
        .handle_message(handle, "t-kf".into(), Request::Keyframe { user: false, peer: true }, None)
        .await
        .unwrap();

    let (_, envelope, _) = host.last_push();
    assert_eq!(envelope["event"], "keyframesent");
    assert_eq!(host.state.lock().unwrap().pli_to_user, 0);
}

/// F: a second `process` call with a changed remote connection address
/// reports `changed` via the `update` field being honored and the session
/// remains usable (peer-update path does not tear anything down).
#[tokio::test]
async fn f_peer_update_with_changed_remote_address_is_accepted() {
    let host = Arc::new(TestHost::new(std::path::PathBuf::from("/tmp")));
    let manager = SessionManager::new(&config("31500-31520", "203.0.113.9"), host.clone());
    let handle = SessionHandle::new_v4();
    manager.create_session(handle);

    manager
        .handle_message(
            handle,
            "t-gen".into(),
            Request::Generate {
                info: None,
                srtp: None,
                srtp_profile: None,
                update: false,
                e2ee: false,
            },
            Some(Jsep {
                kind: JsepType::Offer,
                sdp: OFFER.to_string(),
            }),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let first_answer = OFFER.replace("m=audio 9 UDP/TLS/RTP/SAVPF 111", "m=audio 20000 RTP/AVP 111");
    manager
        .handle_message(
            handle,
            "t-proc-1".into(),
            Request::Process {
                kind: JsepType::Answer,
                sdp: first_answer,
                info: None,
                srtp: None,
                srtp_profile: None,
                update: false,
                e2ee: false,
            },
            None,
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let second_update = OFFER
        .replace("m=audio 9 UDP/TLS/RTP/SAVPF 111", "m=audio 20000 RTP/AVP 111")
        .replace("c=IN IP4 127.0.0.1", "c=IN IP4 203.0.113.9");
    manager
        .handle_message(
            handle,
            "t-proc-2".into(),
            Request::Process {
                kind: JsepType::Answer,
                sdp: second_update,
                info: None,
                srtp: None,
                srtp_profile: None,
                update: true,
                e2ee: false,
            },
            None,
        )
        .await
        .unwrap();

    let (_, envelope, _) = host.last_push();
    assert_eq!(envelope["event"], "processed");
    assert_eq!(envelope["update"], true);

    // The session is still alive and queryable after the update.
    assert!(manager.query_session(handle).is_some());
}
