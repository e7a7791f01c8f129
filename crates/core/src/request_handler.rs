//! The request state machine: `generate`, `process`, `hangup`, `recording`,
//! `keyframe`. Each entry point validates its input, mutates `MediaSession`
//! through `SDPBridge`/`PortAllocator`/`SrtpContext`, and returns the event
//! to push back to the caller plus an optional WebRTC-side description.

use std::sync::Arc;

use rtpbridge_protocol::{
    Error, Event, Jsep, JsepType, RecordingAction, Request, Result, SrtpMode, SrtpProfile,
};
use tracing::info;

use crate::host::{Host, RecorderTarget};
use crate::media_session::Session;
use crate::port_allocator::PortAllocator;
use crate::sdp_bridge;
use crate::srtp::SrtpGuard;

/// A request's outcome: the event to emit, and an optional WebRTC-side
/// description to signal back alongside it.
pub struct Outcome {
    pub event: Event,
    pub jsep: Option<Jsep>,
    /// Set when this request just brought the session to `ready`; the
    /// caller (`SessionManager`) spawns the relay task in response.
    pub start_relay: bool,
}

impl Outcome {
    fn new(event: Event) -> Self {
        Self {
            event,
            jsep: None,
            start_relay: false,
        }
    }

    fn with_jsep(event: Event, jsep: Jsep) -> Self {
        Self {
            event,
            jsep: Some(jsep),
            start_relay: false,
        }
    }
}

fn reject_application_and_e2ee(sdp_text: &str, e2ee: bool) -> Result<()> {
    if e2ee {
        return Err(Error::InvalidElement("end-to-end-encrypted media is not supported".into()));
    }
    if sdp_text.contains("m=application") {
        return Err(Error::MissingSdp("application data channels are not supported".into()));
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub async fn handle<H: Host>(
    session: &Arc<Session>,
    allocator: &PortAllocator,
    advertised_ip: &str,
    dscp_audio_rtp: Option<u8>,
    dscp_video_rtp: Option<u8>,
    host: &H,
    request: Request,
    jsep: Option<Jsep>,
) -> Result<Outcome> {
    match request {
        Request::Generate {
            srtp,
            srtp_profile,
            update,
            e2ee,
            ..
        } => {
            handle_generate(
                session,
                allocator,
                advertised_ip,
                dscp_audio_rtp,
                dscp_video_rtp,
                srtp,
                srtp_profile,
                update,
                e2ee,
                jsep,
            )
            .await
        }
        Request::Process {
            kind,
            sdp,
            srtp,
            srtp_profile,
            update,
            e2ee,
            ..
        } => handle_process(session, srtp, srtp_profile, update, e2ee, kind, sdp).await,
        Request::Hangup {} => handle_hangup(session, host).await,
        Request::Recording {
            action,
            audio,
            video,
            peer_audio,
            peer_video,
            filename,
        } => handle_recording(session, host, action, audio, video, peer_audio, peer_video, filename).await,
        Request::Keyframe { user, peer } => handle_keyframe(session, host, user, peer).await,
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_generate(
    session: &Arc<Session>,
    allocator: &PortAllocator,
    advertised_ip: &str,
    dscp_audio_rtp: Option<u8>,
    dscp_video_rtp: Option<u8>,
    srtp: Option<SrtpMode>,
    srtp_profile: Option<SrtpProfile>,
    update: bool,
    e2ee: bool,
    jsep: Option<Jsep>,
) -> Result<Outcome> {
    let jsep = jsep.ok_or_else(|| Error::MissingSdp("generate requires an attached webrtc description".into()))?;
    reject_application_and_e2ee(&jsep.sdp, e2ee)?;

    let mut description = sdp_bridge::parse(&jsep.sdp)?;
    let is_answer = match jsep.kind {
        JsepType::Offer => false,
        JsepType::Answer => true,
    };

    let mut media = session.media.lock().unwrap();

    if !is_answer && !update {
        media.reset_media();
        media.has_srtp_local = false;
    }

    let do_srtp_requested = srtp.is_some();
    let mandatory = matches!(srtp, Some(SrtpMode::SdesMandatory));

    if is_answer {
        let effective_require_srtp = media.require_srtp || mandatory;
        if effective_require_srtp && !media.has_srtp_remote {
            return Err(Error::TooStrict("srtp required but remote offered none".into()));
        }
        media.has_srtp_local = do_srtp_requested || media.has_srtp_remote;
        media.require_srtp = effective_require_srtp;
    } else {
        media.has_srtp_local = do_srtp_requested;
        media.require_srtp = mandatory;
    }

    for md in &description.media_descriptions {
        let is_video = md.media_name.media == "video";
        let has = md.media_name.port.value != 0;
        if md.media_name.media == "audio" || md.media_name.media == "video" {
            media.medium_mut(is_video).has = has;
            if has && media.has_srtp_local {
                let profile = srtp_profile.unwrap_or(SrtpProfile::Aes128CmSha1_80);
                media.medium_mut(is_video).srtp_profile.get_or_insert(profile);
            }
        }
    }

    for is_video in [false, true] {
        if !media.medium(is_video).has {
            continue;
        }
        if media.medium(is_video).local_rtp_port != 0 && update {
            continue;
        }
        let dscp = if is_video { dscp_video_rtp } else { dscp_audio_rtp };
        let pair = allocator.allocate_pair(dscp).await?;
        let medium = media.medium_mut(is_video);
        medium.local_rtp_port = pair.rtp_port;
        medium.local_rtcp_port = pair.rtcp_port;
        medium.rtp_socket = Some(Arc::new(pair.rtp_socket));
        medium.rtcp_socket = Some(Arc::new(pair.rtcp_socket));
    }

    sdp_bridge::detect_extensions(&mut media, &description);

    let rendered = sdp_bridge::manipulate(&mut media, &mut description, is_answer, advertised_ip)?;
    media.webrtc_sdp = Some(rendered.clone());

    let kind = jsep.kind;
    info!(handle = %session.handle, ?kind, "generated plain-rtp description");

    Ok(Outcome::with_jsep(
        Event::Generated {
            kind,
            sdp: rendered.clone(),
            update,
        },
        Jsep { kind, sdp: rendered },
    ))
}

async fn handle_process(
    session: &Arc<Session>,
    srtp: Option<SrtpMode>,
    _srtp_profile: Option<SrtpProfile>,
    update_flag: bool,
    e2ee: bool,
    kind: JsepType,
    sdp: String,
) -> Result<Outcome> {
    reject_application_and_e2ee(&sdp, e2ee)?;

    let description = sdp_bridge::parse(&sdp)?;
    let is_answer = matches!(kind, JsepType::Answer);

    let mut media = session.media.lock().unwrap();
    let is_update = update_flag || media.ready;

    if matches!(srtp, Some(SrtpMode::SdesMandatory)) {
        media.require_srtp = true;
    }

    let changed = sdp_bridge::process(&mut media, &description, is_answer, is_update)?;

    if !media.audio.has && !media.video.has {
        return Err(Error::MissingSdp("neither audio nor video present".into()));
    }
    if media.audio.remote_ip.is_none() && media.video.remote_ip.is_none() {
        return Err(Error::MissingSdp("no remote connection address present".into()));
    }
    if media.require_srtp && !media.has_srtp_remote {
        return Err(Error::TooStrict("srtp required but remote crypto missing".into()));
    }

    media.plain_rtp_sdp = Some(sdp.clone());

    if is_update && changed {
        drop(media);
        session.mark_updated();
    } else {
        drop(media);
    }

    let mut media = session.media.lock().unwrap();
    let srtp_name = if media.has_srtp_remote {
        media.audio.srtp_profile.or(media.video.srtp_profile).map(|p| p.name_and_master_len().0)
    } else {
        None
    };

    let became_ready = is_answer && !update_flag && !media.ready;
    if became_ready {
        media.ready = true;
        // The relay's first iteration only calls `connect()` on the media
        // sockets when it observes `updated`; becoming ready needs the same
        // nudge as a later peer-address change does.
        media.updated = true;
    }
    drop(media);

    if became_ready {
        info!(handle = %session.handle, "session negotiated, starting relay");
        session.notify.notify_waiters();
    }

    let mut outcome = Outcome::with_jsep(
        Event::Processed {
            srtp: srtp_name,
            update: update_flag,
        },
        Jsep { kind, sdp },
    );
    outcome.start_relay = became_ready;
    Ok(outcome)
}

async fn handle_hangup<H: Host>(session: &Arc<Session>, host: &H) -> Result<Outcome> {
    {
        let mut media = session.media.lock().unwrap();
        media.hangingup = true;
    }
    session.notify.notify_waiters();
    host.close_pc(session.handle).await;
    Ok(Outcome::new(Event::Hangingup {}))
}

#[allow(clippy::too_many_arguments)]
async fn handle_recording<H: Host>(
    session: &Arc<Session>,
    host: &H,
    action: RecordingAction,
    audio: bool,
    video: bool,
    peer_audio: bool,
    peer_video: bool,
    filename: Option<String>,
) -> Result<Outcome> {
    if !audio && !video && !peer_audio && !peer_video {
        return Err(Error::MissingElement("recording needs at least one direction selected".into()));
    }

    match action {
        RecordingAction::Start => {
            let base = filename.unwrap_or_else(|| session.handle.to_string());
            let (audio_codec, video_codec, opusred) = {
                let media = session.media.lock().unwrap();
                (
                    media.audio.pt_name.clone().unwrap_or_else(|| "unknown".into()),
                    media.video.pt_name.clone().unwrap_or_else(|| "unknown".into()),
                    media.opusred_pt,
                )
            };

            if audio {
                let mut codec = audio_codec.clone();
                if opusred > 0 {
                    codec.push_str("+red");
                }
                let recorder = host
                    .open_recorder(session.handle, RecorderTarget::UserAudio, &codec, &base)
                    .map_err(Error::RecordingError)?;
                session.recorders.lock().unwrap().user_audio = Some(recorder);
            }
            if video {
                let recorder = host
                    .open_recorder(session.handle, RecorderTarget::UserVideo, &video_codec, &base)
                    .map_err(Error::RecordingError)?;
                session.recorders.lock().unwrap().user_video = Some(recorder);
                host.send_pli(session.handle).await;
            }
            if peer_audio {
                let recorder = host
                    .open_recorder(session.handle, RecorderTarget::PeerAudio, &audio_codec, &base)
                    .map_err(Error::RecordingError)?;
                session.recorders.lock().unwrap().peer_audio = Some(recorder);
            }
            if peer_video {
                let recorder = host
                    .open_recorder(session.handle, RecorderTarget::PeerVideo, &video_codec, &base)
                    .map_err(Error::RecordingError)?;
                session.recorders.lock().unwrap().peer_video = Some(recorder);
            }
        }
        RecordingAction::Stop => {
            let mut recorders = session.recorders.lock().unwrap();
            if audio {
                if let Some(r) = recorders.user_audio.take() {
                    r.close();
                }
            }
            if video {
                if let Some(r) = recorders.user_video.take() {
                    r.close();
                }
            }
            if peer_audio {
                if let Some(r) = recorders.peer_audio.take() {
                    r.close();
                }
            }
            if peer_video {
                if let Some(r) = recorders.peer_video.take() {
                    r.close();
                }
            }
        }
    }

    Ok(Outcome::new(Event::Recordingupdated {}))
}

async fn handle_keyframe<H: Host>(session: &Arc<Session>, host: &H, user: bool, peer: bool) -> Result<Outcome> {
    if user {
        host.send_pli(session.handle).await;
    }
    if peer {
        let supported = session.media.lock().unwrap().video_pli_supported;
        if supported {
            if let Err(e) = crate::relay::send_pli_to_peer(session).await {
                return Err(Error::IoError(format!("failed to send pli to peer: {e}")));
            }
        }
    }
    Ok(Outcome::new(Event::Keyframesent {}))
}

/// Build the SRTP guard pair for a medium from already-known negotiated
/// key material. Exposed for `generate`/`process` to share the install
/// logic with `SDPBridge::manipulate`'s lazy local-key generation.
pub fn install_remote_guard(profile: SrtpProfile, key: &[u8], salt: &[u8]) -> Result<SrtpGuard> {
    SrtpGuard::new(profile, key, salt)
}
