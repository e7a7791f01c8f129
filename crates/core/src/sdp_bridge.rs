//! The two pure functions that tie a session's WebRTC and plain-RTP media
//! state together: `process` ingests a remote description, `manipulate`
//! rewrites one into the bridge's own plain-RTP view.

use std::io::Cursor;

use rtpbridge_protocol::{Error, Result};
use sdp::description::common::{Address, Attribute, ConnectionInformation};
use sdp::description::session::SessionDescription;
use tracing::debug;

use crate::media_session::MediaSession;
use crate::srtp::{LocalKeying, RemoteKeying};

const VIDEO_ORIENTATION_URI: &str = "urn:3gpp:video-orientation";
const AUDIO_LEVEL_URI: &str = "urn:ietf:params:rtp-hdrext:ssrc-audio-level";

pub fn parse(sdp_text: &str) -> Result<SessionDescription> {
    let mut reader = Cursor::new(sdp_text.as_bytes());
    SessionDescription::unmarshal(&mut reader)
        .map_err(|e| Error::InvalidSdp(format!("failed to parse session description: {e}")))
}

fn connection_address(info: &ConnectionInformation) -> Option<String> {
    info.address.as_ref().map(|a| a.address.clone())
}

fn has_direction(attrs: &[Attribute], key: &str) -> bool {
    attrs.iter().any(|a| a.key == key)
}

fn outbound_allowed(attrs: &[Attribute]) -> bool {
    !(has_direction(attrs, "sendonly") || has_direction(attrs, "inactive"))
}

fn find_red_payload_type(attrs: &[Attribute]) -> Option<String> {
    attrs.iter().find_map(|a| {
        if a.key != "rtpmap" {
            return None;
        }
        let value = a.value.as_deref()?;
        let (pt, rest) = value.split_once(' ')?;
        rest.to_ascii_lowercase()
            .starts_with("red/")
            .then(|| pt.to_string())
    })
}

fn rtpmap_name(attrs: &[Attribute], pt: &str) -> Option<String> {
    attrs.iter().find_map(|a| {
        if a.key != "rtpmap" {
            return None;
        }
        let value = a.value.as_deref()?;
        let (this_pt, rest) = value.split_once(' ')?;
        if this_pt != pt {
            return None;
        }
        rest.split('/').next().map(|s| s.to_string())
    })
}

fn video_pli_supported(attrs: &[Attribute]) -> bool {
    attrs.iter().any(|a| {
        a.key == "rtcp-fb"
            && a.value
                .as_deref()
                .map(|v| v.split_whitespace().any(|tok| tok == "pli"))
                .unwrap_or(false)
    })
}

fn extension_id(attrs: &[Attribute], uri: &str) -> i32 {
    attrs
        .iter()
        .find_map(|a| {
            if a.key != "extmap" {
                return None;
            }
            let value = a.value.as_deref()?;
            let (id, rest) = value.split_once(' ')?;
            (rest.trim() == uri)
                .then(|| id.trim_end_matches(|c: char| c == '/' || c.is_alphabetic()))
                .and_then(|id| id.parse::<i32>().ok())
        })
        .unwrap_or(-1)
}

/// Detect the video-orientation and audio-level header-extension ids
/// advertised in `description`, used by `generate` against the WebRTC-side
/// offer/answer (separately from `process`, which does the same against
/// the plain-RTP side).
pub fn detect_extensions(media: &mut MediaSession, description: &SessionDescription) {
    for md in &description.media_descriptions {
        match md.media_name.media.as_str() {
            "video" => {
                media.video_pli_supported = video_pli_supported(&md.attributes);
                media.video_orientation_extension_id = extension_id(&md.attributes, VIDEO_ORIENTATION_URI);
            }
            "audio" => {
                media.audio_level_extension_id = extension_id(&md.attributes, AUDIO_LEVEL_URI);
            }
            _ => {}
        }
    }
}

/// Ingest a remote description and derive media state. Returns whether
/// anything that matters to the relay (remote addresses/ports) changed —
/// only meaningful when `is_update` is set.
pub fn process(
    media: &mut MediaSession,
    description: &SessionDescription,
    is_answer: bool,
    is_update: bool,
) -> Result<bool> {
    let session_ip = description
        .connection_information
        .as_ref()
        .and_then(connection_address);

    let mut changed = false;

    for md in &description.media_descriptions {
        let is_video = match md.media_name.media.as_str() {
            "video" => true,
            "audio" => false,
            _ => continue,
        };

        let prev_ip;
        let prev_port;
        {
            let m = media.medium(is_video);
            prev_ip = m.remote_ip.clone();
            prev_port = m.remote_rtp_port;
        }

        let port = md.media_name.port.value as u16;
        let has_m = port != 0;

        let ip = md
            .connection_information
            .as_ref()
            .and_then(connection_address)
            .or_else(|| session_ip.clone());

        if md.media_name.protos.iter().any(|p| p.starts_with("SAVP")) {
            media.require_srtp = true;
        }

        let m = media.medium_mut(is_video);
        m.has = has_m;
        m.remote_ip = ip.clone();
        if has_m {
            m.remote_rtp_port = port;
            m.remote_rtcp_port = port + 1;
        } else {
            m.remote_rtp_port = 0;
            m.remote_rtcp_port = 0;
        }
        m.send = outbound_allowed(&md.attributes);

        for attr in &md.attributes {
            if attr.key != "crypto" {
                continue;
            }
            let Some(value) = attr.value.as_deref() else {
                continue;
            };
            let mut fields = value.splitn(3, ' ');
            let (Some(tag), Some(_profile), Some(_)) = (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            let Ok(tag_num) = tag.parse::<u32>() else {
                continue;
            };
            if is_answer && media.medium(is_video).crypto_tag != 0 && media.medium(is_video).crypto_tag != tag_num {
                continue;
            }
            if media.medium(is_video).decrypt.is_some() {
                break;
            }
            match RemoteKeying::parse(value) {
                Ok(remote) => {
                    let guard = crate::srtp::SrtpGuard::new(
                        remote.profile,
                        &remote.master_key,
                        &remote.master_salt,
                    )?;
                    let m = media.medium_mut(is_video);
                    m.decrypt = Some(guard);
                    m.crypto_tag = tag_num;
                    m.srtp_profile = Some(remote.profile);
                    media.has_srtp_remote = true;
                }
                Err(e) => debug!("ignoring malformed crypto line: {e}"),
            }
            break;
        }

        if is_video {
            media.video_pli_supported = video_pli_supported(&md.attributes);
            media.video_orientation_extension_id = extension_id(&md.attributes, VIDEO_ORIENTATION_URI);
        } else {
            media.audio_level_extension_id = extension_id(&md.attributes, AUDIO_LEVEL_URI);
        }

        if is_answer {
            let red_pt = find_red_payload_type(&md.attributes);
            let (pt, opusred) = match (&red_pt, md.media_name.formats.first(), md.media_name.formats.get(1))
            {
                (Some(red), Some(first), Some(second)) if first == red => {
                    (second.clone(), red.parse::<i32>().ok())
                }
                _ => (md.media_name.formats.first().cloned().unwrap_or_default(), None),
            };
            if !pt.is_empty() {
                let pt_name = rtpmap_name(&md.attributes, &pt);
                let m = media.medium_mut(is_video);
                m.pt = pt.parse().unwrap_or(-1);
                m.pt_name = pt_name;
            }
            if !is_video {
                if let Some(red) = opusred {
                    media.opusred_pt = red;
                }
            }
        }

        if is_update {
            let m = media.medium(is_video);
            if m.remote_ip != prev_ip || m.remote_rtp_port != prev_port {
                changed = true;
            }
        }
    }

    Ok(changed)
}

/// Rewrite `description` in place into the bridge's plain-RTP view:
/// advertised connection address, local ports, SRTP crypto line when
/// enabled, and the correct `RTP/SAVP` vs `RTP/AVP` transport token.
/// Returns the rendered text.
pub fn manipulate(
    media: &mut MediaSession,
    description: &mut SessionDescription,
    is_answer: bool,
    advertised_ip: &str,
) -> Result<String> {
    let address_type = if advertised_ip.contains(':') { "IP6" } else { "IP4" };

    description.connection_information = Some(ConnectionInformation {
        network_type: "IN".to_string(),
        address_type: address_type.to_string(),
        address: Some(Address {
            address: advertised_ip.to_string(),
            ttl: None,
            range: None,
        }),
    });

    for md in &mut description.media_descriptions {
        let is_video = match md.media_name.media.as_str() {
            "video" => true,
            "audio" => false,
            _ => continue,
        };

        // The transport token reflects whether this side is using SRTP at
        // all, not the separate mandate-on-remote-absence policy.
        let transport = if media.has_srtp_local { "SAVP" } else { "AVP" };
        md.media_name.protos = vec!["RTP".to_string(), transport.to_string()];

        let local_port = media.medium(is_video).local_rtp_port;
        md.media_name.port.value = local_port as isize;
        md.media_name.port.range = None;

        md.connection_information = Some(ConnectionInformation {
            network_type: "IN".to_string(),
            address_type: address_type.to_string(),
            address: Some(Address {
                address: advertised_ip.to_string(),
                ttl: None,
                range: None,
            }),
        });

        if media.has_srtp_local {
            let needs_install = media.medium(is_video).local_crypto_line.is_none();
            if needs_install {
                let profile = media
                    .medium(is_video)
                    .srtp_profile
                    .ok_or_else(|| Error::InvalidElement("srtp enabled with no profile chosen".into()))?;
                let tag = {
                    let m = media.medium(is_video);
                    if m.crypto_tag == 0 { 1 } else { m.crypto_tag }
                };
                let keying = LocalKeying::generate(profile, tag);
                let guard =
                    crate::srtp::SrtpGuard::new(profile, &keying.master_key, &keying.master_salt)?;
                let line = keying.to_crypto_line();
                let m = media.medium_mut(is_video);
                m.crypto_tag = tag;
                m.local_crypto_line = Some(line);
                m.encrypt = Some(guard);
            }
            if let Some(line) = media.medium(is_video).local_crypto_line.clone() {
                let body = line.trim_start_matches("a=crypto:").to_string();
                md.attributes.retain(|a| a.key != "crypto");
                md.attributes.push(Attribute::new("crypto".to_string(), Some(body)));
            }
        }

        if is_answer {
            let red_pt = find_red_payload_type(&md.attributes);
            if let (Some(red), Some(first), Some(second)) = (
                &red_pt,
                md.media_name.formats.first(),
                md.media_name.formats.get(1),
            ) {
                if first == red {
                    let pt_name = rtpmap_name(&md.attributes, second);
                    let m = media.medium_mut(is_video);
                    m.pt = second.parse().unwrap_or(-1);
                    m.pt_name = pt_name;
                    if !is_video {
                        media.opusred_pt = red.parse().unwrap_or(-1);
                    }
                }
            }
        }
    }

    Ok(description.marshal())
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\n\
o=- 1 1 IN IP4 127.0.0.1\r\n\
s=-\r\n\
c=IN IP4 127.0.0.1\r\n\
t=0 0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
a=rtpmap:111 opus/48000/2\r\n\
a=sendrecv\r\n";

    #[test]
    fn process_reads_remote_port_and_direction() {
        let description = parse(OFFER).unwrap();
        let mut media = MediaSession::default();
        process(&mut media, &description, false, false).unwrap();
        assert!(media.audio.has);
        assert!(media.audio.send);
    }

    #[test]
    fn process_treats_zero_port_as_rejected_medium() {
        let rejected = OFFER.replace("m=audio 9", "m=audio 0");
        let description = parse(&rejected).unwrap();
        let mut media = MediaSession::default();
        process(&mut media, &description, false, false).unwrap();
        assert!(!media.audio.has);
    }

    #[test]
    fn process_answer_picks_first_payload_type_and_name() {
        let answer = OFFER.replace("m=audio 9 UDP/TLS/RTP/SAVPF 111", "m=audio 20000 RTP/SAVP 111");
        let description = parse(&answer).unwrap();
        let mut media = MediaSession::default();
        process(&mut media, &description, true, false).unwrap();
        assert_eq!(media.audio.pt, 111);
        assert_eq!(media.audio.pt_name.as_deref(), Some("opus"));
        assert_eq!(media.audio.remote_rtp_port, 20000);
        assert_eq!(media.audio.remote_rtcp_port, 20001);
    }

    #[test]
    fn process_detects_require_srtp_from_savp_token() {
        let answer = OFFER.replace("m=audio 9 UDP/TLS/RTP/SAVPF 111", "m=audio 20000 RTP/SAVP 111");
        let description = parse(&answer).unwrap();
        let mut media = MediaSession::default();
        process(&mut media, &description, true, false).unwrap();
        assert!(media.require_srtp);
    }

    #[test]
    fn manipulate_rewrites_connection_address_and_port() {
        let mut description = parse(OFFER).unwrap();
        let mut media = MediaSession::default();
        media.audio.local_rtp_port = 24000;
        let rendered = manipulate(&mut media, &mut description, false, "203.0.113.9").unwrap();
        assert!(rendered.contains("c=IN IP4 203.0.113.9"));
        assert!(rendered.contains("m=audio 24000 RTP/AVP 111"));
    }

    #[test]
    fn manipulate_adds_crypto_line_when_srtp_enabled() {
        let mut description = parse(OFFER).unwrap();
        let mut media = MediaSession::default();
        media.audio.local_rtp_port = 24000;
        media.require_srtp = true;
        media.has_srtp_local = true;
        media.audio.srtp_profile = Some(rtpbridge_protocol::SrtpProfile::Aes128CmSha1_80);
        let rendered = manipulate(&mut media, &mut description, false, "203.0.113.9").unwrap();
        assert!(rendered.contains("a=crypto:1 AES_CM_128_HMAC_SHA1_80 inline:"));
        assert!(rendered.contains("RTP/SAVP"));
    }
}
