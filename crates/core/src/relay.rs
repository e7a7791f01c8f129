//! The per-session relay loop: multiplexes up to four UDP sockets plus the
//! session's wake signal, classifies datagrams as RTP or RTCP, applies
//! SRTP, rewrites SSRCs, and hands frames to the embedding host.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tracing::{debug, info, warn};
use webrtc_util::marshal::{Marshal, Unmarshal};

use crate::host::{AudioLevelExtension, Host, RtpExtensions, VideoOrientationExtension};
use crate::media_session::{MediaSession, Session};

const MAX_DATAGRAM: usize = 1500;
const RELAY_TICK: Duration = Duration::from_secs(1);
const MAX_CONSECUTIVE_ERRORS: u32 = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Role {
    AudioRtp,
    AudioRtcp,
    VideoRtp,
    VideoRtcp,
}

/// Runs until the session is destroyed/hanging up or a fatal error streak
/// is reached, then cleans up media state.
pub async fn run<H: Host + 'static>(session: Arc<Session>, host: Arc<H>) {
    info!(handle = %session.handle, "relay started");

    loop {
        let should_exit = {
            let mut media = session.media.lock().unwrap();
            if media.destroyed || media.hangingup {
                true
            } else {
                if media.updated {
                    media.updated = false;
                    reconnect(&mut media);
                }
                false
            }
        };
        if should_exit {
            break;
        }

        let (audio_rtp, audio_rtcp, video_rtp, video_rtcp) = {
            let media = session.media.lock().unwrap();
            (
                media.audio.rtp_socket.clone(),
                media.audio.rtcp_socket.clone(),
                media.video.rtp_socket.clone(),
                media.video.rtcp_socket.clone(),
            )
        };

        let mut audio_rtp_buf = [0u8; MAX_DATAGRAM];
        let mut audio_rtcp_buf = [0u8; MAX_DATAGRAM];
        let mut video_rtp_buf = [0u8; MAX_DATAGRAM];
        let mut video_rtcp_buf = [0u8; MAX_DATAGRAM];

        let notified = session.notify.notified();
        tokio::pin!(notified);

        let outcome: Option<(Role, std::io::Result<usize>)> = tokio::select! {
            _ = &mut notified => None,
            _ = tokio::time::sleep(RELAY_TICK) => None,
            res = recv_if(&audio_rtp, &mut audio_rtp_buf), if audio_rtp.is_some() => {
                Some((Role::AudioRtp, res))
            }
            res = recv_if(&audio_rtcp, &mut audio_rtcp_buf), if audio_rtcp.is_some() => {
                Some((Role::AudioRtcp, res))
            }
            res = recv_if(&video_rtp, &mut video_rtp_buf), if video_rtp.is_some() => {
                Some((Role::VideoRtp, res))
            }
            res = recv_if(&video_rtcp, &mut video_rtcp_buf), if video_rtcp.is_some() => {
                Some((Role::VideoRtcp, res))
            }
        };

        let Some((role, result)) = outcome else {
            continue;
        };

        let is_video = matches!(role, Role::VideoRtp | Role::VideoRtcp);
        let is_rtp = matches!(role, Role::AudioRtp | Role::VideoRtp);

        match result {
            Ok(n) => {
                let buf: &[u8] = match role {
                    Role::AudioRtp => &audio_rtp_buf[..n],
                    Role::AudioRtcp => &audio_rtcp_buf[..n],
                    Role::VideoRtp => &video_rtp_buf[..n],
                    Role::VideoRtcp => &video_rtcp_buf[..n],
                };
                if is_rtp {
                    forward_inbound_rtp(&session, host.as_ref(), is_video, buf).await;
                } else {
                    forward_inbound_rtcp(&session, host.as_ref(), is_video, buf).await;
                }
            }
            Err(e) => {
                let updated_pending = session.media.lock().unwrap().updated;
                if updated_pending {
                    continue;
                }
                if !is_rtp && e.kind() == std::io::ErrorKind::ConnectionRefused {
                    let mut media = session.media.lock().unwrap();
                    media.medium_mut(is_video).rtcp_socket = None;
                    debug!(handle = %session.handle, ?role, "rtcp socket refused, rtp keeps flowing");
                    continue;
                }
                let mut media = session.media.lock().unwrap();
                media.error_count += 1;
                let exhausted = media.error_count >= MAX_CONSECUTIVE_ERRORS;
                drop(media);
                if exhausted {
                    warn!(handle = %session.handle, "too many relay errors, closing peer connection");
                    host.close_pc(session.handle).await;
                    break;
                }
            }
        }
    }

    let mut media = session.media.lock().unwrap();
    media.cleanup_media();
    info!(handle = %session.handle, "relay exited, media cleaned up");
}

async fn recv_if(socket: &Option<Arc<UdpSocket>>, buf: &mut [u8]) -> std::io::Result<usize> {
    socket.as_ref().expect("guarded by is_some()").recv(buf).await
}

fn reconnect(media: &mut MediaSession) {
    connect_medium(&mut media.audio);
    connect_medium(&mut media.video);
}

fn connect_medium(medium: &mut crate::media_session::MediumState) {
    let Some(ip) = medium.remote_ip.clone() else {
        return;
    };
    if ip == "0.0.0.0" || ip.is_empty() {
        return;
    }
    if let (Some(sock), Some(addr)) = (&medium.rtp_socket, parse_peer_addr(&ip, medium.remote_rtp_port)) {
        if let Err(e) = socket2::SockRef::from(sock.as_ref()).connect(&addr.into()) {
            debug!("failed to connect rtp socket to {addr}: {e}");
        }
    }
    if let (Some(sock), Some(addr)) = (&medium.rtcp_socket, parse_peer_addr(&ip, medium.remote_rtcp_port)) {
        if let Err(e) = socket2::SockRef::from(sock.as_ref()).connect(&addr.into()) {
            debug!("failed to connect rtcp socket to {addr}: {e}");
        }
    }
}

fn parse_peer_addr(ip: &str, port: u16) -> Option<SocketAddr> {
    if port == 0 {
        return None;
    }
    format!("{ip}:{port}")
        .parse()
        .ok()
        .or_else(|| format!("[{ip}]:{port}").parse().ok())
}

async fn forward_inbound_rtp<H: Host>(session: &Session, host: &H, is_video: bool, datagram: &[u8]) {
    let mut media = session.media.lock().unwrap();
    let medium = media.medium_mut(is_video);

    let plain;
    let bytes: &[u8] = if let Some(guard) = medium.decrypt.as_mut() {
        match guard.decrypt_rtp(datagram) {
            Ok(p) => {
                plain = p;
                &plain
            }
            Err(e) => {
                debug!("dropping rtp packet that failed to unprotect: {e}");
                return;
            }
        }
    } else {
        datagram
    };

    let mut cursor = bytes;
    let Ok(mut packet) = rtp::packet::Packet::unmarshal(&mut cursor) else {
        debug!("dropping malformed rtp packet");
        return;
    };

    if medium.peer_ssrc == 0 {
        medium.peer_ssrc = packet.header.ssrc;
    }
    let (seq, ts) = medium.switching.update(
        packet.header.ssrc,
        packet.header.sequence_number,
        packet.header.timestamp,
    );
    packet.header.sequence_number = seq;
    packet.header.timestamp = ts;
    packet.header.ssrc = medium.peer_ssrc;

    let extensions = if is_video {
        RtpExtensions {
            video_orientation: decode_video_orientation(&packet, media.video_orientation_extension_id),
            audio_level: None,
        }
    } else {
        RtpExtensions {
            audio_level: decode_audio_level(&packet, media.audio_level_extension_id),
            video_orientation: None,
        }
    };
    drop(media);

    let Ok(rewritten) = packet.marshal() else {
        return;
    };

    tap_recorder(session, is_video, true, &packet.payload, packet.header.timestamp, packet.header.marker);

    host.relay_rtp(session.handle, is_video, &rewritten, extensions).await;
}

/// Write a payload to the recorder slot for `is_video`/`is_peer`, if one is
/// currently attached. Idempotent no-op otherwise.
fn tap_recorder(session: &Session, is_video: bool, is_peer: bool, payload: &[u8], timestamp: u32, marker: bool) {
    let recorders = session.recorders.lock().unwrap();
    let slot = match (is_peer, is_video) {
        (true, false) => &recorders.peer_audio,
        (true, true) => &recorders.peer_video,
        (false, false) => &recorders.user_audio,
        (false, true) => &recorders.user_video,
    };
    if let Some(recorder) = slot {
        recorder.write_rtp(payload, timestamp, marker);
    }
}

async fn forward_inbound_rtcp<H: Host>(session: &Session, host: &H, is_video: bool, datagram: &[u8]) {
    let mut media = session.media.lock().unwrap();
    let medium = media.medium_mut(is_video);

    let plain;
    let bytes: &[u8] = if let Some(guard) = medium.decrypt.as_mut() {
        match guard.decrypt_rtcp(datagram) {
            Ok(p) => {
                plain = p;
                &plain
            }
            Err(e) => {
                debug!("dropping rtcp packet that failed to unprotect: {e}");
                return;
            }
        }
    } else {
        datagram
    };
    let bytes = bytes.to_vec();
    drop(media);

    host.relay_rtcp(session.handle, is_video, &bytes).await;
}

fn decode_audio_level(packet: &rtp::packet::Packet, ext_id: i32) -> Option<AudioLevelExtension> {
    if ext_id < 0 {
        return None;
    }
    let ext = packet.header.get_extension(ext_id as u8)?;
    let byte = *ext.first()?;
    Some(AudioLevelExtension {
        vad: byte & 0x80 != 0,
        level: byte & 0x7f,
    })
}

fn decode_video_orientation(packet: &rtp::packet::Packet, ext_id: i32) -> Option<VideoOrientationExtension> {
    if ext_id < 0 {
        return None;
    }
    let ext = packet.header.get_extension(ext_id as u8)?;
    let byte = *ext.first()?;
    let c = byte & 0x08 != 0;
    let f = byte & 0x04 != 0;
    let r1 = byte & 0x02 != 0;
    let r0 = byte & 0x01 != 0;
    let rotation = match (r1, r0) {
        (false, false) => 0,
        (false, true) => 90,
        (true, true) => 180,
        (true, false) => 270,
    };
    Some(VideoOrientationExtension {
        rotation,
        back_camera: c,
        flipped: f,
    })
}

/// Write one outbound (host-originated) RTP packet for `is_video`: applies
/// the direction flag, simulcast base-layer filter, SRTP protection, and
/// the learned-SSRC bookkeeping, then sends on the connected socket.
pub async fn send_outbound_rtp(session: &Session, is_video: bool, payload: &[u8]) -> std::io::Result<()> {
    let mut cursor = payload;
    let Ok(packet) = rtp::packet::Packet::unmarshal(&mut cursor) else {
        return Ok(());
    };

    let socket;
    let wire;
    {
        let mut media = session.media.lock().unwrap();
        if !media.medium(is_video).send {
            return Ok(());
        }
        if media.simulcast_ssrc != 0 && packet.header.ssrc != media.simulcast_ssrc {
            return Ok(());
        }

        let medium = media.medium_mut(is_video);
        if medium.local_ssrc == 0 {
            medium.local_ssrc = packet.header.ssrc;
        }

        let Ok(marshaled) = packet.marshal() else {
            return Ok(());
        };

        tap_recorder(session, is_video, false, &packet.payload, packet.header.timestamp, packet.header.marker);

        wire = match medium.encrypt.as_mut() {
            Some(guard) => match guard.encrypt_rtp(&marshaled) {
                Ok(protected) => protected,
                Err(e) => {
                    debug!("dropping outbound rtp that failed to protect: {e}");
                    return Ok(());
                }
            },
            None => marshaled.to_vec(),
        };
        socket = medium.rtp_socket.clone();
    }

    if let Some(sock) = socket {
        if let Err(e) = sock.send(&wire).await {
            debug!("outbound rtp send failed: {e}");
        }
    }
    Ok(())
}

/// Write one outbound (host-originated) RTCP compound packet for
/// `is_video`: rewrites sender/receiver report SSRCs to the learned
/// local/peer identifiers so the far end sees consistent ids, protects if
/// negotiated, then sends on the connected socket.
pub async fn send_outbound_rtcp(session: &Session, is_video: bool, payload: &[u8]) -> std::io::Result<()> {
    let mut cursor = payload;
    let Ok(mut packets) = rtcp::packet::unmarshal(&mut cursor) else {
        return Ok(());
    };

    let socket;
    let wire;
    {
        let mut media = session.media.lock().unwrap();
        let medium = media.medium_mut(is_video);
        let local_ssrc = medium.local_ssrc;
        let peer_ssrc = medium.peer_ssrc;

        for packet in packets.iter_mut() {
            if let Some(sr) = packet.as_any().downcast_ref::<rtcp::sender_report::SenderReport>() {
                let mut fixed = sr.clone();
                if local_ssrc != 0 {
                    fixed.ssrc = local_ssrc;
                }
                for report in fixed.reports.iter_mut() {
                    if peer_ssrc != 0 {
                        report.ssrc = peer_ssrc;
                    }
                }
                *packet = Box::new(fixed);
            } else if let Some(rr) = packet.as_any().downcast_ref::<rtcp::receiver_report::ReceiverReport>() {
                let mut fixed = rr.clone();
                if local_ssrc != 0 {
                    fixed.ssrc = local_ssrc;
                }
                for report in fixed.reports.iter_mut() {
                    if peer_ssrc != 0 {
                        report.ssrc = peer_ssrc;
                    }
                }
                *packet = Box::new(fixed);
            }
        }

        let Ok(marshaled) = rtcp::packet::marshal(&packets) else {
            return Ok(());
        };

        wire = match medium.encrypt.as_mut() {
            Some(guard) => match guard.encrypt_rtcp(&marshaled) {
                Ok(protected) => protected,
                Err(e) => {
                    debug!("dropping outbound rtcp that failed to protect: {e}");
                    return Ok(());
                }
            },
            None => marshaled.to_vec(),
        };
        socket = medium.rtcp_socket.clone();
    }

    if let Some(sock) = socket {
        if let Err(e) = sock.send(&wire).await {
            debug!("outbound rtcp send failed: {e}");
        }
    }
    Ok(())
}

/// Build and send a 12-byte RTCP PLI on the peer's video RTCP socket.
/// No-op if there is no video or the socket is absent.
pub async fn send_pli_to_peer(session: &Session) -> std::io::Result<()> {
    let socket;
    let wire;
    {
        let mut media = session.media.lock().unwrap();
        if !media.video.has || !media.video_pli_supported {
            return Ok(());
        }

        let pli = rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication {
            sender_ssrc: media.video.local_ssrc,
            media_ssrc: media.video.peer_ssrc,
        };
        let Ok(marshaled) = pli.marshal() else {
            return Ok(());
        };

        wire = match media.video.encrypt.as_mut() {
            Some(guard) => match guard.encrypt_rtcp(&marshaled) {
                Ok(protected) => protected,
                Err(e) => {
                    debug!("failed to protect pli: {e}");
                    return Ok(());
                }
            },
            None => marshaled.to_vec(),
        };
        socket = media.video.rtcp_socket.clone();
    }

    if let Some(sock) = socket {
        sock.send(&wire).await?;
    }
    Ok(())
}
