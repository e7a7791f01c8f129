//! SDES-SRTP keying and packet protection.
//!
//! Wraps `webrtc_srtp::context::Context` with the one quirk the profile
//! table requires: `AES_CM_128_HMAC_SHA1_32` authenticates RTP with a
//! 32-bit tag but still authenticates RTCP with an 80-bit tag, so the two
//! directions need two different `ProtectionProfile` values even though
//! they share one negotiated crypto suite.

use rand::RngCore;
use rtpbridge_protocol::{Error, Result, SrtpProfile};
use webrtc_srtp::context::Context as SrtpContext;
use webrtc_srtp::protection_profile::ProtectionProfile;

/// Locally-generated key material for one `a=crypto` offer, before a peer
/// has answered with its own.
pub struct LocalKeying {
    pub profile: SrtpProfile,
    pub master_key: Vec<u8>,
    pub master_salt: Vec<u8>,
    pub tag: u32,
}

impl LocalKeying {
    /// Generate fresh random key material for `profile`, tagged for
    /// `a=crypto:<tag> ...` rendering.
    pub fn generate(profile: SrtpProfile, tag: u32) -> Self {
        let mut rng = rand::thread_rng();
        let mut master_key = vec![0u8; profile.key_len()];
        let mut master_salt = vec![0u8; profile.salt_len()];
        rng.fill_bytes(&mut master_key);
        rng.fill_bytes(&mut master_salt);
        Self {
            profile,
            master_key,
            master_salt,
            tag,
        }
    }

    /// Base64-encoded `key|salt` concatenation, as carried in the
    /// `a=crypto` line's key-params field.
    pub fn encoded_key_params(&self) -> String {
        let mut combined = Vec::with_capacity(self.master_key.len() + self.master_salt.len());
        combined.extend_from_slice(&self.master_key);
        combined.extend_from_slice(&self.master_salt);
        base64::Engine::encode(&base64::engine::general_purpose::STANDARD, combined)
    }

    /// Render the full `a=crypto` line for this profile/key/tag.
    pub fn to_crypto_line(&self) -> String {
        let (name, _) = self.profile.name_and_master_len();
        format!(
            "a=crypto:{} {} inline:{}",
            self.tag,
            name,
            self.encoded_key_params()
        )
    }
}

/// Key material parsed out of a remote `a=crypto` line.
#[derive(Debug, Clone)]
pub struct RemoteKeying {
    pub profile: SrtpProfile,
    pub master_key: Vec<u8>,
    pub master_salt: Vec<u8>,
}

impl RemoteKeying {
    /// Parse a single `a=crypto:<tag> <suite> inline:<base64>` line body
    /// (without the leading `a=crypto:` prefix).
    pub fn parse(tag_and_rest: &str) -> Result<Self> {
        let mut parts = tag_and_rest.split_whitespace();
        let _tag = parts
            .next()
            .ok_or_else(|| Error::InvalidSdp("crypto line missing tag".into()))?;
        let suite = parts
            .next()
            .ok_or_else(|| Error::InvalidSdp("crypto line missing suite".into()))?;
        let key_params = parts
            .next()
            .ok_or_else(|| Error::InvalidSdp("crypto line missing key params".into()))?;

        let profile = SrtpProfile::from_name(suite)
            .ok_or_else(|| Error::InvalidSdp(format!("unsupported srtp profile {suite}")))?;

        let encoded = key_params
            .strip_prefix("inline:")
            .ok_or_else(|| Error::InvalidSdp("crypto key params missing inline: prefix".into()))?;
        let encoded = encoded.split('|').next().unwrap_or(encoded);

        let raw = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, encoded)
            .map_err(|e| Error::InvalidSdp(format!("invalid base64 in crypto line: {e}")))?;

        let key_len = profile.key_len();
        let salt_len = profile.salt_len();
        if raw.len() != key_len + salt_len {
            return Err(Error::InvalidSdp(format!(
                "crypto key material is {} bytes, expected {}",
                raw.len(),
                key_len + salt_len
            )));
        }

        Ok(Self {
            profile,
            master_key: raw[..key_len].to_vec(),
            master_salt: raw[key_len..].to_vec(),
        })
    }
}

fn rtp_wire_profile(profile: SrtpProfile) -> ProtectionProfile {
    match profile {
        // The 32-bit-auth suite only shortens the RTP auth tag; RTCP
        // always keeps the full 80-bit tag for this suite.
        SrtpProfile::Aes128CmSha1_32 => ProtectionProfile::Aes128CmHmacSha1_32,
        SrtpProfile::Aes128CmSha1_80 => ProtectionProfile::Aes128CmHmacSha1_80,
        SrtpProfile::AeadAes128Gcm => ProtectionProfile::AeadAes128Gcm,
        SrtpProfile::AeadAes256Gcm => ProtectionProfile::AeadAes256Gcm,
    }
}

fn rtcp_wire_profile(profile: SrtpProfile) -> ProtectionProfile {
    match profile {
        SrtpProfile::Aes128CmSha1_32 => ProtectionProfile::Aes128CmHmacSha1_80,
        other => rtp_wire_profile(other),
    }
}

/// A one-way (encrypt-only or decrypt-only) SRTP/SRTCP protection pair for
/// a single negotiated key. One `SrtpGuard` is built for the outbound
/// (towards the browser) direction and one for the inbound direction.
pub struct SrtpGuard {
    rtp_ctx: SrtpContext,
    rtcp_ctx: SrtpContext,
}

impl SrtpGuard {
    pub fn new(profile: SrtpProfile, master_key: &[u8], master_salt: &[u8]) -> Result<Self> {
        let rtp_ctx = SrtpContext::new(
            master_key,
            master_salt,
            rtp_wire_profile(profile),
            None,
            None,
        )
        .map_err(|e| Error::InvalidSdp(format!("failed to build srtp context: {e}")))?;

        let rtcp_ctx = SrtpContext::new(
            master_key,
            master_salt,
            rtcp_wire_profile(profile),
            None,
            None,
        )
        .map_err(|e| Error::InvalidSdp(format!("failed to build srtcp context: {e}")))?;

        Ok(Self { rtp_ctx, rtcp_ctx })
    }

    pub fn encrypt_rtp(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.rtp_ctx
            .encrypt_rtp(plaintext)
            .map(|b| b.to_vec())
            .map_err(|e| Error::IoError(format!("srtp encrypt failed: {e}")))
    }

    pub fn decrypt_rtp(&mut self, encrypted: &[u8]) -> Result<Vec<u8>> {
        self.rtp_ctx
            .decrypt_rtp(encrypted)
            .map(|b| b.to_vec())
            .map_err(|e| Error::IoError(format!("srtp decrypt failed: {e}")))
    }

    pub fn encrypt_rtcp(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.rtcp_ctx
            .encrypt_rtcp(plaintext)
            .map(|b| b.to_vec())
            .map_err(|e| Error::IoError(format!("srtcp encrypt failed: {e}")))
    }

    pub fn decrypt_rtcp(&mut self, encrypted: &[u8]) -> Result<Vec<u8>> {
        self.rtcp_ctx
            .decrypt_rtcp(encrypted)
            .map(|b| b.to_vec())
            .map_err(|e| Error::IoError(format!("srtcp decrypt failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_key_material_has_the_right_lengths() {
        for profile in [
            SrtpProfile::Aes128CmSha1_32,
            SrtpProfile::Aes128CmSha1_80,
            SrtpProfile::AeadAes128Gcm,
            SrtpProfile::AeadAes256Gcm,
        ] {
            let keying = LocalKeying::generate(profile, 1);
            assert_eq!(keying.master_key.len(), profile.key_len());
            assert_eq!(keying.master_salt.len(), profile.salt_len());
        }
    }

    #[test]
    fn crypto_line_roundtrips_through_remote_parse() {
        let keying = LocalKeying::generate(SrtpProfile::Aes128CmSha1_80, 1);
        let line = keying.to_crypto_line();
        let body = line.strip_prefix("a=crypto:").unwrap();
        let parsed = RemoteKeying::parse(body).unwrap();
        assert_eq!(parsed.profile, SrtpProfile::Aes128CmSha1_80);
        assert_eq!(parsed.master_key, keying.master_key);
        assert_eq!(parsed.master_salt, keying.master_salt);
    }

    #[test]
    fn parse_rejects_wrong_key_length() {
        let bogus = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, [0u8; 4]);
        let line = format!("1 AES_CM_128_HMAC_SHA1_80 inline:{bogus}");
        let err = RemoteKeying::parse(&line).unwrap_err();
        assert_eq!(err.code(), 447);
    }

    #[test]
    fn parse_rejects_unknown_suite() {
        let bogus = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, [0u8; 30]);
        let line = format!("1 NOT_A_REAL_SUITE inline:{bogus}");
        let err = RemoteKeying::parse(&line).unwrap_err();
        assert_eq!(err.code(), 447);
    }

    #[test]
    fn guard_roundtrips_an_rtp_packet() {
        let keying = LocalKeying::generate(SrtpProfile::Aes128CmSha1_80, 1);
        let mut enc = SrtpGuard::new(
            keying.profile,
            &keying.master_key,
            &keying.master_salt,
        )
        .unwrap();
        let mut dec = SrtpGuard::new(
            keying.profile,
            &keying.master_key,
            &keying.master_salt,
        )
        .unwrap();

        use webrtc_util::marshal::Marshal;

        let mut packet = rtp::packet::Packet::default();
        packet.header.sequence_number = 1;
        packet.header.ssrc = 0xdead_beef;
        packet.payload = bytes::Bytes::from_static(b"hello");
        let marshaled = packet.marshal().unwrap();

        let protected = enc.encrypt_rtp(&marshaled).unwrap();
        let recovered = dec.decrypt_rtp(&protected).unwrap();
        assert_eq!(recovered, marshaled.to_vec());
    }
}
