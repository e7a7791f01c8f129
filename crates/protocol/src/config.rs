use serde::{Deserialize, Serialize};

/// Top-level bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Interface address to bind media sockets to. Unset or unresolvable
    /// falls back to the wildcard address of the preferred family.
    pub local_ip: Option<String>,
    /// Address advertised in rendered descriptions. Defaults to `local_ip`.
    pub sdp_ip: Option<String>,
    /// `"min-max"` UDP port range for RTP/RTCP pairs. Min is forced even;
    /// a reversed range is swapped.
    #[serde(default = "default_port_range")]
    pub rtp_port_range: String,
    /// Enable host event notifications via `notify_event`.
    #[serde(default)]
    pub events: bool,
    /// DSCP value applied as `value << 2` to IP_TOS on the audio RTP socket.
    pub dscp_audio_rtp: Option<u8>,
    /// DSCP value applied as `value << 2` to IP_TOS on the video RTP socket.
    pub dscp_video_rtp: Option<u8>,
}

fn default_port_range() -> String {
    "10000-60000".to_string()
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            local_ip: None,
            sdp_ip: None,
            rtp_port_range: default_port_range(),
            events: false,
            dscp_audio_rtp: None,
            dscp_video_rtp: None,
        }
    }
}

/// A validated, normalized port range: `low` is always even, `low <= high`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub low: u16,
    pub high: u16,
}

impl BridgeConfig {
    /// Parse and normalize `rtp_port_range`, collecting advisory issues.
    /// Unlike a hard validation failure, a malformed range falls back to
    /// the documented default (10000-60000) rather than refusing to start.
    pub fn port_range(&self) -> (PortRange, Vec<String>) {
        let mut issues = Vec::new();
        let fallback = PortRange {
            low: 10000,
            high: 60000,
        };

        let Some((lo_s, hi_s)) = self.rtp_port_range.split_once('-') else {
            issues.push(format!(
                "ERROR: rtp_port_range '{}' is not in 'min-max' form, using default",
                self.rtp_port_range
            ));
            return (fallback, issues);
        };

        let (Ok(mut lo), Ok(mut hi)) = (lo_s.trim().parse::<u16>(), hi_s.trim().parse::<u16>())
        else {
            issues.push(format!(
                "ERROR: rtp_port_range '{}' contains non-numeric bounds, using default",
                self.rtp_port_range
            ));
            return (fallback, issues);
        };

        if lo > hi {
            issues.push(format!(
                "rtp_port_range '{}' is reversed, swapping bounds",
                self.rtp_port_range
            ));
            std::mem::swap(&mut lo, &mut hi);
        }

        if lo % 2 != 0 {
            issues.push(format!(
                "rtp_port_range low bound {lo} is odd, forcing even"
            ));
            lo = lo.saturating_sub(1).max(2);
        }

        if hi.saturating_sub(lo) < 4 {
            issues.push(format!(
                "rtp_port_range '{}' is too narrow for reliable allocation",
                self.rtp_port_range
            ));
        }

        (PortRange { low: lo, high: hi }, issues)
    }

    /// Collect every advisory/validation issue without raising them as a
    /// hard error; callers decide whether `ERROR:`-prefixed entries should
    /// block startup.
    pub fn validate(&self) -> Vec<String> {
        let (_, mut issues) = self.port_range();

        if let Some(dscp) = self.dscp_audio_rtp
            && dscp > 63
        {
            issues.push(format!("ERROR: dscp_audio_rtp {dscp} exceeds the 6-bit DSCP range"));
        }
        if let Some(dscp) = self.dscp_video_rtp
            && dscp > 63
        {
            issues.push(format!("ERROR: dscp_video_rtp {dscp} exceeds the 6-bit DSCP range"));
        }

        issues
    }

    /// The address advertised in rendered descriptions: `sdp_ip`, falling
    /// back to `local_ip`.
    pub fn advertised_address(&self) -> Option<&str> {
        self.sdp_ip.as_deref().or(self.local_ip.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_range() {
        let config: BridgeConfig = toml::from_str("").unwrap();
        assert_eq!(config.rtp_port_range, "10000-60000");
        assert!(!config.events);
        assert!(config.local_ip.is_none());
    }

    #[test]
    fn normal_range_parses_unchanged() {
        let config = BridgeConfig {
            rtp_port_range: "20000-20100".into(),
            ..Default::default()
        };
        let (range, issues) = config.port_range();
        assert_eq!(range.low, 20000);
        assert_eq!(range.high, 20100);
        assert!(issues.is_empty());
    }

    #[test]
    fn reversed_range_is_swapped() {
        let config = BridgeConfig {
            rtp_port_range: "20100-20000".into(),
            ..Default::default()
        };
        let (range, issues) = config.port_range();
        assert_eq!(range.low, 20000);
        assert_eq!(range.high, 20100);
        assert!(issues.iter().any(|i| i.contains("reversed")));
    }

    #[test]
    fn odd_low_bound_is_forced_even() {
        let config = BridgeConfig {
            rtp_port_range: "20001-20101".into(),
            ..Default::default()
        };
        let (range, issues) = config.port_range();
        assert_eq!(range.low % 2, 0);
        assert!(issues.iter().any(|i| i.contains("odd")));
    }

    #[test]
    fn malformed_range_falls_back_to_default() {
        let config = BridgeConfig {
            rtp_port_range: "garbage".into(),
            ..Default::default()
        };
        let (range, issues) = config.port_range();
        assert_eq!(range.low, 10000);
        assert_eq!(range.high, 60000);
        assert!(issues.iter().any(|i| i.starts_with("ERROR:")));
    }

    #[test]
    fn advertised_address_prefers_sdp_ip() {
        let config = BridgeConfig {
            local_ip: Some("10.0.0.5".into()),
            sdp_ip: Some("203.0.113.9".into()),
            ..Default::default()
        };
        assert_eq!(config.advertised_address(), Some("203.0.113.9"));
    }

    #[test]
    fn advertised_address_falls_back_to_local_ip() {
        let config = BridgeConfig {
            local_ip: Some("10.0.0.5".into()),
            sdp_ip: None,
            ..Default::default()
        };
        assert_eq!(config.advertised_address(), Some("10.0.0.5"));
    }

    #[test]
    fn dscp_out_of_range_is_an_error() {
        let config = BridgeConfig {
            dscp_audio_rtp: Some(200),
            ..Default::default()
        };
        let issues = config.validate();
        assert!(issues.iter().any(|i| i.starts_with("ERROR:")));
    }
}
