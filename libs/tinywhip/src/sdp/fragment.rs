// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

// Trickle ICE SDP fragment (RFC 8840, application/trickle-ice-sdpfrag)
//
// One fragment carries a single candidate, repeated in a stub media block for
// every media line of the local offer.

use super::offer::{IceCredentials, MediaLine};
use std::fmt::Write as _;

/// ICE component of a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceComponent {
    Rtp,
    Rtcp,
}

impl IceComponent {
    /// Component id written into the fragment: rtp is 0, everything else 1.
    pub fn sdp_id(self) -> u8 {
        match self {
            IceComponent::Rtp => 0,
            IceComponent::Rtcp => 1,
        }
    }
}

impl From<&str> for IceComponent {
    fn from(name: &str) -> Self {
        if name == "rtp" {
            IceComponent::Rtp
        } else {
            IceComponent::Rtcp
        }
    }
}

/// A local candidate as reported by the media transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub foundation: String,
    pub component: IceComponent,
    /// Transport protocol string (`udp`, `tcp`), carried through unchanged.
    pub transport: String,
    pub priority: u32,
    pub address: String,
    pub port: u16,
    /// Candidate type string (`host`, `srflx`, `prflx`, `relay`), carried through unchanged.
    pub typ: String,
    pub related_address: Option<String>,
    pub related_port: Option<u16>,
    pub tcp_type: Option<String>,
}

impl Candidate {
    /// The `candidate:` attribute value (without the `a=` prefix).
    pub fn to_attribute(&self) -> String {
        let mut attr = format!(
            "candidate:{} {} {} {} {} {} typ {}",
            self.foundation,
            self.component.sdp_id(),
            self.transport,
            self.priority,
            self.address,
            self.port,
            self.typ
        );

        if let (Some(raddr), Some(rport)) = (&self.related_address, self.related_port) {
            let _ = write!(attr, " raddr {} rport {}", raddr, rport);
        }
        if let Some(tcp_type) = &self.tcp_type {
            let _ = write!(attr, " tcptype {}", tcp_type);
        }

        attr
    }
}

/// Builds the PATCH body for one candidate.
///
/// Returns `None` (and logs) when credentials or media lines are missing, which
/// happens until the local offer has been created.
pub fn build_trickle_fragment(
    candidate: &Candidate,
    credentials: Option<&IceCredentials>,
    media: &[MediaLine],
) -> Option<String> {
    let Some(credentials) = credentials.filter(|_| !media.is_empty()) else {
        tracing::error!(
            "Missing local SDP meta data, cannot send trickle ICE candidate {}",
            candidate.foundation
        );
        return None;
    };

    let candidate_line = candidate.to_attribute();

    let mut fragment = String::new();
    let _ = write!(
        fragment,
        "a=ice-ufrag:{}\r\na=ice-pwd:{}\r\n",
        credentials.ufrag, credentials.pwd
    );

    for line in media {
        let _ = write!(
            fragment,
            "m={} 9 RTP/AVP 0\r\na=mid:{}\r\na={}\r\n",
            line.kind, line.mid, candidate_line
        );
    }

    Some(fragment)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_candidate() -> Candidate {
        Candidate {
            foundation: "842163049".into(),
            component: IceComponent::Rtp,
            transport: "udp".into(),
            priority: 1677729535,
            address: "192.168.1.20".into(),
            port: 54400,
            typ: "host".into(),
            related_address: None,
            related_port: None,
            tcp_type: None,
        }
    }

    fn credentials() -> IceCredentials {
        IceCredentials {
            ufrag: "EsAw".into(),
            pwd: "bP+XJMM09aR8AiX1jdukzR6Y".into(),
        }
    }

    fn media(mids: &[(&str, &str)]) -> Vec<MediaLine> {
        mids.iter()
            .map(|(kind, mid)| MediaLine {
                kind: (*kind).into(),
                mid: (*mid).into(),
            })
            .collect()
    }

    #[test]
    fn test_component_mapping() {
        assert_eq!(IceComponent::from("rtp").sdp_id(), 0);
        assert_eq!(IceComponent::from("rtcp").sdp_id(), 1);
        assert_eq!(IceComponent::from("").sdp_id(), 1);
        assert_eq!(IceComponent::from("RTP").sdp_id(), 1);
    }

    #[test]
    fn test_fragment_layout() {
        let fragment = build_trickle_fragment(
            &host_candidate(),
            Some(&credentials()),
            &media(&[("video", "0"), ("audio", "1")]),
        )
        .unwrap();

        assert_eq!(
            fragment,
            "a=ice-ufrag:EsAw\r\n\
             a=ice-pwd:bP+XJMM09aR8AiX1jdukzR6Y\r\n\
             m=video 9 RTP/AVP 0\r\n\
             a=mid:0\r\n\
             a=candidate:842163049 0 udp 1677729535 192.168.1.20 54400 typ host\r\n\
             m=audio 9 RTP/AVP 0\r\n\
             a=mid:1\r\n\
             a=candidate:842163049 0 udp 1677729535 192.168.1.20 54400 typ host\r\n"
        );
        assert!(!fragment.contains("v=0"));
        assert!(!fragment.contains("s="));
    }

    #[test]
    fn test_one_candidate_line_per_mid_in_offer_order() {
        let lines = media(&[("audio", "a"), ("video", "v"), ("video", "screen")]);
        let fragment =
            build_trickle_fragment(&host_candidate(), Some(&credentials()), &lines).unwrap();

        assert_eq!(fragment.matches("a=candidate:").count(), 3);
        let mids: Vec<&str> = fragment
            .lines()
            .filter_map(|l| l.strip_prefix("a=mid:"))
            .collect();
        assert_eq!(mids, vec!["a", "v", "screen"]);
    }

    #[test]
    fn test_relay_candidate_attributes() {
        let candidate = Candidate {
            component: IceComponent::Rtcp,
            transport: "tcp".into(),
            typ: "relay".into(),
            related_address: Some("10.0.0.1".into()),
            related_port: Some(9),
            tcp_type: Some("active".into()),
            ..host_candidate()
        };

        assert_eq!(
            candidate.to_attribute(),
            "candidate:842163049 1 tcp 1677729535 192.168.1.20 54400 typ relay raddr 10.0.0.1 rport 9 tcptype active"
        );
    }

    #[test]
    fn test_missing_metadata_yields_nothing() {
        let lines = media(&[("audio", "0")]);
        assert!(build_trickle_fragment(&host_candidate(), None, &lines).is_none());
        assert!(build_trickle_fragment(&host_candidate(), Some(&credentials()), &[]).is_none());
    }
}
