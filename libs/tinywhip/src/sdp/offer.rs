// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

/// ICE username fragment and password of the local offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCredentials {
    pub ufrag: String,
    pub pwd: String,
}

/// One `m=` section of the local offer that carries an `a=mid`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaLine {
    /// Media type from the `m=` line (`audio`, `video`, ...).
    pub kind: String,
    pub mid: String,
}

/// What the negotiator needs from its own offer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalOfferInfo {
    pub credentials: Option<IceCredentials>,
    /// Media sections in offer order.
    pub media: Vec<MediaLine>,
}

impl LocalOfferInfo {
    /// Reads ICE credentials and media identifiers out of an SDP offer.
    ///
    /// Session-level `a=ice-ufrag`/`a=ice-pwd` win; otherwise the first media
    /// section's pair is used. Media sections without `a=mid` are skipped.
    pub fn parse(sdp: &str) -> Self {
        let mut session_ufrag = None;
        let mut session_pwd = None;
        let mut first_media_ufrag = None;
        let mut first_media_pwd = None;

        let mut media = Vec::new();
        let mut current_kind: Option<String> = None;
        let mut media_index = 0usize;

        for line in sdp.lines() {
            let line = line.trim_end_matches('\r');

            if let Some(rest) = line.strip_prefix("m=") {
                media_index += 1;
                current_kind = Some(rest.split_whitespace().next().unwrap_or_default().to_owned());
                continue;
            }

            if let Some(value) = line.strip_prefix("a=ice-ufrag:") {
                match media_index {
                    0 => session_ufrag = Some(value.trim().to_owned()),
                    1 => {
                        first_media_ufrag.get_or_insert_with(|| value.trim().to_owned());
                    }
                    _ => {}
                }
            } else if let Some(value) = line.strip_prefix("a=ice-pwd:") {
                match media_index {
                    0 => session_pwd = Some(value.trim().to_owned()),
                    1 => {
                        first_media_pwd.get_or_insert_with(|| value.trim().to_owned());
                    }
                    _ => {}
                }
            } else if let Some(mid) = line.strip_prefix("a=mid:") {
                if let Some(kind) = &current_kind {
                    media.push(MediaLine {
                        kind: kind.clone(),
                        mid: mid.trim().to_owned(),
                    });
                }
            }
        }

        let credentials = match (session_ufrag, session_pwd) {
            (Some(ufrag), Some(pwd)) => Some(IceCredentials { ufrag, pwd }),
            _ => match (first_media_ufrag, first_media_pwd) {
                (Some(ufrag), Some(pwd)) => Some(IceCredentials { ufrag, pwd }),
                _ => None,
            },
        };

        Self { credentials, media }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\n\
        o=- 4611731400430051336 2 IN IP4 127.0.0.1\r\n\
        s=-\r\n\
        t=0 0\r\n\
        a=group:BUNDLE 0 1\r\n\
        m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
        c=IN IP4 0.0.0.0\r\n\
        a=ice-ufrag:EsAw\r\n\
        a=ice-pwd:bP+XJMM09aR8AiX1jdukzR6Y\r\n\
        a=mid:0\r\n\
        a=sendonly\r\n\
        m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
        c=IN IP4 0.0.0.0\r\n\
        a=ice-ufrag:other\r\n\
        a=ice-pwd:otherpwd\r\n\
        a=mid:1\r\n\
        a=sendonly\r\n";

    #[test]
    fn test_media_level_credentials_and_mids() {
        let info = LocalOfferInfo::parse(OFFER);

        assert_eq!(
            info.credentials,
            Some(IceCredentials {
                ufrag: "EsAw".into(),
                pwd: "bP+XJMM09aR8AiX1jdukzR6Y".into(),
            })
        );
        assert_eq!(
            info.media,
            vec![
                MediaLine { kind: "video".into(), mid: "0".into() },
                MediaLine { kind: "audio".into(), mid: "1".into() },
            ]
        );
    }

    #[test]
    fn test_session_level_credentials_win() {
        let sdp = "v=0\r\na=ice-ufrag:sess\r\na=ice-pwd:sesspwd\r\nm=audio 9 RTP/AVP 0\r\na=ice-ufrag:media\r\na=ice-pwd:mediapwd\r\na=mid:a\r\n";
        let info = LocalOfferInfo::parse(sdp);

        assert_eq!(info.credentials.unwrap().ufrag, "sess");
        assert_eq!(info.media.len(), 1);
    }

    #[test]
    fn test_missing_credentials() {
        let info = LocalOfferInfo::parse("v=0\r\nm=audio 9 RTP/AVP 0\r\na=mid:0\r\n");
        assert!(info.credentials.is_none());
        assert_eq!(info.media[0].mid, "0");
    }
}
