//! Copy/paste-safe encoding of a complete (non-trickle) connection descriptor.
//!
//! The transport string is base64 over a small JSON document. Decoding only
//! checks structure; a descriptor with SDP the peer connection rejects still
//! decodes fine and fails later in `set_remote_description`.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::error::{BottleError, Result};

pub const DESCRIPTOR_VERSION: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DescriptorKind {
    Offer,
    Answer,
}

impl DescriptorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DescriptorKind::Offer => "offer",
            DescriptorKind::Answer => "answer",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CandidateEntry {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

impl CandidateEntry {
    pub fn from_init(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
        }
    }

    pub fn to_init(&self) -> RTCIceCandidateInit {
        RTCIceCandidateInit {
            candidate: self.candidate.clone(),
            sdp_mid: self.sdp_mid.clone(),
            sdp_mline_index: self.sdp_mline_index,
            username_fragment: None,
        }
    }

    /// Whether the SDP body already advertises this candidate.
    pub fn is_embedded_in(&self, sdp: &str) -> bool {
        let needle = self
            .candidate
            .strip_prefix("candidate:")
            .unwrap_or(&self.candidate)
            .trim();
        sdp.lines().any(|line| {
            line.trim()
                .strip_prefix("a=candidate:")
                .is_some_and(|value| value.trim() == needle)
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub kind: DescriptorKind,
    pub sdp: String,
    pub candidates: Vec<CandidateEntry>,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct DescriptorWire {
    version: u32,
    #[serde(rename = "type")]
    kind: DescriptorKind,
    sdp: String,
    #[serde(default)]
    candidates: Vec<CandidateEntry>,
}

/// What a browser produces with `JSON.stringify(pc.localDescription)`.
#[derive(Deserialize)]
struct BareSessionDescription {
    #[serde(rename = "type")]
    kind: DescriptorKind,
    sdp: String,
}

impl ConnectionDescriptor {
    pub fn from_session_description(
        desc: &RTCSessionDescription,
        candidates: Vec<CandidateEntry>,
    ) -> Result<Self> {
        let kind = match desc.sdp_type {
            RTCSdpType::Offer => DescriptorKind::Offer,
            RTCSdpType::Answer => DescriptorKind::Answer,
            other => {
                return Err(BottleError::DescriptorFormat(format!(
                    "unsupported sdp type {other}"
                )));
            }
        };
        Ok(Self {
            kind,
            sdp: desc.sdp.clone(),
            candidates,
        })
    }

    pub fn to_session_description(&self) -> Result<RTCSessionDescription> {
        let sdp = self.sdp.clone();
        let description = match self.kind {
            DescriptorKind::Offer => RTCSessionDescription::offer(sdp),
            DescriptorKind::Answer => RTCSessionDescription::answer(sdp),
        };
        description.map_err(|err| BottleError::DescriptorFormat(err.to_string()))
    }

    /// Bundled candidates that the SDP body does not already carry.
    pub fn missing_candidates(&self) -> impl Iterator<Item = &CandidateEntry> {
        self.candidates
            .iter()
            .filter(|entry| !entry.is_embedded_in(&self.sdp))
    }
}

pub fn encode(descriptor: &ConnectionDescriptor) -> Result<String> {
    let wire = DescriptorWire {
        version: DESCRIPTOR_VERSION,
        kind: descriptor.kind,
        sdp: descriptor.sdp.clone(),
        candidates: descriptor.candidates.clone(),
    };
    let json = serde_json::to_vec(&wire).map_err(|err| {
        BottleError::DescriptorFormat(format!("failed to serialize descriptor: {err}"))
    })?;
    Ok(BASE64_STANDARD.encode(json))
}

pub fn decode(transport: &str) -> Result<ConnectionDescriptor> {
    let compact: String = transport
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    if compact.is_empty() {
        return Err(BottleError::DescriptorFormat("descriptor is empty".into()));
    }

    if compact.starts_with('{') {
        return decode_bare_json(transport.trim());
    }

    let json = BASE64_STANDARD
        .decode(compact.as_bytes())
        .map_err(|err| BottleError::DescriptorFormat(format!("invalid base64: {err}")))?;
    let wire: DescriptorWire = serde_json::from_slice(&json)
        .map_err(|err| BottleError::DescriptorFormat(format!("invalid descriptor json: {err}")))?;
    if wire.version != DESCRIPTOR_VERSION {
        return Err(BottleError::DescriptorFormat(format!(
            "unsupported descriptor version {}",
            wire.version
        )));
    }
    validate_sdp(&wire.sdp)?;
    Ok(ConnectionDescriptor {
        kind: wire.kind,
        sdp: wire.sdp,
        candidates: wire.candidates,
    })
}

fn decode_bare_json(text: &str) -> Result<ConnectionDescriptor> {
    let bare: BareSessionDescription = serde_json::from_str(text).map_err(|err| {
        BottleError::DescriptorFormat(format!("invalid session description json: {err}"))
    })?;
    validate_sdp(&bare.sdp)?;
    Ok(ConnectionDescriptor {
        kind: bare.kind,
        sdp: bare.sdp,
        candidates: Vec::new(),
    })
}

fn validate_sdp(sdp: &str) -> Result<()> {
    if sdp.trim().is_empty() {
        return Err(BottleError::DescriptorFormat("session description is empty".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_SDP: &str = "v=0\r\no=- 1 2 IN IP4 0.0.0.0\r\ns=-\r\nt=0 0\r\n\
        m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n\
        a=candidate:1 1 udp 2130706431 192.168.1.7 50000 typ host\r\n";

    fn sample(kind: DescriptorKind) -> ConnectionDescriptor {
        ConnectionDescriptor {
            kind,
            sdp: SAMPLE_SDP.to_string(),
            candidates: vec![
                CandidateEntry {
                    candidate: "candidate:1 1 udp 2130706431 192.168.1.7 50000 typ host".into(),
                    sdp_mid: Some("0".into()),
                    sdp_mline_index: Some(0),
                },
                CandidateEntry {
                    candidate: "candidate:2 1 udp 1694498815 203.0.113.9 61000 typ srflx".into(),
                    sdp_mid: Some("0".into()),
                    sdp_mline_index: None,
                },
            ],
        }
    }

    #[test]
    fn encode_decode_preserves_descriptor() {
        for kind in [DescriptorKind::Offer, DescriptorKind::Answer] {
            let descriptor = sample(kind);
            assert_eq!(decode(&encode(&descriptor).unwrap()).unwrap(), descriptor);
        }
    }

    #[test]
    fn transport_string_is_a_single_printable_line() {
        let encoded = encode(&sample(DescriptorKind::Offer)).expect("encode");
        assert!(!encoded.is_empty());
        assert!(encoded.chars().all(|c| c.is_ascii_graphic()));
    }

    #[test]
    fn decode_tolerates_wrapped_and_padded_input() {
        let descriptor = sample(DescriptorKind::Answer);
        let encoded = encode(&descriptor).expect("encode");
        let (head, tail) = encoded.split_at(encoded.len() / 2);
        let wrapped = format!("  {head}\n{tail}\r\n");
        assert_eq!(decode(&wrapped).unwrap(), descriptor);
    }

    #[test]
    fn decode_accepts_bare_browser_json() {
        let json = serde_json::json!({ "type": "offer", "sdp": SAMPLE_SDP }).to_string();
        let descriptor = decode(&json).unwrap();
        assert_eq!(descriptor.kind, DescriptorKind::Offer);
        assert_eq!(descriptor.sdp, SAMPLE_SDP);
        assert!(descriptor.candidates.is_empty());
    }

    #[test]
    fn decode_rejects_malformed_input() {
        let unknown_type = BASE64_STANDARD
            .encode(r#"{"version":1,"type":"pranswer","sdp":"v=0","candidates":[]}"#);
        let bad_version =
            BASE64_STANDARD.encode(r#"{"version":9,"type":"offer","sdp":"v=0","candidates":[]}"#);
        let empty_sdp =
            BASE64_STANDARD.encode(r#"{"version":1,"type":"answer","sdp":"  ","candidates":[]}"#);
        let extra_field = BASE64_STANDARD
            .encode(r#"{"version":1,"type":"offer","sdp":"v=0","candidates":[],"x":1}"#);
        let not_json = BASE64_STANDARD.encode("hello there");

        for input in [
            "",
            "   \n",
            "%%% not base64 %%%",
            not_json.as_str(),
            unknown_type.as_str(),
            bad_version.as_str(),
            empty_sdp.as_str(),
            extra_field.as_str(),
            r#"{"type":"offer"}"#,
        ] {
            let err = decode(input).unwrap_err();
            assert!(
                matches!(err, BottleError::DescriptorFormat(_)),
                "unexpected result for {input:?}: {err:?}"
            );
        }
    }

    #[test]
    fn missing_candidates_skips_those_already_in_sdp() {
        let descriptor = sample(DescriptorKind::Offer);
        let missing: Vec<_> = descriptor.missing_candidates().collect();
        assert_eq!(missing.len(), 1);
        assert!(missing[0].candidate.contains("srflx"));
    }

    #[test]
    fn session_description_conversion_keeps_kind() {
        let descriptor = sample(DescriptorKind::Answer);
        let desc = descriptor.to_session_description().unwrap();
        assert_eq!(desc.sdp_type, RTCSdpType::Answer);
        let back = ConnectionDescriptor::from_session_description(&desc, descriptor.candidates.clone())
            .unwrap();
        assert_eq!(back, descriptor);
    }
}
