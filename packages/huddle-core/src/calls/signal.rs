//! Signaling payloads relayed between call participants.

use serde::{Deserialize, Serialize};

/// Session description type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// An SDP offer or answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate for NAT traversal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// The candidate string
    pub candidate: String,
    /// SDP mid
    #[serde(default)]
    pub sdp_mid: Option<String>,
    /// SDP m-line index
    #[serde(default)]
    pub sdp_m_line_index: Option<u16>,
}

/// What travels inside a `call-signal` frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalPayload {
    Offer { sdp: String },
    Answer { sdp: String },
    IceCandidate(IceCandidate),
}

impl SignalPayload {
    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate(_) => "ice-candidate",
        }
    }
}

impl From<SessionDescription> for SignalPayload {
    fn from(desc: SessionDescription) -> Self {
        match desc.sdp_type {
            SdpType::Offer => Self::Offer { sdp: desc.sdp },
            SdpType::Answer => Self::Answer { sdp: desc.sdp },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_wire_shape() {
        let payload = SignalPayload::from(SessionDescription::offer("v=0"));
        assert_eq!(
            serde_json::to_value(&payload).unwrap(),
            serde_json::json!({ "type": "offer", "sdp": "v=0" })
        );
        assert_eq!(payload.kind(), "offer");
    }

    #[test]
    fn test_candidate_without_mid() {
        let payload: SignalPayload =
            serde_json::from_str(r#"{ "type": "ice-candidate", "candidate": "candidate:0" }"#)
                .unwrap();
        assert_eq!(
            payload,
            SignalPayload::IceCandidate(IceCandidate {
                candidate: "candidate:0".into(),
                sdp_mid: None,
                sdp_m_line_index: None,
            })
        );
    }
}
