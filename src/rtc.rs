//! Signaling-side peer model for the assistant pipeline
//!
//! The assistant backend negotiates a media peer over the same socket that
//! carries audio: the client sends an SDP offer as soon as the socket is
//! open, applies the remote answer, and relays ICE candidates as they
//! arrive. This module owns that exchange and its state; the media-level
//! peer transport behind the exchanged descriptions is the backend's side
//! of the contract.

use crate::protocol::IceCandidate;
use rand::distr::{Alphanumeric, SampleString};
use rand::Rng;
use thiserror::Error;

/// Offer/answer progress, mirroring the signaling half of a peer
/// connection's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    New,
    HaveLocalOffer,
    Stable,
    Closed,
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("offer already created (state {0:?})")]
    OfferAlreadyCreated(SignalingState),

    #[error("unexpected answer in state {0:?}")]
    UnexpectedAnswer(SignalingState),

    #[error("candidate received before local offer")]
    EarlyCandidate,

    #[error("remote description is not valid SDP")]
    InvalidDescription,

    #[error("signaling is closed")]
    Closed,
}

pub struct PeerSignaling {
    state: SignalingState,
    session_id: u64,
    ice_ufrag: String,
    ice_pwd: String,
    local_offer: Option<String>,
    remote_answer: Option<String>,
    remote_candidates: Vec<IceCandidate>,
}

impl PeerSignaling {
    pub fn new() -> Self {
        let mut rng = rand::rng();
        Self {
            state: SignalingState::New,
            session_id: rng.random::<u32>() as u64,
            ice_ufrag: Alphanumeric.sample_string(&mut rng, 8),
            ice_pwd: Alphanumeric.sample_string(&mut rng, 24),
            local_offer: None,
            remote_answer: None,
            remote_candidates: Vec::new(),
        }
    }

    /// Build the local offer for a 16 kHz mono voice session and move to
    /// `HaveLocalOffer`. Valid exactly once per peer.
    pub fn create_offer(&mut self) -> Result<String, SignalingError> {
        if self.state == SignalingState::Closed {
            return Err(SignalingError::Closed);
        }
        if self.state != SignalingState::New {
            return Err(SignalingError::OfferAlreadyCreated(self.state));
        }
        let sdp = build_offer_sdp(self.session_id, &self.ice_ufrag, &self.ice_pwd);
        self.local_offer = Some(sdp.clone());
        self.state = SignalingState::HaveLocalOffer;
        Ok(sdp)
    }

    /// Apply the remote answer, completing negotiation.
    pub fn apply_answer(&mut self, sdp: &str) -> Result<(), SignalingError> {
        match self.state {
            SignalingState::HaveLocalOffer => {}
            SignalingState::Closed => return Err(SignalingError::Closed),
            s => return Err(SignalingError::UnexpectedAnswer(s)),
        }
        if !sdp.trim_start().starts_with("v=") {
            return Err(SignalingError::InvalidDescription);
        }
        self.remote_answer = Some(sdp.to_string());
        self.state = SignalingState::Stable;
        Ok(())
    }

    /// Record a remote ICE candidate. Candidates are applied in arrival
    /// order and accepted any time after the local offer exists.
    pub fn add_remote_candidate(&mut self, candidate: IceCandidate) -> Result<(), SignalingError> {
        match self.state {
            SignalingState::HaveLocalOffer | SignalingState::Stable => {
                self.remote_candidates.push(candidate);
                Ok(())
            }
            SignalingState::Closed => Err(SignalingError::Closed),
            SignalingState::New => Err(SignalingError::EarlyCandidate),
        }
    }

    pub fn close(&mut self) {
        self.state = SignalingState::Closed;
    }

    pub fn state(&self) -> SignalingState {
        self.state
    }

    pub fn local_offer(&self) -> Option<&str> {
        self.local_offer.as_deref()
    }

    pub fn remote_answer(&self) -> Option<&str> {
        self.remote_answer.as_deref()
    }

    pub fn remote_candidates(&self) -> &[IceCandidate] {
        &self.remote_candidates
    }
}

impl Default for PeerSignaling {
    fn default() -> Self {
        Self::new()
    }
}

fn build_offer_sdp(session_id: u64, ice_ufrag: &str, ice_pwd: &str) -> String {
    let lines = [
        "v=0".to_string(),
        format!("o=- {} 2 IN IP4 127.0.0.1", session_id),
        "s=-".to_string(),
        "t=0 0".to_string(),
        "a=group:BUNDLE 0".to_string(),
        "m=audio 9 UDP/TLS/RTP/SAVPF 111".to_string(),
        "c=IN IP4 0.0.0.0".to_string(),
        format!("a=ice-ufrag:{}", ice_ufrag),
        format!("a=ice-pwd:{}", ice_pwd),
        "a=setup:actpass".to_string(),
        "a=mid:0".to_string(),
        "a=sendrecv".to_string(),
        "a=rtcp-mux".to_string(),
        "a=rtpmap:111 opus/48000/2".to_string(),
        "a=fmtp:111 minptime=10;useinbandfec=1".to_string(),
    ];
    let mut sdp = lines.join("\r\n");
    sdp.push_str("\r\n");
    sdp
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate() -> IceCandidate {
        IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 192.0.2.1 54400 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }
    }

    #[test]
    fn offer_then_answer_reaches_stable() {
        let mut peer = PeerSignaling::new();
        assert_eq!(peer.state(), SignalingState::New);

        let offer = peer.create_offer().unwrap();
        assert!(offer.starts_with("v=0"));
        assert!(offer.contains("m=audio"));
        assert!(offer.contains("a=sendrecv"));
        assert_eq!(peer.state(), SignalingState::HaveLocalOffer);

        peer.apply_answer("v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\ns=-\r\n").unwrap();
        assert_eq!(peer.state(), SignalingState::Stable);
        assert!(peer.remote_answer().is_some());
    }

    #[test]
    fn second_offer_is_rejected() {
        let mut peer = PeerSignaling::new();
        peer.create_offer().unwrap();
        assert!(matches!(
            peer.create_offer(),
            Err(SignalingError::OfferAlreadyCreated(_))
        ));
    }

    #[test]
    fn answer_before_offer_is_rejected() {
        let mut peer = PeerSignaling::new();
        assert!(matches!(
            peer.apply_answer("v=0"),
            Err(SignalingError::UnexpectedAnswer(SignalingState::New))
        ));
    }

    #[test]
    fn non_sdp_answer_is_rejected() {
        let mut peer = PeerSignaling::new();
        peer.create_offer().unwrap();
        assert!(matches!(
            peer.apply_answer("{\"not\":\"sdp\"}"),
            Err(SignalingError::InvalidDescription)
        ));
        assert_eq!(peer.state(), SignalingState::HaveLocalOffer);
    }

    #[test]
    fn candidates_kept_in_arrival_order() {
        let mut peer = PeerSignaling::new();
        peer.create_offer().unwrap();
        let mut second = candidate();
        second.candidate = "candidate:2 1 udp 1686052607 198.51.100.7 61000 typ srflx".into();

        peer.add_remote_candidate(candidate()).unwrap();
        peer.add_remote_candidate(second.clone()).unwrap();
        assert_eq!(peer.remote_candidates().len(), 2);
        assert_eq!(peer.remote_candidates()[1], second);
    }

    #[test]
    fn candidate_before_offer_is_rejected() {
        let mut peer = PeerSignaling::new();
        assert!(matches!(
            peer.add_remote_candidate(candidate()),
            Err(SignalingError::EarlyCandidate)
        ));
    }

    #[test]
    fn closed_peer_rejects_everything() {
        let mut peer = PeerSignaling::new();
        peer.create_offer().unwrap();
        peer.close();
        assert!(matches!(peer.apply_answer("v=0"), Err(SignalingError::Closed)));
        assert!(matches!(
            peer.add_remote_candidate(candidate()),
            Err(SignalingError::Closed)
        ));
    }

    #[test]
    fn offers_carry_unique_ice_credentials() {
        let a = PeerSignaling::new().create_offer().unwrap();
        let b = PeerSignaling::new().create_offer().unwrap();
        assert_ne!(a, b);
    }
}
