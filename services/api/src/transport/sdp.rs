//! Minimal SDP handling for the media handshake.
//!
//! Only what the browser client needs is checked and produced: an audio
//! section in the offer, and an answer that points at the media socket.

use vaani_core::{
    audio::{INBOUND_SAMPLE_RATE, OUTBOUND_SAMPLE_RATE},
    transport::{NegotiationError, Offer},
};

/// Attribute carrying the media socket path in an answer.
pub const MEDIA_ENDPOINT_ATTRIBUTE: &str = "a=x-media-endpoint:";

pub fn validate_offer(offer: &Offer) -> Result<(), NegotiationError> {
    if offer.kind != "offer" {
        return Err(NegotiationError::MalformedOffer(format!(
            "expected type \"offer\", got \"{}\"",
            offer.kind
        )));
    }
    let mut lines = offer.sdp.lines().map(str::trim).filter(|l| !l.is_empty());
    if lines.next() != Some("v=0") {
        return Err(NegotiationError::MalformedOffer(
            "sdp must start with v=0".into(),
        ));
    }
    if !lines.any(|l| l.starts_with("m=audio")) {
        return Err(NegotiationError::MalformedOffer(
            "sdp has no audio media section".into(),
        ));
    }
    Ok(())
}

/// Builds the answer body for a slot reachable at `/media/{token}`.
pub fn build_answer(token: &str) -> String {
    let session_version = chrono::Utc::now().timestamp();
    [
        "v=0".to_string(),
        format!("o=vaani {session_version} {session_version} IN IP4 0.0.0.0"),
        "s=vaani".to_string(),
        "t=0 0".to_string(),
        "m=audio 9 TCP/WS 96 97".to_string(),
        format!("a=rtpmap:96 L16/{INBOUND_SAMPLE_RATE}"),
        format!("a=rtpmap:97 L16/{OUTBOUND_SAMPLE_RATE}"),
        "a=sendrecv".to_string(),
        format!("{MEDIA_ENDPOINT_ATTRIBUTE}/media/{token}"),
    ]
    .join("\r\n")
        + "\r\n"
}

/// Extracts the media path from an answer body.
pub fn media_endpoint(answer_sdp: &str) -> Option<&str> {
    answer_sdp
        .lines()
        .find_map(|l| l.trim().strip_prefix(MEDIA_ENDPOINT_ATTRIBUTE))
}
