//! JSON wire messages exchanged over the rendezvous WebSocket.
//!
//! Every frame is a JSON object carrying a string `type` tag; field names are
//! camelCase on the wire. Peer-to-peer setup payloads (`offer`, `answer`,
//! `candidate`) are opaque to the server: they are held as raw
//! [`serde_json::Value`]s and any extra sibling fields are preserved through
//! the relay via flattened maps.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A frame sent by a client to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Bind this transport to a user id and register its fingerprint.
    #[serde(rename_all = "camelCase")]
    Identify {
        /// Opaque client-chosen user id.
        user_id: String,
        /// Opaque browser fingerprint for reputation aggregation.
        fingerprint: String,
    },
    /// Join the text-mode matching queue.
    #[serde(rename_all = "camelCase")]
    JoinText {
        /// Joining user.
        user_id: String,
    },
    /// Join the video-mode matching queue.
    #[serde(rename_all = "camelCase")]
    JoinVideo {
        /// Joining user.
        user_id: String,
    },
    /// Join the voice-mode matching queue.
    #[serde(rename_all = "camelCase")]
    JoinVoice {
        /// Joining user.
        user_id: String,
    },
    /// Relay a chat message to the current partner.
    #[serde(rename_all = "camelCase")]
    TextMessage {
        /// Sending user.
        user_id: String,
        /// Intended recipient.
        target_id: String,
        /// Message body; validated and filtered before relay.
        message: String,
    },
    /// Relay an opaque session-setup offer.
    #[serde(rename_all = "camelCase")]
    Offer {
        /// Sending user.
        user_id: String,
        /// Intended recipient.
        target_id: String,
        /// Opaque offer payload, never inspected.
        offer: Value,
        /// Extra fields copied through verbatim.
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
    /// Relay an opaque session-setup answer.
    #[serde(rename_all = "camelCase")]
    Answer {
        /// Sending user.
        user_id: String,
        /// Intended recipient.
        target_id: String,
        /// Opaque answer payload, never inspected.
        answer: Value,
        /// Extra fields copied through verbatim.
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
    /// Relay an opaque transport candidate.
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        /// Sending user.
        user_id: String,
        /// Intended recipient.
        target_id: String,
        /// Opaque candidate payload, never inspected.
        candidate: Value,
        /// Extra fields copied through verbatim.
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
    /// Leave the current pair or queue (skip / next-stranger).
    #[serde(rename_all = "camelCase")]
    Disconnect {
        /// Departing user.
        user_id: String,
    },
    /// Partner started typing.
    #[serde(rename_all = "camelCase")]
    TypingStart {
        /// Sending user.
        user_id: String,
        /// Intended recipient.
        target_id: String,
    },
    /// Partner stopped typing.
    #[serde(rename_all = "camelCase")]
    TypingStop {
        /// Sending user.
        user_id: String,
        /// Intended recipient.
        target_id: String,
    },
    /// Report another user for abuse.
    #[serde(rename_all = "camelCase")]
    ReportUser {
        /// Reporting user.
        user_id: String,
        /// User being reported.
        reported_id: String,
        /// Free-form reason.
        reason: String,
    },
    /// Ask the partner to upgrade to video.
    #[serde(rename_all = "camelCase")]
    VideoRequest {
        /// Intended recipient.
        to: String,
        /// Sending user.
        from: String,
    },
    /// Accept a pending video upgrade request.
    #[serde(rename_all = "camelCase")]
    VideoAccept {
        /// Intended recipient.
        to: String,
        /// Sending user.
        from: String,
    },
    /// Decline a pending video upgrade request.
    #[serde(rename_all = "camelCase")]
    VideoDecline {
        /// Intended recipient.
        to: String,
        /// Sending user.
        from: String,
    },
    /// Cancel a video upgrade request the sender made earlier.
    #[serde(rename_all = "camelCase")]
    VideoCancel {
        /// Intended recipient.
        to: String,
        /// Sending user.
        from: String,
    },
    /// Opt in to switching the current session to video mode.
    #[serde(rename_all = "camelCase")]
    ModeSwitchToVideo {
        /// Sending user.
        user_id: String,
        /// The user's current partner.
        partner_id: String,
    },
    /// Application-level keepalive; a no-op at the router.
    Ping,
}

/// A notification sent by the server to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// No partner available yet; the user is queued.
    Waiting,
    /// A partner was found.
    #[serde(rename_all = "camelCase")]
    Paired {
        /// The partner's user id.
        partner_id: String,
        /// Set for peer-to-peer modes: true on the side that creates the
        /// session offer. Absent for text pairs.
        #[serde(skip_serializing_if = "Option::is_none")]
        is_offerer: Option<bool>,
    },
    /// Relayed chat message.
    #[serde(rename_all = "camelCase")]
    TextMessage {
        /// Originating user.
        from: String,
        /// Filtered message body.
        message: String,
    },
    /// Relayed opaque offer.
    #[serde(rename_all = "camelCase")]
    Offer {
        /// Originating user.
        from: String,
        /// Opaque offer payload.
        offer: Value,
        /// Extra fields copied through verbatim.
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
    /// Relayed opaque answer.
    #[serde(rename_all = "camelCase")]
    Answer {
        /// Originating user.
        from: String,
        /// Opaque answer payload.
        answer: Value,
        /// Extra fields copied through verbatim.
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
    /// Relayed opaque candidate.
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        /// Originating user.
        from: String,
        /// Opaque candidate payload.
        candidate: Value,
        /// Extra fields copied through verbatim.
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
    /// Partner started typing.
    #[serde(rename_all = "camelCase")]
    TypingStart {
        /// Originating user.
        from: String,
    },
    /// Partner stopped typing.
    #[serde(rename_all = "camelCase")]
    TypingStop {
        /// Originating user.
        from: String,
    },
    /// The user's partner left or dropped.
    PartnerDisconnected,
    /// Total number of connected users.
    #[serde(rename_all = "camelCase")]
    UserCount {
        /// Live connection count.
        count: usize,
    },
    /// Relayed video upgrade request.
    #[serde(rename_all = "camelCase")]
    VideoRequest {
        /// Originating user.
        from: String,
    },
    /// Relayed video upgrade acceptance.
    #[serde(rename_all = "camelCase")]
    VideoAccept {
        /// Originating user.
        from: String,
    },
    /// Relayed video upgrade decline.
    #[serde(rename_all = "camelCase")]
    VideoDecline {
        /// Originating user.
        from: String,
    },
    /// Relayed video upgrade cancellation.
    #[serde(rename_all = "camelCase")]
    VideoCancel {
        /// Originating user.
        from: String,
    },
    /// Both sides opted in; begin peer-to-peer renegotiation.
    #[serde(rename_all = "camelCase")]
    VideoModeReady {
        /// True on the side that creates the session offer.
        is_offerer: bool,
        /// The partner's user id.
        partner_id: String,
    },
    /// Non-fatal advisory (reputation, abuse patterns).
    #[serde(rename_all = "camelCase")]
    Warning {
        /// Human-readable warning.
        message: String,
    },
    /// The requested action was rejected.
    #[serde(rename_all = "camelCase")]
    Error {
        /// Terse rejection reason.
        message: String,
    },
}
