use crate::metrics::{counters, gauges, histograms};
use crate::pairing::{PairingManager, SwitchOutcome};
use crate::queue::{Enqueue, QueueManager};
use crate::ratelimit::ActionKind;
use crate::registry::{ConnHandle, ConnStats, Outbound, Registry};
use crate::security::{AbusePattern, SecurityManager, REPORT_BAN_THRESHOLD};
use serde_json::error::Category;
use std::net::IpAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tryst_common::message::{ClientMessage, ServerMessage};
use tryst_common::Mode;
use tungstenite::protocol::frame::coding::CloseCode;

/// Ban length applied to detected spammers.
const SPAMMER_BAN: Duration = Duration::from_secs(3600);

/// What the connection loop should do after a frame was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDisposition {
    /// Keep reading frames.
    Continue,
    /// Close the transport with a protocol-error code.
    CloseProtocol,
}

/// The user id a transport is bound to, plus the binding generation.
#[derive(Debug, Clone)]
pub struct Binding {
    /// Bound user id.
    pub user_id: String,
    /// Registration instant; guards against unbinding a successor.
    pub bound_at: Instant,
}

/// Per-connection context threaded through the router by the owning task.
#[derive(Debug)]
pub struct ConnContext {
    /// Outbound channel of this connection.
    pub tx: mpsc::Sender<Outbound>,
    /// Traffic counters shared with the registry handle.
    pub stats: Arc<ConnStats>,
    /// Remote IP established at admission.
    pub ip: IpAddr,
    /// Current identify binding, if any.
    pub binding: Option<Binding>,
}

impl ConnContext {
    /// Creates a context for a freshly admitted, not yet identified
    /// connection.
    #[must_use]
    pub fn new(tx: mpsc::Sender<Outbound>, ip: IpAddr) -> Self {
        Self {
            tx,
            stats: Arc::new(ConnStats::default()),
            ip,
            binding: None,
        }
    }
}

/// The message router: validates every inbound frame and orchestrates the
/// queue, pairing, connection, and security managers.
///
/// The router is the only component that sequences cross-manager state
/// changes. A coordination mutex spans enqueue → match → pair → notify and
/// the disconnect sequence, so no client can observe `paired` before the
/// pairing maps are updated and pair teardown cannot interleave with a
/// concurrent join for either user.
pub struct Router {
    registry: Arc<Registry>,
    queue: Arc<QueueManager>,
    pairing: Arc<PairingManager>,
    security: Arc<SecurityManager>,
    max_frame_size: usize,
    max_message_length: usize,
    coord: Mutex<()>,
}

impl Router {
    /// Wires the router to the four managers.
    #[must_use]
    pub fn new(
        registry: Arc<Registry>,
        queue: Arc<QueueManager>,
        pairing: Arc<PairingManager>,
        security: Arc<SecurityManager>,
        max_frame_size: usize,
        max_message_length: usize,
    ) -> Self {
        Self {
            registry,
            queue,
            pairing,
            security,
            max_frame_size,
            max_message_length,
            coord: Mutex::new(()),
        }
    }

    /// Handles one inbound text frame from a connection.
    pub fn handle_frame(&self, ctx: &mut ConnContext, raw: &str) -> FrameDisposition {
        let start = Instant::now();

        if raw.len() > self.max_frame_size {
            counters::messages_dropped_total("oversize");
            reply(ctx, &ServerMessage::Error {
                message: "message too large".into(),
            });
            return FrameDisposition::Continue;
        }

        let message = match serde_json::from_str::<ClientMessage>(raw) {
            Ok(message) => message,
            Err(e) if matches!(e.classify(), Category::Syntax | Category::Eof) => {
                counters::messages_dropped_total("undecodable");
                reply(ctx, &ServerMessage::Error {
                    message: "invalid json".into(),
                });
                return FrameDisposition::CloseProtocol;
            }
            Err(e) => {
                counters::messages_dropped_total("schema");
                reply(ctx, &ServerMessage::Error {
                    message: schema_error(&e),
                });
                return FrameDisposition::Continue;
            }
        };

        self.dispatch(ctx, message);
        histograms::frame_handle_seconds(start.elapsed().as_secs_f64());
        FrameDisposition::Continue
    }

    fn dispatch(&self, ctx: &mut ConnContext, message: ClientMessage) {
        match message {
            ClientMessage::Identify { user_id, fingerprint } => {
                self.on_identify(ctx, &user_id, &fingerprint);
            }
            ClientMessage::JoinText { user_id } => self.on_join(ctx, &user_id, Mode::Text),
            ClientMessage::JoinVideo { user_id } => self.on_join(ctx, &user_id, Mode::Video),
            ClientMessage::JoinVoice { user_id } => self.on_join(ctx, &user_id, Mode::Voice),
            ClientMessage::TextMessage { user_id, target_id, message } => {
                self.on_text_message(ctx, &user_id, &target_id, &message);
            }
            ClientMessage::Offer { user_id, target_id, offer, extra } => {
                self.relay_signal(&target_id, ServerMessage::Offer {
                    from: user_id,
                    offer,
                    extra,
                });
            }
            ClientMessage::Answer { user_id, target_id, answer, extra } => {
                self.relay_signal(&target_id, ServerMessage::Answer {
                    from: user_id,
                    answer,
                    extra,
                });
            }
            ClientMessage::IceCandidate { user_id, target_id, candidate, extra } => {
                self.relay_signal(&target_id, ServerMessage::IceCandidate {
                    from: user_id,
                    candidate,
                    extra,
                });
            }
            ClientMessage::Disconnect { user_id } => {
                let _section = self.coord();
                self.run_disconnect_sequence(&user_id);
            }
            ClientMessage::TypingStart { user_id, target_id } => {
                self.relay_signal(&target_id, ServerMessage::TypingStart { from: user_id });
            }
            ClientMessage::TypingStop { user_id, target_id } => {
                self.relay_signal(&target_id, ServerMessage::TypingStop { from: user_id });
            }
            ClientMessage::ReportUser { user_id, reported_id, reason } => {
                self.on_report(ctx, &user_id, &reported_id, &reason);
            }
            ClientMessage::VideoRequest { to, from } => {
                self.relay_video_control(&from, &to, ServerMessage::VideoRequest {
                    from: from.clone(),
                });
            }
            ClientMessage::VideoAccept { to, from } => {
                self.relay_video_control(&from, &to, ServerMessage::VideoAccept {
                    from: from.clone(),
                });
            }
            ClientMessage::VideoDecline { to, from } => {
                self.relay_video_control(&from, &to, ServerMessage::VideoDecline {
                    from: from.clone(),
                });
            }
            ClientMessage::VideoCancel { to, from } => {
                self.relay_video_control(&from, &to, ServerMessage::VideoCancel {
                    from: from.clone(),
                });
            }
            ClientMessage::ModeSwitchToVideo { user_id, partner_id } => {
                self.on_mode_switch(ctx, &user_id, &partner_id);
            }
            // Transport-level pongs keep the heartbeat alive; nothing to do.
            ClientMessage::Ping => {}
        }
    }

    /// Binds the connection to a user id and registers its fingerprint.
    fn on_identify(&self, ctx: &mut ConnContext, user_id: &str, fingerprint: &str) {
        if let Some(prior) = ctx.binding.take() {
            if prior.user_id != user_id {
                // The transport re-identified as someone else; the old
                // identity is gone.
                let _section = self.coord();
                if self.registry.owns(&prior.user_id, prior.bound_at) {
                    self.registry.remove_if(&prior.user_id, prior.bound_at);
                    gauges::dec_connections_active();
                    self.run_disconnect_sequence(&prior.user_id);
                }
            }
        }

        let handle = ConnHandle {
            tx: ctx.tx.clone(),
            ip: ctx.ip,
            bound_at: Instant::now(),
            stats: ctx.stats.clone(),
        };
        let bound_at = handle.bound_at;
        match self.registry.insert(user_id, handle) {
            Some(old) if !old.tx.same_channel(&ctx.tx) => {
                // One connection per user id: the newcomer wins.
                debug!(user_id, "replacing existing connection");
                old.close(CloseCode::Normal, "replaced by new connection");
            }
            Some(_) => {}
            None => gauges::inc_connections_active(),
        }
        ctx.binding = Some(Binding {
            user_id: user_id.to_string(),
            bound_at,
        });

        if let Some(reason) = self.security.track_fingerprint(fingerprint, user_id) {
            warn!(user_id, fingerprint, "suspicious fingerprint");
            self.registry.send_to_user(user_id, &ServerMessage::Warning {
                message: reason.into(),
            });
        }

        self.broadcast_user_count();
    }

    /// Enqueues the user and completes a match if one is available.
    fn on_join(&self, ctx: &mut ConnContext, user_id: &str, mode: Mode) {
        if !self.registry.contains(user_id) {
            reply(ctx, &ServerMessage::Error {
                message: "identify first".into(),
            });
            return;
        }

        let _section = self.coord();

        if self.pairing.is_paired(user_id) {
            reply(ctx, &ServerMessage::Error {
                message: "already paired".into(),
            });
            return;
        }

        if self.queue.add_to_queue(user_id, mode, 0) == Enqueue::QueueFull {
            reply(ctx, &ServerMessage::Error {
                message: "queue full".into(),
            });
            return;
        }

        let Some(matched) = self.queue.match_users(mode) else {
            self.registry.send_to_user(user_id, &ServerMessage::Waiting);
            return;
        };

        if let Err(e) = self.pairing.create_pair(&matched.user1, &matched.user2, mode) {
            // Unreachable under the coordination section; restore the queue.
            warn!(user1 = %matched.user1, user2 = %matched.user2, "pair creation failed: {e}");
            let _ = self.queue.add_to_queue(&matched.user1, mode, 1);
            let _ = self.queue.add_to_queue(&matched.user2, mode, 1);
            self.registry.send_to_user(user_id, &ServerMessage::Waiting);
            return;
        }

        counters::matches_total(mode.as_str());
        histograms::match_wait_seconds(matched.wait.as_secs_f64());
        gauges::inc_pairs_active();
        info!(user1 = %matched.user1, user2 = %matched.user2, mode = %mode, "paired");

        // The first-popped (longer waiting) user is the offerer for
        // peer-to-peer modes; text pairs carry no offerer field.
        let offerer = mode.needs_offerer();
        self.registry.send_to_user(&matched.user1, &ServerMessage::Paired {
            partner_id: matched.user2.clone(),
            is_offerer: offerer.then_some(true),
        });
        self.registry.send_to_user(&matched.user2, &ServerMessage::Paired {
            partner_id: matched.user1.clone(),
            is_offerer: offerer.then_some(false),
        });
    }

    /// Validates, filters, counts, and relays one chat message.
    fn on_text_message(&self, ctx: &mut ConnContext, user_id: &str, target_id: &str, body: &str) {
        if !self.security.check_rate_limit(user_id, ActionKind::Message) {
            counters::messages_dropped_total("rate_limit");
            reply(ctx, &ServerMessage::Error {
                message: format!("rate limit exceeded: {}", ActionKind::Message.as_str()),
            });
            return;
        }

        let filtered = match crate::content::validate_message(body, self.max_message_length) {
            Ok(filtered) => filtered,
            Err(e) => {
                counters::messages_dropped_total("content");
                reply(ctx, &ServerMessage::Error { message: e.to_string() });
                return;
            }
        };

        self.security.track_message(user_id);
        if self
            .security
            .detect_abuse_patterns(user_id)
            .contains(&AbusePattern::Spammer)
        {
            self.ban_and_disconnect(user_id, SPAMMER_BAN, AbusePattern::Spammer.as_str());
            return;
        }

        self.pairing.increment_message_count(user_id);

        let delivered = self.registry.send_to_user(target_id, &ServerMessage::TextMessage {
            from: user_id.to_string(),
            message: filtered,
        });
        if delivered {
            counters::messages_relayed_total();
        } else {
            counters::messages_dropped_total("offline");
        }
    }

    /// Opaque relay for signaling and typing frames.
    fn relay_signal(&self, target_id: &str, message: ServerMessage) {
        if !self.registry.send_to_user(target_id, &message) {
            counters::messages_dropped_total("offline");
            debug!(target_id, "dropping relay to absent target");
        }
    }

    /// Relays a video-upgrade control frame, but only between actual
    /// partners. Stale or forged ids are dropped and logged.
    fn relay_video_control(&self, from: &str, to: &str, message: ServerMessage) {
        if !self.pairing.are_paired(from, to) {
            counters::messages_dropped_total("not_paired");
            debug!(from, to, "dropping video control between unpaired users");
            return;
        }
        self.relay_signal(to, message);
    }

    /// Registers an abuse report and applies the cascade ban at the
    /// threshold.
    fn on_report(&self, ctx: &mut ConnContext, reporter: &str, reported_id: &str, reason: &str) {
        if !self.security.check_rate_limit(reporter, ActionKind::Report) {
            reply(ctx, &ServerMessage::Error {
                message: format!("rate limit exceeded: {}", ActionKind::Report.as_str()),
            });
            return;
        }

        counters::reports_total();
        info!(reporter, reported_id, reason, "user reported");
        let total = self.security.track_report_against(reported_id);
        self.security.note_report_against(reported_id);

        if total >= REPORT_BAN_THRESHOLD {
            self.ban_and_disconnect_default(reported_id, "report threshold reached");
        }
    }

    /// Completes one side of the mode-switch handshake.
    fn on_mode_switch(&self, ctx: &mut ConnContext, user_id: &str, partner_id: &str) {
        match self.pairing.switch_mode(user_id, partner_id, Mode::Video) {
            // First arrival: nothing goes out until the partner opts in.
            Ok(SwitchOutcome::WaitingForPartner) => {}
            Ok(SwitchOutcome::Ready { partner_id }) => {
                counters::mode_switches_total();
                self.registry.send_to_user(user_id, &ServerMessage::VideoModeReady {
                    is_offerer: false,
                    partner_id: partner_id.clone(),
                });
                self.registry.send_to_user(&partner_id, &ServerMessage::VideoModeReady {
                    is_offerer: true,
                    partner_id: user_id.to_string(),
                });
            }
            Err(e) => {
                reply(ctx, &ServerMessage::Error { message: e.to_string() });
            }
        }
    }

    /// The disconnect sequence for `user_id`. Must run inside the
    /// coordination section.
    fn run_disconnect_sequence(&self, user_id: &str) {
        self.queue.remove_from_queue(user_id);

        let partner = self.pairing.get_pair(user_id);
        if partner.is_some() {
            self.security.track_skip(user_id);
        }

        let patterns = self.security.detect_abuse_patterns(user_id);
        if patterns.contains(&AbusePattern::Harasser) {
            if let Some(ip) = self.registry.ip_of(user_id) {
                self.security.ban_ip_default(ip, AbusePattern::Harasser.as_str());
                self.security.note_ban_against(user_id);
                counters::bans_total(AbusePattern::Harasser.as_str());
            }
            warn!(user_id, "harasser pattern on disconnect");
        } else if patterns.contains(&AbusePattern::SkipAbuser) {
            self.registry.send_to_user(user_id, &ServerMessage::Warning {
                message: "You are skipping partners too quickly".into(),
            });
        }

        let Some(partner_id) = partner else {
            return;
        };
        let partner_mode = self.pairing.get_user_mode(&partner_id);

        let Some(broken) = self.pairing.break_pair(user_id) else {
            return;
        };
        gauges::dec_pairs_active();
        debug!(
            user_id,
            partner_id = %broken.partner_id,
            messages = broken.session.message_count,
            "pair ended"
        );

        self.registry
            .send_to_user(&partner_id, &ServerMessage::PartnerDisconnected);

        if self.registry.contains(&partner_id) {
            if let Some(mode) = partner_mode {
                // The partner already waited a full turn; requeue them in the
                // priority tier with a fresh timestamp.
                match self.queue.add_to_queue(&partner_id, mode, 1) {
                    Enqueue::Admitted => {
                        self.registry.send_to_user(&partner_id, &ServerMessage::Waiting);
                    }
                    Enqueue::QueueFull => {
                        self.registry.send_to_user(&partner_id, &ServerMessage::Error {
                            message: "queue full".into(),
                        });
                    }
                }
            }
        }
    }

    /// Tears down state for a transport that actually closed.
    pub fn handle_departure(&self, binding: &Binding) {
        let _section = self.coord();
        if !self.registry.owns(&binding.user_id, binding.bound_at) {
            // Replaced by a newer connection; the successor owns the state.
            return;
        }
        self.registry.remove_if(&binding.user_id, binding.bound_at);
        gauges::dec_connections_active();
        self.run_disconnect_sequence(&binding.user_id);
        self.broadcast_user_count();
    }

    fn ban_and_disconnect_default(&self, user_id: &str, reason: &'static str) {
        if let Some(ip) = self.registry.ip_of(user_id) {
            self.security.ban_ip_default(ip, reason);
        }
        self.security.note_ban_against(user_id);
        counters::bans_total(reason);
        self.registry.close_user(user_id, CloseCode::Policy, reason);
    }

    fn ban_and_disconnect(&self, user_id: &str, duration: Duration, reason: &'static str) {
        if let Some(ip) = self.registry.ip_of(user_id) {
            self.security.ban_ip(ip, duration, reason);
        }
        self.security.note_ban_against(user_id);
        counters::bans_total(reason);
        self.registry.close_user(user_id, CloseCode::Policy, reason);
    }

    fn broadcast_user_count(&self) {
        self.registry.broadcast_to_all(
            &ServerMessage::UserCount {
                count: self.registry.count(),
            },
            &[],
        );
    }

    fn coord(&self) -> std::sync::MutexGuard<'_, ()> {
        self.coord.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn reply(ctx: &ConnContext, message: &ServerMessage) {
    let Ok(json) = serde_json::to_string(message) else {
        return;
    };
    let bytes = json.len() as u64;
    if ctx.tx.try_send(Outbound::Frame(json)).is_ok() {
        ctx.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        ctx.stats.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }
}

/// Terse description of a schema validation failure: the leading clause of
/// the serde message ("missing field `x`", "unknown variant `y`") without the
/// expected-list and position noise.
fn schema_error(e: &serde_json::Error) -> String {
    let text = e.to_string();
    let mut head = text.as_str();
    if let Some(pos) = head.find(", expected") {
        head = &head[..pos];
    }
    if let Some(pos) = head.find(" at line") {
        head = &head[..pos];
    }
    format!("invalid message: {head}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::valid_config;
    use crate::registry::DELIVERY_QUEUE_DEPTH;

    struct TestPeer {
        ctx: ConnContext,
        rx: mpsc::Receiver<Outbound>,
    }

    impl TestPeer {
        fn new(ip: &str) -> Self {
            let (tx, rx) = mpsc::channel(DELIVERY_QUEUE_DEPTH);
            Self {
                ctx: ConnContext::new(tx, ip.parse().unwrap()),
                rx,
            }
        }

        fn recv(&mut self) -> ServerMessage {
            loop {
                match self.rx.try_recv().expect("expected a frame") {
                    Outbound::Frame(json) => {
                        let msg: ServerMessage = serde_json::from_str(&json).unwrap();
                        if matches!(msg, ServerMessage::UserCount { .. }) {
                            continue;
                        }
                        return msg;
                    }
                    Outbound::Close { .. } => panic!("unexpected close"),
                }
            }
        }

        fn try_recv(&mut self) -> Option<ServerMessage> {
            while let Ok(out) = self.rx.try_recv() {
                if let Outbound::Frame(json) = out {
                    let msg: ServerMessage = serde_json::from_str(&json).unwrap();
                    if !matches!(msg, ServerMessage::UserCount { .. }) {
                        return Some(msg);
                    }
                }
            }
            None
        }

        fn expect_close(&mut self) -> CloseCode {
            loop {
                match self.rx.try_recv().expect("expected close") {
                    Outbound::Frame(_) => continue,
                    Outbound::Close { code, .. } => return code,
                }
            }
        }
    }

    fn router() -> Router {
        let config = valid_config();
        Router::new(
            Arc::new(Registry::new()),
            Arc::new(QueueManager::new(config.max_queue_size, config.queue_timeout)),
            Arc::new(PairingManager::new(config.mode_switch_timeout)),
            Arc::new(SecurityManager::new(&config)),
            config.max_message_size,
            config.max_message_length,
        )
    }

    fn frame(router: &Router, peer: &mut TestPeer, json: &str) -> FrameDisposition {
        router.handle_frame(&mut peer.ctx, json)
    }

    fn identify(router: &Router, peer: &mut TestPeer, user: &str) {
        let json = format!(r#"{{"type":"identify","userId":"{user}","fingerprint":"fp-{user}"}}"#);
        assert_eq!(frame(router, peer, &json), FrameDisposition::Continue);
    }

    fn join_text(router: &Router, peer: &mut TestPeer, user: &str) {
        let json = format!(r#"{{"type":"join-text","userId":"{user}"}}"#);
        assert_eq!(frame(router, peer, &json), FrameDisposition::Continue);
    }

    #[test]
    fn two_joiners_get_paired() {
        let r = router();
        let mut x = TestPeer::new("10.0.0.1");
        let mut y = TestPeer::new("10.0.0.2");
        identify(&r, &mut x, "x");
        identify(&r, &mut y, "y");

        join_text(&r, &mut x, "x");
        assert_eq!(x.recv(), ServerMessage::Waiting);

        join_text(&r, &mut y, "y");
        assert_eq!(
            x.recv(),
            ServerMessage::Paired { partner_id: "y".into(), is_offerer: None }
        );
        assert_eq!(
            y.recv(),
            ServerMessage::Paired { partner_id: "x".into(), is_offerer: None }
        );
    }

    #[test]
    fn video_pair_labels_exactly_one_offerer() {
        let r = router();
        let mut x = TestPeer::new("10.0.0.1");
        let mut y = TestPeer::new("10.0.0.2");
        identify(&r, &mut x, "x");
        identify(&r, &mut y, "y");
        frame(&r, &mut x, r#"{"type":"join-video","userId":"x"}"#);
        assert_eq!(x.recv(), ServerMessage::Waiting);
        frame(&r, &mut y, r#"{"type":"join-video","userId":"y"}"#);

        let ServerMessage::Paired { is_offerer: x_offerer, .. } = x.recv() else {
            panic!("expected paired");
        };
        let ServerMessage::Paired { is_offerer: y_offerer, .. } = y.recv() else {
            panic!("expected paired");
        };
        // x waited longer, so x creates the offer.
        assert_eq!(x_offerer, Some(true));
        assert_eq!(y_offerer, Some(false));
    }

    #[test]
    fn join_before_identify_is_rejected() {
        let r = router();
        let mut x = TestPeer::new("10.0.0.1");
        join_text(&r, &mut x, "x");
        assert!(matches!(x.recv(), ServerMessage::Error { .. }));
    }

    #[test]
    fn double_join_leaves_single_queue_entry_and_no_pair() {
        let r = router();
        let mut x = TestPeer::new("10.0.0.1");
        identify(&r, &mut x, "x");
        join_text(&r, &mut x, "x");
        join_text(&r, &mut x, "x");

        assert_eq!(x.recv(), ServerMessage::Waiting);
        assert_eq!(x.recv(), ServerMessage::Waiting);
        assert!(x.try_recv().is_none(), "no paired frame");
        assert_eq!(r.queue.queue_len(Mode::Text), 1);
        assert!(!r.pairing.is_paired("x"));
    }

    #[test]
    fn text_message_is_filtered_and_relayed() {
        let r = router();
        let mut x = TestPeer::new("10.0.0.1");
        let mut y = TestPeer::new("10.0.0.2");
        identify(&r, &mut x, "x");
        identify(&r, &mut y, "y");
        join_text(&r, &mut x, "x");
        join_text(&r, &mut y, "y");
        let _ = x.recv(); // waiting
        let _ = x.recv(); // paired
        let _ = y.recv(); // paired

        frame(
            &r,
            &mut y,
            r#"{"type":"text-message","userId":"y","targetId":"x","message":"hi"}"#,
        );
        assert_eq!(
            x.recv(),
            ServerMessage::TextMessage { from: "y".into(), message: "hi".into() }
        );
        assert_eq!(r.pairing.get_session_data("x").unwrap().message_count, 1);

        frame(
            &r,
            &mut y,
            r#"{"type":"text-message","userId":"y","targetId":"x","message":"oh shit"}"#,
        );
        assert_eq!(
            x.recv(),
            ServerMessage::TextMessage { from: "y".into(), message: "oh ****".into() }
        );
    }

    #[test]
    fn dangerous_message_is_rejected_not_relayed() {
        let r = router();
        let mut x = TestPeer::new("10.0.0.1");
        let mut y = TestPeer::new("10.0.0.2");
        identify(&r, &mut x, "x");
        identify(&r, &mut y, "y");

        frame(
            &r,
            &mut x,
            r#"{"type":"text-message","userId":"x","targetId":"y","message":"hello <script>alert(1)</script>"}"#,
        );
        assert!(matches!(x.recv(), ServerMessage::Error { .. }));
        assert!(y.try_recv().is_none());
    }

    #[test]
    fn oversized_frame_replies_error_and_stays_open() {
        let r = router();
        let mut x = TestPeer::new("10.0.0.1");
        let huge = format!(
            r#"{{"type":"text-message","userId":"x","targetId":"y","message":"{}"}}"#,
            "a".repeat(11_000)
        );
        assert_eq!(frame(&r, &mut x, &huge), FrameDisposition::Continue);
        assert!(matches!(x.recv(), ServerMessage::Error { .. }));
    }

    #[test]
    fn undecodable_json_closes_with_protocol_error() {
        let r = router();
        let mut x = TestPeer::new("10.0.0.1");
        assert_eq!(frame(&r, &mut x, "{nope"), FrameDisposition::CloseProtocol);
    }

    #[test]
    fn unknown_type_and_missing_field_keep_connection_open() {
        let r = router();
        let mut x = TestPeer::new("10.0.0.1");
        assert_eq!(
            frame(&r, &mut x, r#"{"type":"warp-core-breach"}"#),
            FrameDisposition::Continue
        );
        assert!(matches!(x.recv(), ServerMessage::Error { .. }));

        assert_eq!(
            frame(&r, &mut x, r#"{"type":"identify","userId":"x"}"#),
            FrameDisposition::Continue
        );
        let ServerMessage::Error { message } = x.recv() else {
            panic!("expected error");
        };
        assert!(message.contains("fingerprint"), "{message}");
    }

    #[test]
    fn message_rate_limit_rejects_thirty_first() {
        let r = router();
        let mut x = TestPeer::new("10.0.0.1");
        let mut y = TestPeer::new("10.0.0.2");
        identify(&r, &mut x, "x");
        identify(&r, &mut y, "y");

        let send = r#"{"type":"text-message","userId":"x","targetId":"y","message":"spam?"}"#;
        for _ in 0..30 {
            frame(&r, &mut x, send);
        }
        assert!(x.try_recv().is_none(), "first thirty pass silently");
        frame(&r, &mut x, send);
        assert!(matches!(x.recv(), ServerMessage::Error { .. }));
    }

    #[test]
    fn disconnect_requeues_partner_with_waiting() {
        let r = router();
        let mut x = TestPeer::new("10.0.0.1");
        let mut y = TestPeer::new("10.0.0.2");
        identify(&r, &mut x, "x");
        identify(&r, &mut y, "y");
        join_text(&r, &mut x, "x");
        join_text(&r, &mut y, "y");
        let _ = x.recv();
        let _ = x.recv();
        let _ = y.recv();

        frame(&r, &mut x, r#"{"type":"disconnect","userId":"x"}"#);
        assert_eq!(y.recv(), ServerMessage::PartnerDisconnected);
        assert_eq!(y.recv(), ServerMessage::Waiting);
        assert!(r.queue.is_in_queue("y").is_some_and(|s| s.priority));
        assert!(!r.pairing.is_paired("x"));
        assert!(!r.pairing.is_paired("y"));
    }

    #[test]
    fn departure_skips_teardown_when_binding_was_replaced() {
        let r = router();
        let mut old = TestPeer::new("10.0.0.1");
        identify(&r, &mut old, "x");
        let stale = old.ctx.binding.clone().unwrap();

        let mut new = TestPeer::new("10.0.0.1");
        identify(&r, &mut new, "x");
        assert_eq!(old.expect_close(), CloseCode::Normal);

        join_text(&r, &mut new, "x");
        r.handle_departure(&stale);
        assert!(r.registry.contains("x"), "successor stays bound");
        assert!(r.queue.is_in_queue("x").is_some(), "successor stays queued");
    }

    #[test]
    fn mode_switch_completes_both_sides() {
        let r = router();
        let mut x = TestPeer::new("10.0.0.1");
        let mut y = TestPeer::new("10.0.0.2");
        identify(&r, &mut x, "x");
        identify(&r, &mut y, "y");
        join_text(&r, &mut x, "x");
        join_text(&r, &mut y, "y");
        let _ = x.recv();
        let _ = x.recv();
        let _ = y.recv();

        frame(&r, &mut x, r#"{"type":"mode-switch-to-video","userId":"x","partnerId":"y"}"#);
        assert!(x.try_recv().is_none(), "nothing until both opt in");
        assert!(y.try_recv().is_none());

        frame(&r, &mut y, r#"{"type":"mode-switch-to-video","userId":"y","partnerId":"x"}"#);
        assert_eq!(
            y.recv(),
            ServerMessage::VideoModeReady { is_offerer: false, partner_id: "x".into() }
        );
        assert_eq!(
            x.recv(),
            ServerMessage::VideoModeReady { is_offerer: true, partner_id: "y".into() }
        );

        let session = r.pairing.get_session_data("x").unwrap();
        assert_eq!(session.mode, Mode::Video);
        assert_eq!(session.switch_history.len(), 1);
    }

    #[test]
    fn video_request_relays_only_between_partners() {
        let r = router();
        let mut x = TestPeer::new("10.0.0.1");
        let mut y = TestPeer::new("10.0.0.2");
        let mut z = TestPeer::new("10.0.0.3");
        identify(&r, &mut x, "x");
        identify(&r, &mut y, "y");
        identify(&r, &mut z, "z");
        join_text(&r, &mut x, "x");
        join_text(&r, &mut y, "y");
        let _ = x.recv();
        let _ = x.recv();
        let _ = y.recv();

        frame(&r, &mut x, r#"{"type":"video-request","to":"y","from":"x"}"#);
        assert_eq!(y.recv(), ServerMessage::VideoRequest { from: "x".into() });

        // z is not paired with y: dropped silently.
        frame(&r, &mut z, r#"{"type":"video-request","to":"y","from":"z"}"#);
        assert!(y.try_recv().is_none());
        assert!(z.try_recv().is_none());
    }

    #[test]
    fn offer_relay_passes_extras_through() {
        let r = router();
        let mut x = TestPeer::new("10.0.0.1");
        let mut y = TestPeer::new("10.0.0.2");
        identify(&r, &mut x, "x");
        identify(&r, &mut y, "y");

        frame(
            &r,
            &mut x,
            r#"{"type":"offer","userId":"x","targetId":"y","offer":{"sdp":"v=0"},"gen":3}"#,
        );
        let ServerMessage::Offer { from, offer, extra } = y.recv() else {
            panic!("expected offer");
        };
        assert_eq!(from, "x");
        assert_eq!(offer["sdp"], "v=0");
        assert_eq!(extra["gen"], 3);
    }

    #[test]
    fn report_cascade_bans_at_threshold() {
        let r = router();
        let mut z = TestPeer::new("10.0.0.99");
        identify(&r, &mut z, "z");

        for i in 0..REPORT_BAN_THRESHOLD {
            let mut reporter = TestPeer::new("10.0.1.1");
            identify(&r, &mut reporter, &format!("rep{i}"));
            let json = format!(
                r#"{{"type":"report-user","userId":"rep{i}","reportedId":"z","reason":"abuse"}}"#
            );
            frame(&r, &mut reporter, &json);
        }

        assert!(r.security.is_ip_banned("10.0.0.99".parse().unwrap()));
        assert_eq!(z.expect_close(), CloseCode::Policy);
    }

    #[test]
    fn reporter_rate_limit_holds() {
        let r = router();
        let mut reporter = TestPeer::new("10.0.1.1");
        identify(&r, &mut reporter, "rep");
        for i in 0..3 {
            let json = format!(
                r#"{{"type":"report-user","userId":"rep","reportedId":"t{i}","reason":"x"}}"#
            );
            frame(&r, &mut reporter, &json);
        }
        assert!(reporter.try_recv().is_none());

        frame(
            &r,
            &mut reporter,
            r#"{"type":"report-user","userId":"rep","reportedId":"t9","reason":"x"}"#,
        );
        assert!(matches!(reporter.recv(), ServerMessage::Error { .. }));
    }

    #[test]
    fn ping_is_a_no_op() {
        let r = router();
        let mut x = TestPeer::new("10.0.0.1");
        assert_eq!(frame(&r, &mut x, r#"{"type":"ping"}"#), FrameDisposition::Continue);
        assert!(x.try_recv().is_none());
    }
}
