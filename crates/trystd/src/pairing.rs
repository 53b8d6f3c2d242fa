use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tryst_common::types::pair_id;
use tryst_common::Mode;

/// One completed mode switch inside a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeSwitch {
    /// Mode before the switch.
    pub from: Mode,
    /// Mode after the switch.
    pub to: Mode,
    /// When the second side confirmed.
    pub at: Instant,
}

/// Per-pair session record; lives exactly as long as the pair.
#[derive(Debug, Clone)]
pub struct Session {
    /// Stable id: the sorted pair of user ids.
    pub pair_id: String,
    /// First user of the pair (offerer at creation for media modes).
    pub user1: String,
    /// Second user of the pair.
    pub user2: String,
    /// Current session mode.
    pub mode: Mode,
    /// When the pair was created.
    pub started_at: Instant,
    /// Relayed chat messages in this session.
    pub message_count: u64,
    /// Completed mode switches, oldest first.
    pub switch_history: Vec<ModeSwitch>,
}

/// Result of breaking a pair.
#[derive(Debug)]
pub struct BrokenPair {
    /// The departed user's former partner.
    pub partner_id: String,
    /// The session that just ended.
    pub session: Session,
}

/// Outcome of one side opting into a mode switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchOutcome {
    /// First arrival: the caller is the offerer and waits for the partner.
    WaitingForPartner,
    /// Second arrival: both sides opted in; the caller is the answerer.
    Ready {
        /// The confirmed partner.
        partner_id: String,
    },
}

/// Ways a pairing operation can fail.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PairingError {
    /// A user cannot pair with themselves.
    #[error("cannot pair a user with themselves")]
    SelfPair,
    /// One of the users is already in a pair.
    #[error("user {0} is already paired")]
    AlreadyPaired(String),
    /// The caller is not paired.
    #[error("user is not paired")]
    NotPaired,
    /// The caller is paired, but not with the named partner.
    #[error("partner mismatch")]
    PartnerMismatch,
}

#[derive(Debug)]
struct PendingSwitch {
    initiator: String,
    target_mode: Mode,
    at: Instant,
}

#[derive(Debug, Default)]
struct PairInner {
    partners: HashMap<String, String>,
    modes: HashMap<String, Mode>,
    sessions: HashMap<String, Session>,
    /// Keyed by the partner who has not confirmed yet.
    pending: HashMap<String, PendingSwitch>,
}

/// Authoritative pair relation and session lifecycle.
///
/// Every operation is individually atomic under one internal mutex.
#[derive(Debug)]
pub struct PairingManager {
    inner: Mutex<PairInner>,
    switch_timeout: Duration,
}

impl PairingManager {
    /// Creates an empty pairing table with the given mode-switch handshake
    /// expiry.
    #[must_use]
    pub fn new(switch_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(PairInner::default()),
            switch_timeout,
        }
    }

    /// Pairs two distinct, currently unpaired users in `mode`.
    pub fn create_pair(&self, user1: &str, user2: &str, mode: Mode) -> Result<(), PairingError> {
        if user1 == user2 {
            return Err(PairingError::SelfPair);
        }
        let mut inner = self.lock();
        for user in [user1, user2] {
            if inner.partners.contains_key(user) {
                return Err(PairingError::AlreadyPaired(user.to_string()));
            }
        }

        inner.partners.insert(user1.to_string(), user2.to_string());
        inner.partners.insert(user2.to_string(), user1.to_string());
        inner.modes.insert(user1.to_string(), mode);
        inner.modes.insert(user2.to_string(), mode);

        let id = pair_id(user1, user2);
        inner.sessions.insert(
            id.clone(),
            Session {
                pair_id: id,
                user1: user1.to_string(),
                user2: user2.to_string(),
                mode,
                started_at: Instant::now(),
                message_count: 0,
                switch_history: Vec::new(),
            },
        );
        Ok(())
    }

    /// The user's current partner, if any.
    pub fn get_pair(&self, user_id: &str) -> Option<String> {
        self.lock().partners.get(user_id).cloned()
    }

    /// True when the user is in a pair.
    pub fn is_paired(&self, user_id: &str) -> bool {
        self.lock().partners.contains_key(user_id)
    }

    /// True when `user_id` and `other` are paired with each other.
    pub fn are_paired(&self, user_id: &str, other: &str) -> bool {
        self.lock().partners.get(user_id).is_some_and(|p| p == other)
    }

    /// The user's current mode; defined iff the user is paired.
    pub fn get_user_mode(&self, user_id: &str) -> Option<Mode> {
        self.lock().modes.get(user_id).copied()
    }

    /// Snapshot of the session the user is part of.
    pub fn get_session_data(&self, user_id: &str) -> Option<Session> {
        let inner = self.lock();
        let partner = inner.partners.get(user_id)?;
        inner.sessions.get(&pair_id(user_id, partner)).cloned()
    }

    /// Number of active pairs.
    pub fn pair_count(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Bumps the session message counter for the user's current pair.
    pub fn increment_message_count(&self, user_id: &str) {
        let mut inner = self.lock();
        let Some(partner) = inner.partners.get(user_id).cloned() else {
            return;
        };
        let id = pair_id(user_id, &partner);
        if let Some(session) = inner.sessions.get_mut(&id) {
            session.message_count += 1;
        }
    }

    /// Atomically dissolves the user's pair.
    ///
    /// Removes both sides of the relation and both modes, drops the session,
    /// and clears any pending mode switch keyed by either side. Returns the
    /// ended session for metrics and cleanup.
    pub fn break_pair(&self, user_id: &str) -> Option<BrokenPair> {
        let mut inner = self.lock();
        let partner = inner.partners.remove(user_id)?;
        inner.partners.remove(&partner);
        inner.modes.remove(user_id);
        inner.modes.remove(&partner);
        inner.pending.remove(user_id);
        inner.pending.remove(&partner);

        let session = inner.sessions.remove(&pair_id(user_id, &partner));
        session.map(|session| BrokenPair {
            partner_id: partner,
            session,
        })
    }

    /// One side of the two-step mode-switch handshake.
    ///
    /// The first arrival records a pending entry against the partner, adopts
    /// the new mode, and becomes the offerer. The second arrival consumes the
    /// pending entry, updates the session, and becomes the answerer. A
    /// pending entry that expired (or whose pair broke meanwhile) starts a
    /// fresh handshake instead.
    pub fn switch_mode(
        &self,
        user_id: &str,
        partner_id: &str,
        new_mode: Mode,
    ) -> Result<SwitchOutcome, PairingError> {
        let mut inner = self.lock();
        match inner.partners.get(user_id) {
            None => return Err(PairingError::NotPaired),
            Some(actual) if actual != partner_id => return Err(PairingError::PartnerMismatch),
            Some(_) => {}
        }

        enum Pending {
            Completes,
            /// Expired, or left over from a different handshake.
            Discard,
        }
        let pending = inner.pending.get(user_id).map(|p| {
            if p.at.elapsed() < self.switch_timeout
                && p.initiator == partner_id
                && p.target_mode == new_mode
            {
                Pending::Completes
            } else {
                Pending::Discard
            }
        });
        let completes = match pending {
            Some(Pending::Completes) => true,
            Some(Pending::Discard) => {
                inner.pending.remove(user_id);
                false
            }
            None => false,
        };

        if completes {
            inner.pending.remove(user_id);
            inner.modes.insert(user_id.to_string(), new_mode);

            let id = pair_id(user_id, partner_id);
            if let Some(session) = inner.sessions.get_mut(&id) {
                session.switch_history.push(ModeSwitch {
                    from: session.mode,
                    to: new_mode,
                    at: Instant::now(),
                });
                session.mode = new_mode;
            }
            return Ok(SwitchOutcome::Ready {
                partner_id: partner_id.to_string(),
            });
        }

        inner.pending.insert(
            partner_id.to_string(),
            PendingSwitch {
                initiator: user_id.to_string(),
                target_mode: new_mode,
                at: Instant::now(),
            },
        );
        inner.modes.insert(user_id.to_string(), new_mode);
        Ok(SwitchOutcome::WaitingForPartner)
    }

    /// Drops pending mode switches older than the handshake expiry.
    pub fn sweep_pending(&self) -> usize {
        let mut inner = self.lock();
        let before = inner.pending.len();
        let timeout = self.switch_timeout;
        inner.pending.retain(|_, p| p.at.elapsed() < timeout);
        before - inner.pending.len()
    }

    /// True when a pending switch is waiting on `user_id`.
    pub fn has_pending_switch(&self, user_id: &str) -> bool {
        self.lock().pending.contains_key(user_id)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PairInner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
