use crate::config::ServerConfig;
use crate::crypto::{self, MessageSealer, TokenClaims, TokenError};
use crate::ratelimit::{ActionKind, ActionLimit, SlidingWindow};
use dashmap::DashMap;
use lru::LruCache;
use std::collections::{HashSet, VecDeque};
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Per-IP connection-rate window length.
const IP_WINDOW: Duration = Duration::from_secs(60);
/// IP windows with no activity for this long are swept.
const IP_WINDOW_IDLE_TTL: Duration = Duration::from_secs(3600);
/// Abuse records are reset no sooner than this after creation.
const ABUSE_RECORD_TTL: Duration = Duration::from_secs(24 * 3600);
/// Retention cap for fingerprint reputation records.
const FINGERPRINT_CAPACITY: usize = 100_000;

/// Reports against a fingerprint that mark it suspicious.
const SUSPICIOUS_REPORT_COUNT: u32 = 5;
/// Bans against a fingerprint that mark it suspicious.
const SUSPICIOUS_BAN_COUNT: u32 = 3;

/// Session must be at least this old before the spam rate applies.
const SPAM_MIN_SESSION: Duration = Duration::from_secs(10);
/// Messages per second above which a user is a spammer.
const SPAM_RATE: f64 = 2.0;
/// Skips above which a user is a skip abuser.
const SKIP_ABUSE_THRESHOLD: u32 = 15;
/// Reports at which a user is a harasser.
const HARASS_THRESHOLD: u32 = 3;

/// Accepted reports that trigger the cascade ban of the reported user.
pub const REPORT_BAN_THRESHOLD: u32 = 5;

/// An active IP ban.
#[derive(Debug, Clone)]
pub struct BanEntry {
    /// When the ban lapses.
    pub until: Instant,
    /// Why it was imposed.
    pub reason: String,
}

/// Reputation aggregated across user-id churn for one fingerprint.
#[derive(Debug)]
struct FingerprintRecord {
    user_ids: HashSet<String>,
    reports: u32,
    bans: u32,
    #[allow(dead_code)]
    first_seen: Instant,
}

/// Rolling per-user abuse counters.
#[derive(Debug)]
struct AbuseRecord {
    message_count: u64,
    skip_count: u32,
    report_count: u32,
    session_start: Instant,
}

impl AbuseRecord {
    fn new() -> Self {
        Self {
            message_count: 0,
            skip_count: 0,
            report_count: 0,
            session_start: Instant::now(),
        }
    }
}

#[derive(Debug, Default)]
struct UserRate {
    message: SlidingWindow,
    skip: SlidingWindow,
    report: SlidingWindow,
}

#[derive(Debug)]
struct IpWindow {
    times: VecDeque<Instant>,
    last_seen: Instant,
}

/// Behavioral abuse patterns derived from the rolling counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbusePattern {
    /// Sustained message rate above the spam threshold.
    Spammer,
    /// Excessive partner skipping.
    SkipAbuser,
    /// Repeatedly reported by other users.
    Harasser,
}

impl AbusePattern {
    /// Stable label for logs and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            AbusePattern::Spammer => "spammer",
            AbusePattern::SkipAbuser => "skip_abuser",
            AbusePattern::Harasser => "harasser",
        }
    }
}

/// Admission and abuse enforcement: ban table, per-IP connection windows,
/// per-user action rate limits, fingerprint reputation, abuse pattern
/// detection, and the optional message sealer and token surfaces.
pub struct SecurityManager {
    max_connections_per_ip: usize,
    default_ban: Duration,
    message_limit: ActionLimit,
    skip_limit: ActionLimit,
    report_limit: ActionLimit,
    abuse_ttl: Duration,
    ip_idle_ttl: Duration,

    bans: DashMap<IpAddr, BanEntry>,
    ip_windows: DashMap<IpAddr, IpWindow>,
    rate: DashMap<String, UserRate>,
    fingerprints: Mutex<LruCache<String, FingerprintRecord>>,
    abuse: DashMap<String, AbuseRecord>,

    sealer: Option<MessageSealer>,
    token_secret: Option<Vec<u8>>,
}

impl SecurityManager {
    /// Builds the manager from the server configuration.
    #[must_use]
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            max_connections_per_ip: config.max_connections_per_ip,
            default_ban: config.ban_duration,
            message_limit: ActionLimit {
                limit: config.messages_per_minute,
                window: Duration::from_secs(60),
            },
            skip_limit: ActionLimit {
                limit: config.skips_per_minute,
                window: Duration::from_secs(60),
            },
            report_limit: ActionLimit {
                limit: config.reports_per_hour,
                window: Duration::from_secs(3600),
            },
            abuse_ttl: ABUSE_RECORD_TTL,
            ip_idle_ttl: IP_WINDOW_IDLE_TTL,
            bans: DashMap::new(),
            ip_windows: DashMap::new(),
            rate: DashMap::new(),
            fingerprints: Mutex::new(LruCache::new(
                NonZeroUsize::new(FINGERPRINT_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            )),
            abuse: DashMap::new(),
            sealer: config.message_encryption.then(MessageSealer::generate),
            token_secret: config
                .token_secret
                .as_ref()
                .map(|s| s.as_bytes().to_vec()),
        }
    }

    // ── IP admission ─────────────────────────────────────────────────────

    /// True when the IP is currently banned; stale entries expire on read.
    pub fn is_ip_banned(&self, ip: IpAddr) -> bool {
        let Some(entry) = self.bans.get(&ip) else {
            return false;
        };
        if entry.until <= Instant::now() {
            drop(entry);
            self.bans.remove_if(&ip, |_k, v| v.until <= Instant::now());
            return false;
        }
        true
    }

    /// Bans an IP for `duration`.
    pub fn ban_ip(&self, ip: IpAddr, duration: Duration, reason: &str) {
        info!(%ip, ?duration, reason, "banning ip");
        self.bans.insert(
            ip,
            BanEntry {
                until: Instant::now() + duration,
                reason: reason.to_string(),
            },
        );
    }

    /// Bans an IP for the configured default duration.
    pub fn ban_ip_default(&self, ip: IpAddr, reason: &str) {
        self.ban_ip(ip, self.default_ban, reason);
    }

    /// Lifts a ban. Returns `true` when one existed.
    pub fn unban_ip(&self, ip: IpAddr) -> bool {
        self.bans.remove(&ip).is_some()
    }

    /// Records a connection attempt from `ip` and decides admission.
    ///
    /// Timestamps older than the 60 s window are dropped; the attempt is
    /// rejected when the window already holds `max_connections_per_ip`
    /// entries.
    pub fn track_ip_connection(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut window = self.ip_windows.entry(ip).or_insert_with(|| IpWindow {
            times: VecDeque::new(),
            last_seen: now,
        });
        window.last_seen = now;
        while let Some(front) = window.times.front() {
            if now.duration_since(*front) >= IP_WINDOW {
                window.times.pop_front();
            } else {
                break;
            }
        }
        if window.times.len() >= self.max_connections_per_ip {
            debug!(%ip, "connection rate limit exceeded");
            return false;
        }
        window.times.push_back(now);
        true
    }

    // ── Rate limiting ────────────────────────────────────────────────────

    /// Checks and records one action against the user's sliding window.
    /// Returns `true` when allowed. Never fails.
    pub fn check_rate_limit(&self, user_id: &str, action: ActionKind) -> bool {
        let mut rate = self.rate.entry(user_id.to_string()).or_default();
        match action {
            ActionKind::Message => rate.message.check_and_record(self.message_limit),
            ActionKind::Skip => rate.skip.check_and_record(self.skip_limit),
            ActionKind::Report => rate.report.check_and_record(self.report_limit),
        }
    }

    // ── Fingerprint reputation ───────────────────────────────────────────

    /// Registers `user_id` under `fingerprint` and reports whether the
    /// fingerprint has accumulated enough violations to be suspicious.
    pub fn track_fingerprint(&self, fingerprint: &str, user_id: &str) -> Option<&'static str> {
        let mut fingerprints = self.lock_fingerprints();
        let record = fingerprints.get_or_insert_mut(fingerprint.to_string(), || {
            FingerprintRecord {
                user_ids: HashSet::new(),
                reports: 0,
                bans: 0,
                first_seen: Instant::now(),
            }
        });
        record.user_ids.insert(user_id.to_string());
        (record.reports >= SUSPICIOUS_REPORT_COUNT || record.bans >= SUSPICIOUS_BAN_COUNT)
            .then_some("Multiple violations")
    }

    /// Bumps the report counter of every fingerprint that has seen `user_id`.
    pub fn note_report_against(&self, user_id: &str) {
        let mut fingerprints = self.lock_fingerprints();
        for (_, record) in fingerprints.iter_mut() {
            if record.user_ids.contains(user_id) {
                record.reports += 1;
            }
        }
    }

    /// Bumps the ban counter of every fingerprint that has seen `user_id`.
    pub fn note_ban_against(&self, user_id: &str) {
        let mut fingerprints = self.lock_fingerprints();
        for (_, record) in fingerprints.iter_mut() {
            if record.user_ids.contains(user_id) {
                record.bans += 1;
            }
        }
    }

    // ── Abuse records ────────────────────────────────────────────────────

    /// Counts one message sent by `user_id`.
    pub fn track_message(&self, user_id: &str) {
        self.abuse
            .entry(user_id.to_string())
            .or_insert_with(AbuseRecord::new)
            .message_count += 1;
    }

    /// Counts one skip by `user_id`.
    pub fn track_skip(&self, user_id: &str) {
        self.abuse
            .entry(user_id.to_string())
            .or_insert_with(AbuseRecord::new)
            .skip_count += 1;
    }

    /// Counts one report made against `user_id`; returns the running total.
    pub fn track_report_against(&self, user_id: &str) -> u32 {
        let mut record = self
            .abuse
            .entry(user_id.to_string())
            .or_insert_with(AbuseRecord::new);
        record.report_count += 1;
        record.report_count
    }

    /// The abuse patterns `user_id` currently exhibits.
    pub fn detect_abuse_patterns(&self, user_id: &str) -> Vec<AbusePattern> {
        let Some(record) = self.abuse.get(user_id) else {
            return Vec::new();
        };
        let mut patterns = Vec::new();

        let session = record.session_start.elapsed();
        if session > SPAM_MIN_SESSION {
            let rate = record.message_count as f64 / session.as_secs_f64();
            if rate > SPAM_RATE {
                patterns.push(AbusePattern::Spammer);
            }
        }
        if record.skip_count > SKIP_ABUSE_THRESHOLD {
            patterns.push(AbusePattern::SkipAbuser);
        }
        if record.report_count >= HARASS_THRESHOLD {
            patterns.push(AbusePattern::Harasser);
        }
        patterns
    }

    // ── Optional surfaces ────────────────────────────────────────────────

    /// The AEAD sealer, when message encryption is enabled.
    pub fn sealer(&self) -> Option<&MessageSealer> {
        self.sealer.as_ref()
    }

    /// Mints a short-lived bearer token; `None` when minting is disabled.
    pub fn mint_token(
        &self,
        user_id: &str,
        fingerprint: &str,
    ) -> Option<Result<String, TokenError>> {
        let secret = self.token_secret.as_deref()?;
        Some(crypto::mint_token(
            secret,
            user_id,
            fingerprint,
            crypto::TOKEN_TTL_SECS,
        ))
    }

    /// Mints the long-lived refresh variant; `None` when minting is disabled.
    pub fn mint_refresh_token(
        &self,
        user_id: &str,
        fingerprint: &str,
    ) -> Option<Result<String, TokenError>> {
        let secret = self.token_secret.as_deref()?;
        Some(crypto::mint_refresh_token(secret, user_id, fingerprint))
    }

    /// Verifies a bearer token; `None` when minting is disabled.
    pub fn verify_token(&self, token: &str) -> Option<Result<TokenClaims, TokenError>> {
        let secret = self.token_secret.as_deref()?;
        Some(crypto::verify_token(secret, token))
    }

    // ── Cleanup ──────────────────────────────────────────────────────────

    /// Drops expired bans, idle IP windows, drained rate windows, and abuse
    /// records past their 24 h retention.
    pub fn cleanup(&self) {
        let now = Instant::now();
        self.bans.retain(|_, entry| entry.until > now);
        self.ip_windows
            .retain(|_, w| now.duration_since(w.last_seen) < self.ip_idle_ttl);
        self.abuse
            .retain(|_, r| r.session_start.elapsed() < self.abuse_ttl);
        self.rate.retain(|_, r| {
            r.message.expire(self.message_limit.window);
            r.skip.expire(self.skip_limit.window);
            r.report.expire(self.report_limit.window);
            !(r.message.is_empty() && r.skip.is_empty() && r.report.is_empty())
        });
    }

    /// Number of active (possibly stale-until-read) bans.
    pub fn ban_count(&self) -> usize {
        self.bans.len()
    }

    fn lock_fingerprints(&self) -> std::sync::MutexGuard<'_, LruCache<String, FingerprintRecord>> {
        self.fingerprints
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
