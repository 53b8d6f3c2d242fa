use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::warn;
use tryst_common::Mode;

/// Queue tier. Priority entries are matched before normal ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    Normal,
    Priority,
}

/// Membership record; the authoritative statement that a user is queued.
#[derive(Debug)]
struct IndexEntry {
    mode: Mode,
    tier: Tier,
    enqueued_at: Instant,
}

/// A queued (user, enqueue-instant) slot. Slots whose instant no longer
/// matches the index are tombstones left behind by removal or re-enqueue and
/// are skipped on pop.
#[derive(Debug)]
struct Slot {
    user_id: String,
    enqueued_at: Instant,
}

#[derive(Debug, Default)]
struct ModeQueues {
    normal: VecDeque<Slot>,
    priority: VecDeque<Slot>,
    normal_len: usize,
    priority_len: usize,
}

#[derive(Debug, Default)]
struct QueueInner {
    index: HashMap<String, IndexEntry>,
    modes: HashMap<Mode, ModeQueues>,
    timed_out: u64,
}

/// Result of an enqueue attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    /// The user was queued.
    Admitted,
    /// The target tier is full.
    QueueFull,
}

/// A successful match: two distinct users popped FIFO from one mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match {
    /// First-popped (longer waiting) user; the offerer for media modes.
    pub user1: String,
    /// Second-popped user.
    pub user2: String,
    /// Mode both users queued for.
    pub mode: Mode,
    /// How long `user1` waited.
    pub wait: Duration,
}

/// A user's current queue membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStatus {
    /// Mode the user is queued for.
    pub mode: Mode,
    /// True when the user sits in the priority tier.
    pub priority: bool,
    /// Time since enqueue.
    pub waited: Duration,
}

/// Per-mode FIFO matching queues with an optional priority tier.
///
/// All operations serialize on one internal mutex; `match_users` and the
/// mutating operations therefore form a single matching critical section.
#[derive(Debug)]
pub struct QueueManager {
    inner: Mutex<QueueInner>,
    max_queue_size: usize,
    queue_timeout: Duration,
}

impl QueueManager {
    /// Creates empty queues with the given per-tier capacity and entry
    /// timeout.
    #[must_use]
    pub fn new(max_queue_size: usize, queue_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            max_queue_size,
            queue_timeout,
        }
    }

    /// Adds a user to a mode queue, replacing any existing membership.
    ///
    /// `priority > 0` selects the priority tier. Returns
    /// [`Enqueue::QueueFull`] when the target tier is at capacity.
    pub fn add_to_queue(&self, user_id: &str, mode: Mode, priority: u32) -> Enqueue {
        let mut inner = self.lock();
        remove_user(&mut inner, user_id);

        let tier = if priority > 0 { Tier::Priority } else { Tier::Normal };
        let queues = inner.modes.entry(mode).or_default();
        let len = match tier {
            Tier::Normal => queues.normal_len,
            Tier::Priority => queues.priority_len,
        };
        if len >= self.max_queue_size {
            return Enqueue::QueueFull;
        }

        let enqueued_at = Instant::now();
        let slot = Slot {
            user_id: user_id.to_string(),
            enqueued_at,
        };
        match tier {
            Tier::Normal => {
                queues.normal.push_back(slot);
                queues.normal_len += 1;
            }
            Tier::Priority => {
                queues.priority.push_back(slot);
                queues.priority_len += 1;
            }
        }
        inner.index.insert(
            user_id.to_string(),
            IndexEntry {
                mode,
                tier,
                enqueued_at,
            },
        );
        Enqueue::Admitted
    }

    /// Pops the next two users queued for `mode`, priority tier first.
    ///
    /// Selection order: two from priority; one from each tier (priority
    /// first); two from normal. Returns `None` when fewer than two users are
    /// queued. A head-of-queue tie on the same user id is a duplicate-enqueue
    /// bug: the entry is reinserted at the head and no match is produced.
    pub fn match_users(&self, mode: Mode) -> Option<Match> {
        let mut inner = self.lock();
        let queues = inner.modes.entry(mode).or_default();
        if queues.normal_len + queues.priority_len < 2 {
            return None;
        }

        let first = pop_head(&mut inner, mode)?;
        let second = match pop_head(&mut inner, mode) {
            Some(slot) => slot,
            None => {
                reinsert_head(&mut inner, mode, first);
                return None;
            }
        };

        if first.user_id == second.user_id {
            warn!(user_id = %first.user_id, mode = %mode, "self-match averted; duplicate queue entry");
            reinsert_head(&mut inner, mode, first);
            return None;
        }

        Some(Match {
            wait: first.enqueued_at.elapsed(),
            user1: first.user_id,
            user2: second.user_id,
            mode,
        })
    }

    /// Removes a user from whatever queue they are in.
    pub fn remove_from_queue(&self, user_id: &str) -> bool {
        remove_user(&mut self.lock(), user_id)
    }

    /// Current membership of a user, if any.
    pub fn is_in_queue(&self, user_id: &str) -> Option<QueueStatus> {
        let inner = self.lock();
        inner.index.get(user_id).map(|entry| QueueStatus {
            mode: entry.mode,
            priority: entry.tier == Tier::Priority,
            waited: entry.enqueued_at.elapsed(),
        })
    }

    /// Drops entries older than the queue timeout and compacts tombstones.
    /// Returns the user ids that timed out.
    pub fn sweep(&self) -> Vec<String> {
        let mut inner = self.lock();
        let expired: Vec<String> = inner
            .index
            .iter()
            .filter(|(_, e)| e.enqueued_at.elapsed() >= self.queue_timeout)
            .map(|(user, _)| user.clone())
            .collect();
        for user in &expired {
            remove_user(&mut inner, user);
        }
        inner.timed_out += expired.len() as u64;

        // Compact: drop slots that no longer back an index entry.
        let inner = &mut *inner;
        for queues in inner.modes.values_mut() {
            let index = &inner.index;
            queues.normal.retain(|s| is_live(index, s));
            queues.priority.retain(|s| is_live(index, s));
        }
        expired
    }

    /// Number of users queued for `mode`, both tiers.
    pub fn queue_len(&self, mode: Mode) -> usize {
        let inner = self.lock();
        inner
            .modes
            .get(&mode)
            .map_or(0, |q| q.normal_len + q.priority_len)
    }

    /// Total users queued across all modes.
    pub fn total_len(&self) -> usize {
        let inner = self.lock();
        inner
            .modes
            .values()
            .map(|q| q.normal_len + q.priority_len)
            .sum()
    }

    /// Count of entries dropped by the timeout sweeper since start.
    pub fn timed_out_total(&self) -> u64 {
        self.lock().timed_out
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        // A poisoned queue mutex means a panic mid-match; the state is a
        // plain collection set, safe to keep using.
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn is_live(index: &HashMap<String, IndexEntry>, slot: &Slot) -> bool {
    index
        .get(&slot.user_id)
        .is_some_and(|e| e.enqueued_at == slot.enqueued_at)
}

fn remove_user(inner: &mut QueueInner, user_id: &str) -> bool {
    let Some(entry) = inner.index.remove(user_id) else {
        return false;
    };
    if let Some(queues) = inner.modes.get_mut(&entry.mode) {
        match entry.tier {
            Tier::Normal => queues.normal_len = queues.normal_len.saturating_sub(1),
            Tier::Priority => queues.priority_len = queues.priority_len.saturating_sub(1),
        }
    }
    true
}

/// A popped queue head, carrying its origin tier so a guard can put it back.
#[derive(Debug)]
struct Popped {
    user_id: String,
    enqueued_at: Instant,
    tier: Tier,
}

/// Pops the FIFO head of `mode`, preferring the priority tier and skipping
/// tombstoned slots. Removes the popped user from the index.
fn pop_head(inner: &mut QueueInner, mode: Mode) -> Option<Popped> {
    loop {
        let queues = inner.modes.get_mut(&mode)?;
        let (slot, tier) = if let Some(slot) = queues.priority.pop_front() {
            (slot, Tier::Priority)
        } else if let Some(slot) = queues.normal.pop_front() {
            (slot, Tier::Normal)
        } else {
            return None;
        };

        let live = is_live(&inner.index, &slot)
            && inner
                .index
                .get(&slot.user_id)
                .is_some_and(|e| e.mode == mode && e.tier == tier);
        if !live {
            continue; // tombstone
        }
        inner.index.remove(&slot.user_id);
        let queues = inner.modes.get_mut(&mode)?;
        match tier {
            Tier::Normal => queues.normal_len = queues.normal_len.saturating_sub(1),
            Tier::Priority => queues.priority_len = queues.priority_len.saturating_sub(1),
        }
        return Some(Popped {
            user_id: slot.user_id,
            enqueued_at: slot.enqueued_at,
            tier,
        });
    }
}

/// Puts a popped entry back at the head of its original tier.
fn reinsert_head(inner: &mut QueueInner, mode: Mode, popped: Popped) {
    let queues = inner.modes.entry(mode).or_default();
    let slot = Slot {
        user_id: popped.user_id.clone(),
        enqueued_at: popped.enqueued_at,
    };
    match popped.tier {
        Tier::Normal => {
            queues.normal.push_front(slot);
            queues.normal_len += 1;
        }
        Tier::Priority => {
            queues.priority.push_front(slot);
            queues.priority_len += 1;
        }
    }
    inner.index.insert(
        popped.user_id,
        IndexEntry {
            mode,
            tier: popped.tier,
            enqueued_at: popped.enqueued_at,
        },
    );
}
