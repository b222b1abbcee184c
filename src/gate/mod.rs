//! Duplicate and cooldown gate.
//!
//! Decides, per commit event, whether evidence is persisted and whether an alert
//! fires. Three independent values do the work:
//! - [`DuplicatePredicate`]: crop hash too close to a recent persisted hash of the bucket
//! - [`CooldownPredicate`]: same bucket persisted recently with a looser hash match
//! - [`AlertCooldown`]: global rate limit on unknown-person alerts
//!
//! Persistence requires both predicates to pass; alerting ignores them.
//! A hash is only remembered once the caller confirms the evidence was written.

mod phash;

use std::collections::HashMap;

use chrono::{DateTime, Duration, Local};
use serde::Serialize;

use crate::verification::{Classification, CommitEvent};

pub use phash::PHash;

/// Hash and time of the most recent persisted evidence in a bucket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PersistedHash {
    pub hash: PHash,
    pub at: DateTime<Local>,
}

/// Rejects crops whose hash is within `threshold` bits of evidence persisted
/// less than `window` ago. Older evidence no longer suppresses a match.
#[derive(Clone, Copy, Debug)]
pub struct DuplicatePredicate {
    pub threshold: u32,
    pub window: Duration,
}

impl DuplicatePredicate {
    /// Hamming distance when `hash` counts as a duplicate of `last`.
    pub fn check(
        &self,
        hash: PHash,
        at: DateTime<Local>,
        last: Option<&PersistedHash>,
    ) -> Option<u32> {
        let last = last?;
        if at.signed_duration_since(last.at) >= self.window {
            return None;
        }
        let distance = hash.distance(&last.hash);
        (distance <= self.threshold).then_some(distance)
    }
}

/// Rejects crops close to evidence persisted less than `window` ago.
#[derive(Clone, Copy, Debug)]
pub struct CooldownPredicate {
    pub window: Duration,
    pub threshold: u32,
}

impl CooldownPredicate {
    /// Age of `last` when `hash` falls within its cooldown.
    pub fn check(
        &self,
        hash: PHash,
        at: DateTime<Local>,
        last: Option<&PersistedHash>,
    ) -> Option<Duration> {
        let last = last?;
        let age = at.signed_duration_since(last.at);
        (age < self.window && hash.distance(&last.hash) <= self.threshold).then_some(age)
    }
}

/// Global rate limit for unknown-person alerts.
#[derive(Clone, Debug)]
pub struct AlertCooldown {
    cooldown: Duration,
    last_alert: Option<DateTime<Local>>,
}

impl AlertCooldown {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_alert: None,
        }
    }

    pub fn set_cooldown(&mut self, cooldown: Duration) {
        self.cooldown = cooldown;
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Returns true and arms the cooldown when an alert may go out at `at`.
    pub fn try_fire(&mut self, classification: Classification, at: DateTime<Local>) -> bool {
        if classification != Classification::Unknown {
            return false;
        }
        if let Some(last) = self.last_alert {
            if at.signed_duration_since(last) < self.cooldown {
                return false;
            }
        }
        self.last_alert = Some(at);
        true
    }
}

/// Why evidence was not persisted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum Rejection {
    SavingDisabled,
    /// The crop could not be hashed (empty).
    Unhashable,
    Duplicate { distance: u32 },
    Cooldown { age_secs: i64 },
}

impl Rejection {
    /// Counted as a blocked false positive in the daily statistics.
    pub fn is_blocked(&self) -> bool {
        matches!(self, Rejection::Duplicate { .. } | Rejection::Cooldown { .. })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Decision {
    pub persist: bool,
    pub alert: bool,
    /// Crop hash, to be passed back to [`Gate::remember`] after a successful write.
    pub hash: Option<PHash>,
    pub rejection: Option<Rejection>,
}

#[derive(Clone, Debug)]
pub struct GateConfig {
    pub save_images: bool,
    pub hash_similarity_threshold: u32,
    pub cooldown_similarity_threshold: u32,
    pub save_cooldown: Duration,
    pub alert_cooldown: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            save_images: true,
            hash_similarity_threshold: 5,
            cooldown_similarity_threshold: 10,
            save_cooldown: Duration::hours(1),
            alert_cooldown: Duration::seconds(30),
        }
    }
}

pub struct Gate {
    save_images: bool,
    duplicate: DuplicatePredicate,
    cooldown: CooldownPredicate,
    alerts: AlertCooldown,
    last_persisted: HashMap<Classification, PersistedHash>,
}

impl Gate {
    pub fn new(config: GateConfig) -> Self {
        Self {
            save_images: config.save_images,
            duplicate: DuplicatePredicate {
                threshold: config.hash_similarity_threshold,
                window: config.save_cooldown,
            },
            cooldown: CooldownPredicate {
                window: config.save_cooldown,
                threshold: config.cooldown_similarity_threshold,
            },
            alerts: AlertCooldown::new(config.alert_cooldown),
            last_persisted: HashMap::new(),
        }
    }

    pub fn set_save_images(&mut self, save_images: bool) {
        self.save_images = save_images;
    }

    pub fn save_images(&self) -> bool {
        self.save_images
    }

    pub fn set_alert_cooldown(&mut self, cooldown: Duration) {
        self.alerts.set_cooldown(cooldown);
    }

    pub fn alert_cooldown(&self) -> Duration {
        self.alerts.cooldown()
    }

    /// Decide persistence and alerting for one commit event.
    pub fn admit(&mut self, event: &CommitEvent) -> Decision {
        let alert = self.alerts.try_fire(event.classification, event.timestamp);
        let hash = PHash::of(&event.crop);
        let rejection = self.persist_rejection(event, hash);
        Decision {
            persist: rejection.is_none(),
            alert,
            hash,
            rejection,
        }
    }

    fn persist_rejection(&self, event: &CommitEvent, hash: Option<PHash>) -> Option<Rejection> {
        if !self.save_images {
            return Some(Rejection::SavingDisabled);
        }
        let Some(hash) = hash else {
            return Some(Rejection::Unhashable);
        };
        let last = self.last_persisted.get(&event.classification);
        if let Some(distance) = self.duplicate.check(hash, event.timestamp, last) {
            return Some(Rejection::Duplicate { distance });
        }
        if let Some(age) = self.cooldown.check(hash, event.timestamp, last) {
            return Some(Rejection::Cooldown {
                age_secs: age.num_seconds(),
            });
        }
        None
    }

    /// Record evidence that was actually written.
    pub fn remember(&mut self, classification: Classification, hash: PHash, at: DateTime<Local>) {
        self.last_persisted
            .insert(classification, PersistedHash { hash, at });
    }

    pub fn last_persisted(&self, classification: Classification) -> Option<PersistedHash> {
        self.last_persisted.get(&classification).copied()
    }
}
