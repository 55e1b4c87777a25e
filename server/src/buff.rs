//! Timed buffs and debuffs attached to a companion.

use crate::combat::CombatStats;
use std::time::{Duration, Instant};

/// What a buff does while it is active.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Effect {
    AttackPercent(u32),
    DefensePercent(u32),
    /// Flat percentage points added to critical chance.
    CriticalChance(f64),
    /// Flat percentage points added to block chance.
    BlockChance(f64),
    /// Shortens the attack cooldown by this percentage.
    AttackSpeedPercent(u32),
    /// Lowers attack by this percentage.
    Weaken(u32),
    Stun,
}

impl Effect {
    /// Folds this effect into a stat snapshot.
    pub fn apply(&self, stats: &mut CombatStats) {
        match *self {
            Effect::AttackPercent(pct) => {
                stats.attack = stats.attack.saturating_add(percent_of(stats.attack, pct));
            }
            Effect::DefensePercent(pct) => {
                stats.defense = stats.defense.saturating_add(percent_of(stats.defense, pct));
            }
            Effect::CriticalChance(points) => {
                stats.critical_chance = (stats.critical_chance + points).clamp(0.0, 100.0);
            }
            Effect::BlockChance(points) => {
                stats.block = (stats.block + points).clamp(0.0, 100.0);
            }
            Effect::AttackSpeedPercent(pct) => {
                let cut = stats.attack_speed_ms * u64::from(pct.min(90)) / 100;
                stats.attack_speed_ms -= cut;
            }
            Effect::Weaken(pct) => {
                stats.attack -= percent_of(stats.attack, pct.min(100));
            }
            Effect::Stun => {}
        }
    }

    pub fn prevents_attack(&self) -> bool {
        matches!(self, Effect::Stun)
    }
}

fn percent_of(value: u32, pct: u32) -> u32 {
    (u64::from(value) * u64::from(pct) / 100).min(u64::from(u32::MAX)) as u32
}

#[derive(Debug, Clone, PartialEq)]
pub struct Buff {
    pub skill_id: u32,
    pub duration_secs: u64,
    pub expires_at: Instant,
    pub effect: Effect,
}

impl Buff {
    pub fn new(skill_id: u32, duration: Duration, effect: Effect, now: Instant) -> Self {
        Self {
            skill_id,
            duration_secs: duration.as_secs(),
            expires_at: now + duration,
            effect,
        }
    }

    pub fn is_active(&self, now: Instant) -> bool {
        self.expires_at > now
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuffList {
    entries: Vec<Buff>,
}

impl BuffList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a buff, replacing any earlier one from the same skill.
    pub fn add(&mut self, buff: Buff) {
        self.entries.retain(|b| b.skill_id != buff.skill_id);
        self.entries.push(buff);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Buff> {
        self.entries.iter()
    }

    pub fn has_active(&self, now: Instant) -> bool {
        self.entries.iter().any(|b| b.is_active(now))
    }

    /// Drops every expired entry and returns the skill ids that went away.
    /// A second sweep at the same instant removes nothing.
    pub fn sweep(&mut self, now: Instant) -> Vec<u32> {
        let mut removed = Vec::new();
        self.entries.retain(|b| {
            if b.is_active(now) {
                true
            } else {
                removed.push(b.skill_id);
                false
            }
        });
        removed
    }

    /// Applies every active effect to `stats`.
    pub fn apply_to(&self, stats: &mut CombatStats, now: Instant) {
        for buff in self.entries.iter().filter(|b| b.is_active(now)) {
            buff.effect.apply(stats);
        }
    }

    pub fn active_skill_ids(&self, now: Instant) -> Vec<u32> {
        self.entries
            .iter()
            .filter(|b| b.is_active(now))
            .map(|b| b.skill_id)
            .collect()
    }

    pub fn is_stunned(&self, now: Instant) -> bool {
        self.entries
            .iter()
            .any(|b| b.is_active(now) && b.effect.prevents_attack())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_sweep_is_idempotent() {
        let start = Instant::now();
        let mut list = BuffList::new();
        list.add(Buff::new(1, Duration::from_secs(1), Effect::Stun, start));
        list.add(Buff::new(2, Duration::from_secs(60), Effect::Weaken(10), start));
        list.add(Buff::new(3, Duration::from_secs(2), Effect::AttackPercent(5), start));

        let later = start + Duration::from_secs(5);
        let mut removed = list.sweep(later);
        removed.sort_unstable();
        assert_eq!(removed, vec![1, 3]);
        assert_eq!(list.len(), 1);

        assert!(list.sweep(later).is_empty());
        assert_eq!(list.len(), 1);
        assert!(list.has_active(later));
    }

    #[test]
    fn test_add_replaces_same_skill() {
        let now = Instant::now();
        let mut list = BuffList::new();
        list.add(Buff::new(7, Duration::from_secs(5), Effect::AttackPercent(10), now));
        list.add(Buff::new(7, Duration::from_secs(50), Effect::AttackPercent(20), now));
        assert_eq!(list.len(), 1);
        assert_eq!(list.iter().next().map(|b| b.duration_secs), Some(50));
    }

    #[test]
    fn test_effects_fold_into_stats() {
        let now = Instant::now();
        let mut list = BuffList::new();
        list.add(Buff::new(1, Duration::from_secs(10), Effect::AttackPercent(50), now));
        list.add(Buff::new(2, Duration::from_secs(10), Effect::DefensePercent(10), now));
        list.add(Buff::new(3, Duration::from_secs(10), Effect::CriticalChance(99.0), now));
        list.add(Buff::new(4, Duration::from_secs(10), Effect::AttackSpeedPercent(25), now));

        let mut stats = CombatStats {
            attack: 200,
            defense: 100,
            critical_chance: 5.0,
            attack_speed_ms: 2000,
            ..CombatStats::default()
        };
        list.apply_to(&mut stats, now);

        assert_eq!(stats.attack, 300);
        assert_eq!(stats.defense, 110);
        assert_approx_eq!(stats.critical_chance, 100.0);
        assert_eq!(stats.attack_speed_ms, 1500);
    }

    #[test]
    fn test_expired_effects_do_not_apply() {
        let start = Instant::now();
        let mut list = BuffList::new();
        list.add(Buff::new(1, Duration::from_secs(1), Effect::Weaken(50), start));

        let mut stats = CombatStats {
            attack: 200,
            ..CombatStats::default()
        };
        list.apply_to(&mut stats, start + Duration::from_secs(2));
        assert_eq!(stats.attack, 200);

        list.apply_to(&mut stats, start);
        assert_eq!(stats.attack, 100);
    }

    #[test]
    fn test_stun() {
        let now = Instant::now();
        let mut list = BuffList::new();
        assert!(!list.is_stunned(now));
        list.add(Buff::new(9, Duration::from_secs(3), Effect::Stun, now));
        assert!(list.is_stunned(now));
        assert!(!list.is_stunned(now + Duration::from_secs(3)));
        assert_eq!(list.active_skill_ids(now), vec![9]);
    }
}
