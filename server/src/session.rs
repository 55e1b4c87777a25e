//! Per-avatar state while its owner is connected.

use crate::buff::{Buff, BuffList};
use crate::combat::CombatStats;
use crate::connection::{Outbound, SendError};
use crate::store::{AvatarRecord, BuffRecord, CompanionRecord};
use shared::packets::{AvatarAppear, BuffUpdate, VitalsSync};
use shared::{MapKey, Payload};
use std::collections::BTreeSet;
use std::time::{Duration, Instant};

/// Health and DS pools. Current values always stay within `0..=max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vitals {
    hp: u32,
    max_hp: u32,
    ds: u32,
    max_ds: u32,
}

impl Vitals {
    pub fn new(hp: u32, max_hp: u32, ds: u32, max_ds: u32) -> Self {
        Self {
            hp: hp.min(max_hp),
            max_hp,
            ds: ds.min(max_ds),
            max_ds,
        }
    }

    pub fn full(max_hp: u32, max_ds: u32) -> Self {
        Self::new(max_hp, max_hp, max_ds, max_ds)
    }

    pub fn hp(&self) -> u32 {
        self.hp
    }

    pub fn max_hp(&self) -> u32 {
        self.max_hp
    }

    pub fn ds(&self) -> u32 {
        self.ds
    }

    pub fn max_ds(&self) -> u32 {
        self.max_ds
    }

    pub fn is_dead(&self) -> bool {
        self.hp == 0
    }

    /// Removes health and returns what is left.
    pub fn damage(&mut self, amount: u32) -> u32 {
        self.hp = self.hp.saturating_sub(amount);
        self.hp
    }

    pub fn heal(&mut self, amount: u32) {
        self.hp = self.hp.saturating_add(amount).min(self.max_hp);
    }

    pub fn restore_ds(&mut self, amount: u32) {
        self.ds = self.ds.saturating_add(amount).min(self.max_ds);
    }

    pub fn spend_ds(&mut self, amount: u32) -> bool {
        if self.ds < amount {
            return false;
        }
        self.ds -= amount;
        true
    }

    pub fn restore_full(&mut self) {
        self.hp = self.max_hp;
        self.ds = self.max_ds;
    }

    /// Restores `percent` of each maximum, at least one point when the pool
    /// is not full. Returns whether anything changed.
    pub fn regen(&mut self, percent: u32) -> bool {
        let before = *self;
        if percent > 0 {
            self.heal(regen_amount(self.max_hp, percent));
            self.restore_ds(regen_amount(self.max_ds, percent));
        }
        *self != before
    }
}

fn regen_amount(max: u32, percent: u32) -> u32 {
    ((u64::from(max) * u64::from(percent) / 100).max(1)).min(u64::from(u32::MAX)) as u32
}

/// The combatant bound to an avatar.
#[derive(Debug, Clone)]
pub struct Companion {
    pub id: u32,
    pub species: u32,
    pub vitals: Vitals,
    /// Unbuffed stats.
    pub stats: CombatStats,
    pub target: Option<u32>,
    /// Auto-attack switched on by the player.
    pub engaged: bool,
    pub in_battle: bool,
    pub next_attack_at: Option<Instant>,
    /// When the companion went down; starts on the first tick that sees it
    /// dead if it was loaded that way.
    pub knocked_out_at: Option<Instant>,
}

impl Companion {
    pub fn from_record(record: CompanionRecord) -> Self {
        Self {
            id: record.id,
            species: record.species,
            vitals: Vitals::new(record.hp, record.max_hp, record.ds, record.max_ds),
            stats: record.stats,
            target: None,
            engaged: false,
            in_battle: false,
            next_attack_at: None,
            knocked_out_at: None,
        }
    }

    pub fn to_record(&self) -> CompanionRecord {
        CompanionRecord {
            id: self.id,
            species: self.species,
            hp: self.vitals.hp(),
            max_hp: self.vitals.max_hp(),
            ds: self.vitals.ds(),
            max_ds: self.vitals.max_ds(),
            stats: self.stats.clone(),
        }
    }

    pub fn is_dead(&self) -> bool {
        self.vitals.is_dead()
    }

    pub fn engage(&mut self, mob_id: u32) {
        self.target = Some(mob_id);
        self.engaged = true;
        self.in_battle = true;
    }

    /// Drops the current target and leaves battle.
    pub fn disengage(&mut self) {
        self.target = None;
        self.engaged = false;
        self.in_battle = false;
        self.next_attack_at = None;
    }

    pub fn knock_out(&mut self, now: Instant) {
        self.disengage();
        self.knocked_out_at = Some(now);
    }

    /// True once a downed companion has been down for `delay`.
    pub fn revive_due(&mut self, now: Instant, delay: Duration) -> bool {
        let since = *self.knocked_out_at.get_or_insert(now);
        now.saturating_duration_since(since) >= delay
    }

    pub fn revive(&mut self) {
        self.vitals.restore_full();
        self.knocked_out_at = None;
    }

    pub fn ready_to_attack(&self, now: Instant) -> bool {
        self.next_attack_at.map_or(true, |at| at <= now)
    }
}

#[derive(Debug)]
pub struct Session {
    pub account_id: u32,
    pub avatar_id: u32,
    pub name: String,
    pub access_level: u8,
    pub map: MapKey,
    pub x: i32,
    pub y: i32,
    pub vitals: Vitals,
    pub companion: Option<Companion>,
    pub visible_avatars: BTreeSet<u32>,
    pub visible_mobs: BTreeSet<u32>,
    pub buffs: BuffList,
    pub outbound: Outbound,
    pub attendance_ticks: u64,
}

impl Session {
    pub fn from_record(
        record: AvatarRecord,
        access_level: u8,
        outbound: Outbound,
        now: Instant,
    ) -> Self {
        let mut buffs = BuffList::new();
        for buff in record.buffs {
            buffs.add(Buff::new(
                buff.skill_id,
                Duration::from_secs(buff.remaining_secs),
                buff.effect,
                now,
            ));
        }

        Self {
            account_id: record.account_id,
            avatar_id: record.id,
            name: record.name,
            access_level,
            map: record.map,
            x: record.x,
            y: record.y,
            vitals: Vitals::new(record.hp, record.max_hp, record.ds, record.max_ds),
            companion: record.companion.map(Companion::from_record),
            visible_avatars: BTreeSet::new(),
            visible_mobs: BTreeSet::new(),
            buffs,
            outbound,
            attendance_ticks: 0,
        }
    }

    /// Snapshot for persistence. Expired buffs are left out.
    pub fn to_record(&self, now: Instant) -> AvatarRecord {
        AvatarRecord {
            id: self.avatar_id,
            account_id: self.account_id,
            name: self.name.clone(),
            map: self.map,
            x: self.x,
            y: self.y,
            hp: self.vitals.hp(),
            max_hp: self.vitals.max_hp(),
            ds: self.vitals.ds(),
            max_ds: self.vitals.max_ds(),
            companion: self.companion.as_ref().map(Companion::to_record),
            buffs: self
                .buffs
                .iter()
                .filter(|b| b.is_active(now))
                .map(|b| BuffRecord {
                    skill_id: b.skill_id,
                    remaining_secs: b.remaining(now).as_secs(),
                    effect: b.effect,
                })
                .collect(),
        }
    }

    pub fn position(&self) -> (i32, i32) {
        (self.x, self.y)
    }

    /// Whether the owning connection's writer is still there.
    pub fn is_linked(&self) -> bool {
        !self.outbound.is_closed()
    }

    pub fn has_live_companion(&self) -> bool {
        self.companion.as_ref().map_or(false, |c| !c.is_dead())
    }

    /// Companion stats with every active buff folded in.
    pub fn companion_stats(&self, now: Instant) -> Option<CombatStats> {
        let companion = self.companion.as_ref()?;
        let mut stats = companion.stats.clone();
        self.buffs.apply_to(&mut stats, now);
        Some(stats)
    }

    pub fn send<P: Payload>(&self, payload: &P) -> Result<(), SendError> {
        self.outbound.send(payload)
    }

    pub fn appear_packet(&self) -> AvatarAppear {
        let (companion_id, companion_hp, companion_max_hp) = match &self.companion {
            Some(c) => (c.id, c.vitals.hp(), c.vitals.max_hp()),
            None => (0, 0, 0),
        };
        AvatarAppear {
            avatar_id: self.avatar_id,
            name: self.name.clone(),
            x: self.x,
            y: self.y,
            hp: self.vitals.hp(),
            max_hp: self.vitals.max_hp(),
            companion_id,
            companion_hp,
            companion_max_hp,
        }
    }

    pub fn vitals_packet(&self) -> VitalsSync {
        let companion = self
            .companion
            .as_ref()
            .map(|c| c.vitals)
            .unwrap_or_else(|| Vitals::full(0, 0));
        VitalsSync {
            avatar_id: self.avatar_id,
            hp: self.vitals.hp(),
            max_hp: self.vitals.max_hp(),
            ds: self.vitals.ds(),
            max_ds: self.vitals.max_ds(),
            companion_hp: companion.hp(),
            companion_max_hp: companion.max_hp(),
            companion_ds: companion.ds(),
            companion_max_ds: companion.max_ds(),
        }
    }

    pub fn buff_packet(&self, now: Instant) -> BuffUpdate {
        BuffUpdate {
            avatar_id: self.avatar_id,
            active_skills: self.buffs.active_skill_ids(now),
        }
    }
}
