//! One map instance: its avatars, its mobs and the tick pass over them.
//!
//! Everything in here is synchronous. The owning `World` keeps each
//! `MapState` behind its own lock and calls `run_tick` on a timer; handlers
//! take the same lock for their mutations, so a single avatar is never
//! touched by a handler and the tick at once.

use crate::combat::{self, AdvantageTable, Outcome};
use crate::config::TickConfig;
use crate::connection::Outbound;
use crate::session::{Session, Vitals};
use crate::store::SpawnPoint;
use crate::utils::distance;
use log::debug;
use rand::rngs::StdRng;
use shared::packets::{AttackMiss, AvatarDisappear, Damage, Kill, MobAppear, MobDisappear};
use shared::{FrameError, MapKey, Payload};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::{Duration, Instant};

/// Coordinates are clamped to `-MAP_EXTENT..=MAP_EXTENT` on both axes.
pub const MAP_EXTENT: i32 = 32_000;
/// First id handed to a spawned mob, keeps them apart from avatar ids.
pub const MOB_ID_BASE: u32 = 1 << 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Appear,
    Disappear,
    Unchanged,
}

/// Two-threshold visibility rule. Something becomes visible at or inside
/// `appear` and stays visible until it reaches `disappear`.
pub fn visibility_transition(
    visible: bool,
    distance: f64,
    appear: f64,
    disappear: f64,
) -> Transition {
    if !visible && distance <= appear {
        Transition::Appear
    } else if visible && distance >= disappear {
        Transition::Disappear
    } else {
        Transition::Unchanged
    }
}

#[derive(Debug)]
pub enum TickError {
    MissingSession { avatar_id: u32 },
    MissingCompanion { avatar_id: u32 },
    UnknownMob { avatar_id: u32, mob_id: u32 },
    Encode { avatar_id: u32, source: FrameError },
}

impl fmt::Display for TickError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TickError::MissingSession { avatar_id } => {
                write!(f, "avatar {} left during the pass", avatar_id)
            }
            TickError::MissingCompanion { avatar_id } => {
                write!(f, "avatar {} has no companion", avatar_id)
            }
            TickError::UnknownMob { avatar_id, mob_id } => {
                write!(f, "avatar {} targets unknown mob {}", avatar_id, mob_id)
            }
            TickError::Encode { avatar_id, source } => {
                write!(f, "failed to encode update for avatar {}: {}", avatar_id, source)
            }
        }
    }
}

impl std::error::Error for TickError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attendance {
    pub account_id: u32,
    pub avatar_id: u32,
    pub ticks: u64,
}

/// What one pass produced besides the frames it queued.
#[derive(Debug, Default)]
pub struct TickReport {
    pub attendance: Vec<Attendance>,
    pub errors: Vec<TickError>,
    pub attacks: usize,
    pub kills: usize,
}

#[derive(Debug, Clone)]
pub struct Mob {
    pub id: u32,
    pub template_id: u32,
    pub spawn: (i32, i32),
    pub x: i32,
    pub y: i32,
    pub vitals: Vitals,
    pub stats: combat::CombatStats,
    pub in_battle: bool,
    /// Avatars that currently see this mob.
    pub viewers: BTreeSet<u32>,
    /// Avatars whose companion is fighting this mob.
    pub engaged_by: BTreeSet<u32>,
    pub respawn: Duration,
    pub dead_since: Option<Instant>,
    pub next_attack_at: Option<Instant>,
}

impl Mob {
    pub fn from_spawn(id: u32, spawn: &SpawnPoint) -> Self {
        Self {
            id,
            template_id: spawn.template.id,
            spawn: (spawn.x, spawn.y),
            x: spawn.x,
            y: spawn.y,
            vitals: Vitals::full(spawn.template.max_hp, 0),
            stats: spawn.template.stats.clone(),
            in_battle: false,
            viewers: BTreeSet::new(),
            engaged_by: BTreeSet::new(),
            respawn: Duration::from_secs(spawn.template.respawn_secs),
            dead_since: None,
            next_attack_at: None,
        }
    }

    pub fn position(&self) -> (i32, i32) {
        (self.x, self.y)
    }

    pub fn is_dead(&self) -> bool {
        self.dead_since.is_some() || self.vitals.is_dead()
    }

    pub fn appear_packet(&self) -> MobAppear {
        MobAppear {
            mob_id: self.id,
            template_id: self.template_id,
            x: self.x,
            y: self.y,
            hp: self.vitals.hp(),
            max_hp: self.vitals.max_hp(),
        }
    }

    fn release(&mut self, avatar_id: u32) {
        self.engaged_by.remove(&avatar_id);
        if self.engaged_by.is_empty() {
            self.in_battle = false;
        }
    }

    fn ready_to_attack(&self, now: Instant) -> bool {
        self.next_attack_at.map_or(true, |at| at <= now)
    }

    fn die(&mut self, now: Instant) {
        self.dead_since = Some(now);
        self.in_battle = false;
        self.next_attack_at = None;
    }

    fn respawn_due(&self, now: Instant) -> bool {
        self.dead_since
            .map_or(false, |since| now.saturating_duration_since(since) >= self.respawn)
    }

    fn respawn(&mut self) {
        self.vitals.restore_full();
        self.x = self.spawn.0;
        self.y = self.spawn.1;
        self.dead_since = None;
        self.in_battle = false;
        self.engaged_by.clear();
        self.viewers.clear();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngageError {
    UnknownAvatar,
    NoCompanion,
    CompanionDead,
    UnknownMob,
    MobDead,
    NotVisible,
}

impl fmt::Display for EngageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            EngageError::UnknownAvatar => "avatar is not on this map",
            EngageError::NoCompanion => "avatar has no companion",
            EngageError::CompanionDead => "companion is dead",
            EngageError::UnknownMob => "no such mob",
            EngageError::MobDead => "mob is dead",
            EngageError::NotVisible => "mob is out of sight",
        };
        f.write_str(reason)
    }
}

impl std::error::Error for EngageError {}

/// Frames and kills collected while one avatar is being processed, applied
/// once the avatar's borrow is released.
struct Effects {
    avatar_id: u32,
    frames: Vec<(u32, Vec<u8>)>,
    killed: Vec<u32>,
}

impl Effects {
    fn new(avatar_id: u32) -> Self {
        Self {
            avatar_id,
            frames: Vec::new(),
            killed: Vec::new(),
        }
    }

    fn push<P: Payload>(
        &mut self,
        recipients: impl IntoIterator<Item = u32>,
        payload: &P,
    ) -> Result<(), TickError> {
        let bytes = payload.to_frame().map_err(|source| TickError::Encode {
            avatar_id: self.avatar_id,
            source,
        })?;
        for recipient in recipients {
            self.frames.push((recipient, bytes.clone()));
        }
        Ok(())
    }

    fn flush(self, sessions: &BTreeMap<u32, Session>) {
        for (recipient, bytes) in self.frames {
            if let Some(session) = sessions.get(&recipient) {
                if let Err(e) = session.outbound.send_bytes(bytes) {
                    debug!("Dropping update for avatar {}: {}", recipient, e);
                }
            }
        }
    }
}

fn deliver<P: Payload>(session: &Session, payload: &P) {
    if let Err(e) = session.send(payload) {
        debug!("Could not reach avatar {}: {}", session.avatar_id, e);
    }
}

/// The avatar itself plus everyone who can see it.
fn audience(session: &Session) -> Vec<u32> {
    std::iter::once(session.avatar_id)
        .chain(session.visible_avatars.iter().copied())
        .collect()
}

struct TickContext<'a> {
    now: Instant,
    tick: u64,
    config: &'a TickConfig,
}

pub struct MapState {
    key: MapKey,
    sessions: BTreeMap<u32, Session>,
    mobs: BTreeMap<u32, Mob>,
    advantages: AdvantageTable,
    rng: StdRng,
    tick: u64,
    next_mob_id: u32,
}

impl MapState {
    pub fn new(key: MapKey, advantages: AdvantageTable, rng: StdRng) -> Self {
        Self {
            key,
            sessions: BTreeMap::new(),
            mobs: BTreeMap::new(),
            advantages,
            rng,
            tick: 0,
            next_mob_id: MOB_ID_BASE,
        }
    }

    pub fn key(&self) -> MapKey {
        self.key
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn spawn_mobs(&mut self, spawns: &[SpawnPoint]) {
        for spawn in spawns {
            let id = self.next_mob_id;
            self.next_mob_id += 1;
            self.mobs.insert(id, Mob::from_spawn(id, spawn));
        }
    }

    pub fn mob(&self, mob_id: u32) -> Option<&Mob> {
        self.mobs.get(&mob_id)
    }

    pub fn mobs(&self) -> impl Iterator<Item = &Mob> {
        self.mobs.values()
    }

    pub fn session(&self, avatar_id: u32) -> Option<&Session> {
        self.sessions.get(&avatar_id)
    }

    pub fn session_mut(&mut self, avatar_id: u32) -> Option<&mut Session> {
        self.sessions.get_mut(&avatar_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Takes ownership of a session. Visibility starts empty and fills on the
    /// next pass. An older session for the same avatar is removed first.
    pub fn insert_session(&mut self, mut session: Session) -> Option<Session> {
        let replaced = self.leave(session.avatar_id);
        session.map = self.key;
        session.visible_avatars.clear();
        session.visible_mobs.clear();
        self.sessions.insert(session.avatar_id, session);
        replaced
    }

    /// Removes an avatar. Everyone who could see it is told it is gone.
    pub fn leave(&mut self, avatar_id: u32) -> Option<Session> {
        let mut session = self.sessions.remove(&avatar_id)?;

        let notice = AvatarDisappear { avatar_id };
        for other_id in &session.visible_avatars {
            if let Some(other) = self.sessions.get_mut(other_id) {
                other.visible_avatars.remove(&avatar_id);
                deliver(other, &notice);
            }
        }
        for mob in self.mobs.values_mut() {
            mob.viewers.remove(&avatar_id);
            mob.release(avatar_id);
        }

        session.visible_avatars.clear();
        session.visible_mobs.clear();
        if let Some(companion) = session.companion.as_mut() {
            companion.disengage();
        }
        Some(session)
    }

    /// `leave` for the connection that owns the session. A session that was
    /// entered through a different connection stays put.
    pub fn leave_owned(&mut self, avatar_id: u32, owner: &Outbound) -> Option<Session> {
        let owned = self
            .sessions
            .get(&avatar_id)
            .map_or(false, |session| session.outbound.same_channel(owner));
        if !owned {
            return None;
        }
        self.leave(avatar_id)
    }

    pub fn move_avatar(&mut self, avatar_id: u32, x: i32, y: i32) -> bool {
        match self.sessions.get_mut(&avatar_id) {
            Some(session) => {
                session.x = x.clamp(-MAP_EXTENT, MAP_EXTENT);
                session.y = y.clamp(-MAP_EXTENT, MAP_EXTENT);
                true
            }
            None => false,
        }
    }

    /// Switches auto-attack on against a mob the avatar can see.
    pub fn engage(&mut self, avatar_id: u32, mob_id: u32) -> Result<(), EngageError> {
        let session = self
            .sessions
            .get_mut(&avatar_id)
            .ok_or(EngageError::UnknownAvatar)?;
        let mob = self.mobs.get_mut(&mob_id).ok_or(EngageError::UnknownMob)?;
        if mob.is_dead() {
            return Err(EngageError::MobDead);
        }
        if !session.visible_mobs.contains(&mob_id) {
            return Err(EngageError::NotVisible);
        }
        let companion = session.companion.as_mut().ok_or(EngageError::NoCompanion)?;
        if companion.is_dead() {
            return Err(EngageError::CompanionDead);
        }

        if let Some(previous) = companion.target.filter(|&id| id != mob_id) {
            if let Some(old) = self.mobs.get_mut(&previous) {
                old.release(avatar_id);
            }
        }
        companion.engage(mob_id);
        if let Some(mob) = self.mobs.get_mut(&mob_id) {
            mob.engaged_by.insert(avatar_id);
            mob.in_battle = true;
        }
        Ok(())
    }

    pub fn disengage(&mut self, avatar_id: u32) -> bool {
        let Some(companion) = self
            .sessions
            .get_mut(&avatar_id)
            .and_then(|s| s.companion.as_mut())
        else {
            return false;
        };
        if let Some(mob) = companion.target.and_then(|id| self.mobs.get_mut(&id)) {
            mob.release(avatar_id);
        }
        companion.disengage();
        true
    }

    /// One full pass over the map.
    pub fn run_tick(&mut self, now: Instant, config: &TickConfig) -> TickReport {
        self.tick += 1;
        let mut report = TickReport::default();

        self.respawn_mobs(now);
        self.update_avatar_visibility(config);

        let ids: Vec<u32> = self.sessions.keys().copied().collect();
        for avatar_id in ids {
            if let Err(e) = self.tick_avatar(avatar_id, now, config, &mut report) {
                report.errors.push(e);
            }
        }
        report
    }

    fn respawn_mobs(&mut self, now: Instant) {
        for mob in self.mobs.values_mut() {
            if mob.respawn_due(now) {
                mob.respawn();
                debug!("Mob {} respawned on {}", mob.id, self.key);
            }
        }
    }

    fn update_avatar_visibility(&mut self, config: &TickConfig) {
        let linked: Vec<(u32, (i32, i32))> = self
            .sessions
            .values()
            .filter(|s| s.is_linked())
            .map(|s| (s.avatar_id, s.position()))
            .collect();

        for (i, &(a, a_pos)) in linked.iter().enumerate() {
            for &(b, b_pos) in &linked[i + 1..] {
                let visible = self
                    .sessions
                    .get(&a)
                    .map_or(false, |s| s.visible_avatars.contains(&b));
                let transition = visibility_transition(
                    visible,
                    distance(a_pos, b_pos),
                    config.appear_distance,
                    config.disappear_distance,
                );
                match transition {
                    Transition::Appear => self.link_pair(a, b),
                    Transition::Disappear => self.unlink_pair(a, b),
                    Transition::Unchanged => {}
                }
            }
        }
    }

    fn link_pair(&mut self, a: u32, b: u32) {
        for (observer, subject) in [(a, b), (b, a)] {
            let Some(packet) = self.sessions.get(&subject).map(Session::appear_packet) else {
                continue;
            };
            if let Some(session) = self.sessions.get_mut(&observer) {
                session.visible_avatars.insert(subject);
                deliver(session, &packet);
            }
        }
    }

    fn unlink_pair(&mut self, a: u32, b: u32) {
        for (observer, subject) in [(a, b), (b, a)] {
            if let Some(session) = self.sessions.get_mut(&observer) {
                session.visible_avatars.remove(&subject);
                deliver(session, &AvatarDisappear { avatar_id: subject });
            }
        }
    }

    fn tick_avatar(
        &mut self,
        avatar_id: u32,
        now: Instant,
        config: &TickConfig,
        report: &mut TickReport,
    ) -> Result<(), TickError> {
        let ctx = TickContext {
            now,
            tick: self.tick,
            config,
        };
        let mut effects = Effects::new(avatar_id);

        let result = {
            let MapState {
                sessions,
                mobs,
                advantages,
                rng,
                ..
            } = self;
            match sessions.get_mut(&avatar_id) {
                Some(session) => {
                    step_avatar(session, mobs, advantages, rng, &ctx, &mut effects, report)
                }
                None => Err(TickError::MissingSession { avatar_id }),
            }
        };

        for mob_id in std::mem::take(&mut effects.killed) {
            if let Err(e) = self.clear_dead_mob(mob_id, &mut effects) {
                report.errors.push(e);
            }
        }
        effects.flush(&self.sessions);
        result
    }

    /// Detaches a freshly killed mob from everyone who saw or fought it.
    fn clear_dead_mob(&mut self, mob_id: u32, effects: &mut Effects) -> Result<(), TickError> {
        let Some(mob) = self.mobs.get_mut(&mob_id) else {
            return Ok(());
        };
        let viewers = std::mem::take(&mut mob.viewers);
        let fighters = std::mem::take(&mut mob.engaged_by);

        for avatar_id in &fighters {
            if let Some(companion) = self
                .sessions
                .get_mut(avatar_id)
                .and_then(|s| s.companion.as_mut())
            {
                if companion.target == Some(mob_id) {
                    companion.disengage();
                }
            }
        }
        for avatar_id in &viewers {
            if let Some(session) = self.sessions.get_mut(avatar_id) {
                session.visible_mobs.remove(&mob_id);
            }
        }
        effects.push(viewers, &MobDisappear { mob_id })
    }
}

fn step_avatar(
    session: &mut Session,
    mobs: &mut BTreeMap<u32, Mob>,
    advantages: &AdvantageTable,
    rng: &mut StdRng,
    ctx: &TickContext<'_>,
    effects: &mut Effects,
    report: &mut TickReport,
) -> Result<(), TickError> {
    if !session.is_linked() {
        return Ok(());
    }
    let fighting = match session.companion.as_mut() {
        None => {
            return Err(TickError::MissingCompanion {
                avatar_id: session.avatar_id,
            })
        }
        Some(companion) if companion.is_dead() => {
            if companion.revive_due(ctx.now, ctx.config.companion_revive()) {
                companion.revive();
                debug!("Companion {} revived", companion.id);
                effects.push(audience(session), &session.vitals_packet())?;
                true
            } else {
                false
            }
        }
        Some(_) => true,
    };

    // A downed companion sits out; the avatar itself keeps ticking.
    if fighting {
        update_mob_visibility(session, mobs, ctx.config, effects)?;
        auto_attack(session, mobs, advantages, rng, ctx.now, effects, report)?;
    }

    session.attendance_ticks += 1;
    if ctx.config.reward_every_ticks > 0 && ctx.tick % ctx.config.reward_every_ticks == 0 {
        report.attendance.push(Attendance {
            account_id: session.account_id,
            avatar_id: session.avatar_id,
            ticks: session.attendance_ticks,
        });
        session.attendance_ticks = 0;
    }

    session.vitals.regen(ctx.config.regen_percent);
    if let Some(companion) = session.companion.as_mut().filter(|c| !c.is_dead()) {
        companion.vitals.regen(ctx.config.regen_percent);
    }

    if !session.buffs.sweep(ctx.now).is_empty() {
        effects.push(audience(session), &session.buff_packet(ctx.now))?;
    }

    if ctx.config.sync_every_ticks > 0 && ctx.tick % ctx.config.sync_every_ticks == 0 {
        effects.push(audience(session), &session.vitals_packet())?;
    }
    Ok(())
}

fn update_mob_visibility(
    session: &mut Session,
    mobs: &mut BTreeMap<u32, Mob>,
    config: &TickConfig,
    effects: &mut Effects,
) -> Result<(), TickError> {
    let me = session.avatar_id;
    let position = session.position();

    for mob in mobs.values_mut().filter(|m| !m.is_dead()) {
        let visible = session.visible_mobs.contains(&mob.id);
        let transition = visibility_transition(
            visible,
            distance(position, mob.position()),
            config.appear_distance,
            config.disappear_distance,
        );
        match transition {
            Transition::Appear => {
                session.visible_mobs.insert(mob.id);
                mob.viewers.insert(me);
                effects.push([me], &mob.appear_packet())?;
            }
            Transition::Disappear => {
                session.visible_mobs.remove(&mob.id);
                mob.viewers.remove(&me);
                if let Some(companion) = session.companion.as_mut() {
                    if companion.target == Some(mob.id) {
                        companion.disengage();
                        mob.release(me);
                    }
                }
                effects.push([me], &MobDisappear { mob_id: mob.id })?;
            }
            Transition::Unchanged => {}
        }
    }
    Ok(())
}

/// One step of companion-versus-mob combat, plus the mob's answer.
fn auto_attack(
    session: &mut Session,
    mobs: &mut BTreeMap<u32, Mob>,
    advantages: &AdvantageTable,
    rng: &mut StdRng,
    now: Instant,
    effects: &mut Effects,
    report: &mut TickReport,
) -> Result<(), TickError> {
    let avatar_id = session.avatar_id;
    let stunned = session.buffs.is_stunned(now);
    let watchers = audience(session);
    let Some(stats) = session.companion_stats(now) else {
        return Err(TickError::MissingCompanion { avatar_id });
    };
    let Some(companion) = session.companion.as_mut() else {
        return Err(TickError::MissingCompanion { avatar_id });
    };
    let Some(mob_id) = companion.target.filter(|_| companion.engaged) else {
        return Ok(());
    };
    let Some(mob) = mobs.get_mut(&mob_id) else {
        companion.disengage();
        return Err(TickError::UnknownMob { avatar_id, mob_id });
    };
    if mob.is_dead() || !session.visible_mobs.contains(&mob_id) {
        companion.disengage();
        mob.release(avatar_id);
        return Ok(());
    }

    mob.engaged_by.insert(avatar_id);
    mob.in_battle = true;
    companion.in_battle = true;

    if !stunned && companion.ready_to_attack(now) {
        companion.next_attack_at = Some(now + Duration::from_millis(stats.attack_speed_ms));
        report.attacks += 1;

        let mut recipients = mob.viewers.clone();
        recipients.insert(avatar_id);
        let matchup = advantages.matchup(&stats, &mob.stats);

        match combat::engage(&stats, &mob.stats, mob.vitals.hp(), matchup, rng) {
            Outcome::Missed => effects.push(
                recipients,
                &AttackMiss {
                    attacker: companion.id,
                    target: mob_id,
                },
            )?,
            Outcome::Hit(hit) => {
                let remaining = mob.vitals.damage(hit.damage);
                if remaining == 0 {
                    effects.push(
                        recipients,
                        &Kill {
                            attacker: companion.id,
                            target: mob_id,
                            damage: hit.damage,
                            critical: hit.critical,
                            blocked: hit.blocked,
                        },
                    )?;
                    mob.die(now);
                    companion.disengage();
                    effects.killed.push(mob_id);
                    report.kills += 1;
                    debug!("Companion {} killed mob {}", companion.id, mob_id);
                    return Ok(());
                }
                effects.push(
                    recipients,
                    &Damage {
                        attacker: companion.id,
                        target: mob_id,
                        damage: hit.damage,
                        critical: hit.critical,
                        blocked: hit.blocked,
                        remaining_hp: remaining,
                    },
                )?;
            }
        }
    }

    if !mob.ready_to_attack(now) {
        return Ok(());
    }
    mob.next_attack_at = Some(now + Duration::from_millis(mob.stats.attack_speed_ms));
    let matchup = advantages.matchup(&mob.stats, &stats);

    match combat::engage(&mob.stats, &stats, companion.vitals.hp(), matchup, rng) {
        Outcome::Missed => effects.push(
            watchers,
            &AttackMiss {
                attacker: mob_id,
                target: companion.id,
            },
        )?,
        Outcome::Hit(hit) => {
            let remaining = companion.vitals.damage(hit.damage);
            if remaining == 0 {
                effects.push(
                    watchers,
                    &Kill {
                        attacker: mob_id,
                        target: companion.id,
                        damage: hit.damage,
                        critical: hit.critical,
                        blocked: hit.blocked,
                    },
                )?;
                companion.knock_out(now);
                mob.release(avatar_id);
                debug!("Mob {} knocked out companion {}", mob_id, companion.id);
            } else {
                effects.push(
                    watchers,
                    &Damage {
                        attacker: mob_id,
                        target: companion.id,
                        damage: hit.damage,
                        critical: hit.critical,
                        blocked: hit.blocked,
                        remaining_hp: remaining,
                    },
                )?;
            }
        }
    }
    Ok(())
}
