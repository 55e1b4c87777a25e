//! Scripted player: logs in, enters the world and fights whatever shows up.

use crate::network::{ClientError, GameClient};
use log::{debug, info};
use shared::packets::{
    AttackMiss, AttackTarget, Damage, EnterWorld, EnterWorldResult, Kill, LoginCode, MobAppear,
    MobDisappear,
};
use shared::{types, Frame, Payload};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;
use tokio::time::{timeout, Instant};

#[derive(Debug, Clone)]
pub struct BotConfig {
    pub account_addr: String,
    pub game_addr: String,
    pub username: String,
    pub password: String,
    pub avatar_id: u32,
    pub run_for: Duration,
    pub fake_ping_ms: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BotReport {
    pub account_id: u32,
    pub mobs_seen: usize,
    pub hits: usize,
    pub misses: usize,
    pub kills: usize,
}

#[derive(Debug)]
pub enum BotError {
    Client(ClientError),
    LoginRejected(LoginCode),
    EnterRejected,
}

impl fmt::Display for BotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BotError::Client(e) => write!(f, "{}", e),
            BotError::LoginRejected(code) => write!(f, "login rejected: {:?}", code),
            BotError::EnterRejected => write!(f, "game server refused the avatar"),
        }
    }
}

impl std::error::Error for BotError {}

impl From<ClientError> for BotError {
    fn from(e: ClientError) -> Self {
        BotError::Client(e)
    }
}

impl From<shared::FrameError> for BotError {
    fn from(e: shared::FrameError) -> Self {
        BotError::Client(ClientError::Frame(e))
    }
}

const KEEP_ALIVE_EVERY: Duration = Duration::from_secs(10);

pub async fn run(config: &BotConfig) -> Result<BotReport, BotError> {
    let mut account = GameClient::connect(config.account_addr.as_str())
        .await?
        .with_fake_ping(config.fake_ping_ms);
    let login = account.login(&config.username, &config.password).await?;
    if login.code != LoginCode::Ok {
        return Err(BotError::LoginRejected(login.code));
    }
    drop(account);

    let mut game = GameClient::connect(config.game_addr.as_str())
        .await?
        .with_fake_ping(config.fake_ping_ms);
    game.send(&EnterWorld {
        account_id: login.account_id,
        avatar_id: config.avatar_id,
        ticket: login.ticket,
    })
    .await?;
    let entered: EnterWorldResult = game.expect(Duration::from_secs(5)).await?;
    if !entered.accepted {
        return Err(BotError::EnterRejected);
    }
    info!(
        "Avatar {} entered {} at ({}, {})",
        config.avatar_id, entered.map, entered.x, entered.y
    );

    let mut report = BotReport {
        account_id: login.account_id,
        ..BotReport::default()
    };
    let mut fight = Fight::default();
    let deadline = Instant::now() + config.run_for;
    let mut last_keep_alive = Instant::now();

    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        if last_keep_alive.elapsed() >= KEEP_ALIVE_EVERY {
            game.keep_alive().await?;
            last_keep_alive = Instant::now();
        }

        let frame = match timeout(left.min(KEEP_ALIVE_EVERY), game.recv_frame()).await {
            Ok(frame) => frame?,
            Err(_) => continue,
        };
        if let Some(mob_id) = fight.observe(&frame, &mut report)? {
            info!("Engaging mob {}", mob_id);
            game.send(&AttackTarget { mob_id }).await?;
        }
    }

    info!(
        "Bot done: {} mobs seen, {} hits, {} misses, {} kills",
        report.mobs_seen, report.hits, report.misses, report.kills
    );
    Ok(report)
}

/// Which mobs are around and which one we are on.
#[derive(Debug, Default)]
struct Fight {
    visible: BTreeSet<u32>,
    target: Option<u32>,
}

impl Fight {
    /// Updates from one server frame. Returns a mob to engage when the bot
    /// has nothing to hit.
    fn observe(
        &mut self,
        frame: &Frame,
        report: &mut BotReport,
    ) -> Result<Option<u32>, BotError> {
        match frame.packet_type {
            types::MOB_APPEAR => {
                let mob = MobAppear::from_frame(frame)?;
                debug!("Mob {} at ({}, {})", mob.mob_id, mob.x, mob.y);
                report.mobs_seen += 1;
                self.visible.insert(mob.mob_id);
            }
            types::MOB_DISAPPEAR => {
                let mob = MobDisappear::from_frame(frame)?;
                self.visible.remove(&mob.mob_id);
                if self.target == Some(mob.mob_id) {
                    self.target = None;
                }
            }
            types::DAMAGE => {
                let hit = Damage::from_frame(frame)?;
                report.hits += 1;
                info!(
                    "{} hit {} for {}{} ({} left)",
                    hit.attacker,
                    hit.target,
                    hit.damage,
                    if hit.critical { " (critical)" } else { "" },
                    hit.remaining_hp
                );
            }
            types::ATTACK_MISS => {
                let miss = AttackMiss::from_frame(frame)?;
                report.misses += 1;
                debug!("{} missed {}", miss.attacker, miss.target);
            }
            types::KILL => {
                let kill = Kill::from_frame(frame)?;
                report.kills += 1;
                info!("{} killed {}", kill.attacker, kill.target);
                self.visible.remove(&kill.target);
                if self.target == Some(kill.target) {
                    self.target = None;
                }
            }
            other => debug!("Ignoring type {:#06x}", other),
        }

        if self.target.is_some() {
            return Ok(None);
        }
        self.target = self.visible.iter().next().copied();
        Ok(self.target)
    }
}
