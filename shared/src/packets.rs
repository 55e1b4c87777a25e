//! Packet type ids and payload bodies.
//!
//! Payload bodies are plain serde structs carried with bincode's default
//! options (little-endian, fixed-width integers), matching the frame header.

use crate::frame::{Frame, FrameError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub mod types {
    pub const HANDSHAKE: u16 = 0x0001;
    pub const KEEP_ALIVE: u16 = 0xFFFF;
    pub const HANDSHAKE_ACK: u16 = 0xFFFE;

    pub const LOGIN: u16 = 0x0C80;
    pub const LOGIN_RESULT: u16 = 0x0C81;

    pub const ENTER_WORLD: u16 = 0x0640;
    pub const ENTER_WORLD_RESULT: u16 = 0x0641;
    pub const MOVE: u16 = 0x0642;
    pub const ATTACK_TARGET: u16 = 0x0643;
    pub const STOP_ATTACK: u16 = 0x0644;
    pub const CHANGE_MAP: u16 = 0x0645;

    pub const AVATAR_APPEAR: u16 = 0x0700;
    pub const AVATAR_DISAPPEAR: u16 = 0x0701;
    pub const MOB_APPEAR: u16 = 0x0702;
    pub const MOB_DISAPPEAR: u16 = 0x0703;

    pub const ATTACK_MISS: u16 = 0x0710;
    pub const DAMAGE: u16 = 0x0711;
    pub const KILL: u16 = 0x0712;
    pub const BUFF_UPDATE: u16 = 0x0713;
    pub const VITALS_SYNC: u16 = 0x0714;
}

/// A payload body bound to its packet type.
pub trait Payload: Serialize + DeserializeOwned {
    const TYPE: u16;

    fn to_frame(&self) -> Result<Vec<u8>, FrameError> {
        let body = bincode::serialize(self).map_err(|e| FrameError::Payload {
            packet_type: Self::TYPE,
            reason: e.to_string(),
        })?;
        Frame::encode(Self::TYPE, &body)
    }

    fn from_frame(frame: &Frame) -> Result<Self, FrameError> {
        bincode::deserialize(&frame.payload).map_err(|e| FrameError::Payload {
            packet_type: frame.packet_type,
            reason: e.to_string(),
        })
    }
}

macro_rules! payload {
    ($name:ident => $ty:path) => {
        impl Payload for $name {
            const TYPE: u16 = $ty;
        }
    };
}

/// The kind of simulation space a map instance belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MapKind {
    World,
    Dungeon,
    Event,
    Pvp,
}

/// Identifies one map instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MapKey {
    pub kind: MapKind,
    pub map_id: u16,
    pub channel: u8,
}

impl MapKey {
    pub fn world(map_id: u16) -> Self {
        Self {
            kind: MapKind::World,
            map_id,
            channel: 0,
        }
    }
}

impl std::fmt::Display for MapKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}/{}#{}", self.kind, self.map_id, self.channel)
    }
}

// Client to server

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub mac: [u8; 8],
    pub timestamp: u32,
    pub word: u16,
    pub client_id: u32,
    pub flag_a: u8,
    pub flag_b: u8,
}
payload!(HandshakeRequest => types::HANDSHAKE);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Login {
    pub handshake: u16,
    pub username: String,
    pub password: String,
}
payload!(Login => types::LOGIN);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnterWorld {
    pub account_id: u32,
    pub avatar_id: u32,
    /// Ticket handed out by the account host with a successful login.
    pub ticket: u32,
}
payload!(EnterWorld => types::ENTER_WORLD);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Move {
    pub x: i32,
    pub y: i32,
}
payload!(Move => types::MOVE);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttackTarget {
    pub mob_id: u32,
}
payload!(AttackTarget => types::ATTACK_TARGET);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopAttack;
payload!(StopAttack => types::STOP_ATTACK);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeMap {
    pub map: MapKey,
    pub x: i32,
    pub y: i32,
}
payload!(ChangeMap => types::CHANGE_MAP);

// Server to client

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeAck {
    pub token: u16,
    pub server_time: u32,
}
payload!(HandshakeAck => types::HANDSHAKE_ACK);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoginCode {
    Ok,
    Malformed,
    StaleHandshake,
    InvalidCredentials,
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginResult {
    pub code: LoginCode,
    pub account_id: u32,
    pub access_level: u8,
    /// One-shot ticket for `EnterWorld`; zero unless the login succeeded.
    pub ticket: u32,
}
payload!(LoginResult => types::LOGIN_RESULT);

impl LoginResult {
    pub fn rejected(code: LoginCode) -> Self {
        Self {
            code,
            account_id: 0,
            access_level: 0,
            ticket: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnterWorldResult {
    pub accepted: bool,
    pub map: MapKey,
    pub x: i32,
    pub y: i32,
}
payload!(EnterWorldResult => types::ENTER_WORLD_RESULT);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvatarAppear {
    pub avatar_id: u32,
    pub name: String,
    pub x: i32,
    pub y: i32,
    pub hp: u32,
    pub max_hp: u32,
    pub companion_id: u32,
    pub companion_hp: u32,
    pub companion_max_hp: u32,
}
payload!(AvatarAppear => types::AVATAR_APPEAR);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvatarDisappear {
    pub avatar_id: u32,
}
payload!(AvatarDisappear => types::AVATAR_DISAPPEAR);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MobAppear {
    pub mob_id: u32,
    pub template_id: u32,
    pub x: i32,
    pub y: i32,
    pub hp: u32,
    pub max_hp: u32,
}
payload!(MobAppear => types::MOB_APPEAR);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MobDisappear {
    pub mob_id: u32,
}
payload!(MobDisappear => types::MOB_DISAPPEAR);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttackMiss {
    pub attacker: u32,
    pub target: u32,
}
payload!(AttackMiss => types::ATTACK_MISS);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Damage {
    pub attacker: u32,
    pub target: u32,
    pub damage: u32,
    pub critical: bool,
    pub blocked: bool,
    pub remaining_hp: u32,
}
payload!(Damage => types::DAMAGE);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kill {
    pub attacker: u32,
    pub target: u32,
    pub damage: u32,
    pub critical: bool,
    pub blocked: bool,
}
payload!(Kill => types::KILL);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuffUpdate {
    pub avatar_id: u32,
    pub active_skills: Vec<u32>,
}
payload!(BuffUpdate => types::BUFF_UPDATE);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VitalsSync {
    pub avatar_id: u32,
    pub hp: u32,
    pub max_hp: u32,
    pub ds: u32,
    pub max_ds: u32,
    pub companion_hp: u32,
    pub companion_max_hp: u32,
    pub companion_ds: u32,
    pub companion_max_ds: u32,
}
payload!(VitalsSync => types::VITALS_SYNC);
