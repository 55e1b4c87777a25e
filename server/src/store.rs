//! Persistence and static content, reached through a query channel.
//!
//! Callers hold a cheap `Store` handle and `send` a `Query`; a single task
//! owns the `Backend` and answers requests in arrival order. `notify` is the
//! fire-and-forget form used from the tick and from disconnect cleanup.

use crate::buff::Effect;
use crate::combat::{AdvantageTable, Attribute, CombatStats, Element};
use log::warn;
use shared::MapKey;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, PartialEq)]
pub struct AccountRecord {
    pub id: u32,
    pub username: String,
    pub password: String,
    pub access_level: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompanionRecord {
    pub id: u32,
    pub species: u32,
    pub hp: u32,
    pub max_hp: u32,
    pub ds: u32,
    pub max_ds: u32,
    pub stats: CombatStats,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuffRecord {
    pub skill_id: u32,
    pub remaining_secs: u64,
    pub effect: Effect,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AvatarRecord {
    pub id: u32,
    pub account_id: u32,
    pub name: String,
    pub map: MapKey,
    pub x: i32,
    pub y: i32,
    pub hp: u32,
    pub max_hp: u32,
    pub ds: u32,
    pub max_ds: u32,
    pub companion: Option<CompanionRecord>,
    pub buffs: Vec<BuffRecord>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MobTemplate {
    pub id: u32,
    pub max_hp: u32,
    pub stats: CombatStats,
    pub respawn_secs: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpawnPoint {
    pub template: MobTemplate,
    pub x: i32,
    pub y: i32,
}

#[derive(Debug, Clone)]
pub enum Query {
    Authenticate { username: String, password: String },
    LoadAvatar { account_id: u32, avatar_id: u32 },
    SaveAvatar(AvatarRecord),
    RecordAttendance { account_id: u32, avatar_id: u32, ticks: u64 },
    /// Replaces the account's pending world-entry ticket.
    IssueTicket { account_id: u32, ticket: u32 },
    /// Consumes the pending ticket if it matches.
    RedeemTicket { account_id: u32, ticket: u32 },
    MapSpawns { map_id: u16 },
    Advantages,
}

impl Query {
    fn name(&self) -> &'static str {
        match self {
            Query::Authenticate { .. } => "Authenticate",
            Query::LoadAvatar { .. } => "LoadAvatar",
            Query::SaveAvatar(_) => "SaveAvatar",
            Query::RecordAttendance { .. } => "RecordAttendance",
            Query::IssueTicket { .. } => "IssueTicket",
            Query::RedeemTicket { .. } => "RedeemTicket",
            Query::MapSpawns { .. } => "MapSpawns",
            Query::Advantages => "Advantages",
        }
    }
}

#[derive(Debug, Clone)]
pub enum QueryResult {
    Account(Option<AccountRecord>),
    Avatar(Option<AvatarRecord>),
    Redeemed(bool),
    /// `None` for a map static content does not know.
    Spawns(Option<Vec<SpawnPoint>>),
    Advantages(AdvantageTable),
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    Unavailable(String),
    UnexpectedResult(&'static str),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Unavailable(reason) => write!(f, "store unavailable: {}", reason),
            StoreError::UnexpectedResult(query) => {
                write!(f, "store returned the wrong result kind for {}", query)
            }
        }
    }
}

impl std::error::Error for StoreError {}

/// Whatever actually answers queries.
pub trait Backend: Send + 'static {
    fn handle(&mut self, query: Query) -> Result<QueryResult, StoreError>;
}

struct Request {
    query: Query,
    reply: Option<oneshot::Sender<Result<QueryResult, StoreError>>>,
}

#[derive(Clone)]
pub struct Store {
    tx: mpsc::UnboundedSender<Request>,
}

impl Store {
    /// Moves `backend` onto its own task. Must be called inside a runtime.
    pub fn spawn<B: Backend>(backend: B) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(backend_task(backend, rx));
        Self { tx }
    }

    pub async fn send(&self, query: Query) -> Result<QueryResult, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request {
                query,
                reply: Some(reply),
            })
            .map_err(|_| StoreError::Unavailable("store task stopped".to_string()))?;
        rx.await
            .map_err(|_| StoreError::Unavailable("store dropped the request".to_string()))?
    }

    /// Queues a write without waiting. Failures are logged by the store task.
    pub fn notify(&self, query: Query) {
        let name = query.name();
        if self.tx.send(Request { query, reply: None }).is_err() {
            warn!("Store task stopped, dropping {}", name);
        }
    }

    pub async fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<AccountRecord>, StoreError> {
        let query = Query::Authenticate {
            username: username.to_string(),
            password: password.to_string(),
        };
        match self.send(query).await? {
            QueryResult::Account(account) => Ok(account),
            _ => Err(StoreError::UnexpectedResult("Authenticate")),
        }
    }

    pub async fn load_avatar(
        &self,
        account_id: u32,
        avatar_id: u32,
    ) -> Result<Option<AvatarRecord>, StoreError> {
        match self
            .send(Query::LoadAvatar {
                account_id,
                avatar_id,
            })
            .await?
        {
            QueryResult::Avatar(avatar) => Ok(avatar),
            _ => Err(StoreError::UnexpectedResult("LoadAvatar")),
        }
    }

    pub async fn issue_ticket(&self, account_id: u32, ticket: u32) -> Result<(), StoreError> {
        match self.send(Query::IssueTicket { account_id, ticket }).await? {
            QueryResult::Done => Ok(()),
            _ => Err(StoreError::UnexpectedResult("IssueTicket")),
        }
    }

    pub async fn redeem_ticket(&self, account_id: u32, ticket: u32) -> Result<bool, StoreError> {
        match self.send(Query::RedeemTicket { account_id, ticket }).await? {
            QueryResult::Redeemed(redeemed) => Ok(redeemed),
            _ => Err(StoreError::UnexpectedResult("RedeemTicket")),
        }
    }

    pub async fn map_spawns(&self, map_id: u16) -> Result<Option<Vec<SpawnPoint>>, StoreError> {
        match self.send(Query::MapSpawns { map_id }).await? {
            QueryResult::Spawns(spawns) => Ok(spawns),
            _ => Err(StoreError::UnexpectedResult("MapSpawns")),
        }
    }

    pub async fn advantages(&self) -> Result<AdvantageTable, StoreError> {
        match self.send(Query::Advantages).await? {
            QueryResult::Advantages(table) => Ok(table),
            _ => Err(StoreError::UnexpectedResult("Advantages")),
        }
    }
}

async fn backend_task<B: Backend>(mut backend: B, mut rx: mpsc::UnboundedReceiver<Request>) {
    while let Some(request) = rx.recv().await {
        let name = request.query.name();
        let result = backend.handle(request.query);
        match request.reply {
            Some(reply) => {
                let _ = reply.send(result);
            }
            None => {
                if let Err(e) = result {
                    warn!("Detached {} failed: {}", name, e);
                }
            }
        }
    }
}

/// In-process backend holding everything in maps.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    accounts: HashMap<String, AccountRecord>,
    avatars: HashMap<u32, AvatarRecord>,
    spawns: HashMap<u16, Vec<SpawnPoint>>,
    advantages: AdvantageTable,
    attendance: HashMap<u32, u64>,
    tickets: HashMap<u32, u32>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_account(mut self, account: AccountRecord) -> Self {
        self.accounts.insert(account.username.clone(), account);
        self
    }

    pub fn with_avatar(mut self, avatar: AvatarRecord) -> Self {
        self.avatars.insert(avatar.id, avatar);
        self
    }

    pub fn with_spawns(mut self, map_id: u16, spawns: Vec<SpawnPoint>) -> Self {
        self.spawns.insert(map_id, spawns);
        self
    }

    pub fn with_advantages(mut self, advantages: AdvantageTable) -> Self {
        self.advantages = advantages;
        self
    }

    pub fn attendance(&self, avatar_id: u32) -> u64 {
        self.attendance.get(&avatar_id).copied().unwrap_or(0)
    }

    /// Two demo accounts, each with one avatar on world map 1, and a few
    /// mobs around the spawn point. Maps 2 to 4 exist but are empty.
    pub fn seeded() -> Self {
        let companion_stats = CombatStats {
            level: 12,
            attack: 420,
            defense: 180,
            accuracy: 300,
            evasion: 60,
            critical_chance: 10.0,
            critical_damage: 5000.0,
            block: 5.0,
            attack_speed_ms: 1800,
            attribute: Attribute::Vaccine,
            element: Element::Fire,
            attribute_exp: 2_000,
            element_exp: 1_000,
        };

        let mut store = Self::new()
            .with_account(AccountRecord {
                id: 1,
                username: "tamer".to_string(),
                password: "tamer".to_string(),
                access_level: 0,
            })
            .with_account(AccountRecord {
                id: 2,
                username: "rookie".to_string(),
                password: "rookie".to_string(),
                access_level: 0,
            })
            .with_advantages(default_advantages());

        for (account_id, avatar_id, name, x) in [(1, 100, "Tai", 0), (2, 200, "Matt", 500)] {
            store = store.with_avatar(AvatarRecord {
                id: avatar_id,
                account_id,
                name: name.to_string(),
                map: MapKey::world(1),
                x,
                y: 0,
                hp: 1_200,
                max_hp: 1_200,
                ds: 600,
                max_ds: 600,
                companion: Some(CompanionRecord {
                    id: avatar_id * 10,
                    species: 31001,
                    hp: 2_400,
                    max_hp: 2_400,
                    ds: 900,
                    max_ds: 900,
                    stats: companion_stats.clone(),
                }),
                buffs: Vec::new(),
            });
        }

        let goblimon = MobTemplate {
            id: 501,
            max_hp: 1_500,
            stats: CombatStats {
                level: 10,
                attack: 150,
                defense: 120,
                accuracy: 120,
                evasion: 40,
                critical_chance: 2.0,
                critical_damage: 3000.0,
                block: 3.0,
                attack_speed_ms: 2500,
                attribute: Attribute::Virus,
                element: Element::Wind,
                attribute_exp: 0,
                element_exp: 0,
            },
            respawn_secs: 15,
        };
        let ogremon = MobTemplate {
            id: 502,
            max_hp: 6_000,
            stats: CombatStats {
                level: 18,
                attack: 380,
                defense: 260,
                attribute: Attribute::Virus,
                element: Element::Land,
                ..goblimon.stats.clone()
            },
            respawn_secs: 60,
        };

        let spawns = vec![
            SpawnPoint {
                template: goblimon.clone(),
                x: 1_000,
                y: 0,
            },
            SpawnPoint {
                template: goblimon,
                x: 2_000,
                y: 1_500,
            },
            SpawnPoint {
                template: ogremon,
                x: 9_000,
                y: 9_000,
            },
        ];
        store
            .with_spawns(1, spawns)
            .with_spawns(2, Vec::new())
            .with_spawns(3, Vec::new())
            .with_spawns(4, Vec::new())
    }
}

/// The usual attribute triangle and element wheel.
pub fn default_advantages() -> AdvantageTable {
    AdvantageTable {
        attributes: vec![
            (Attribute::Vaccine, Attribute::Virus),
            (Attribute::Virus, Attribute::Data),
            (Attribute::Data, Attribute::Vaccine),
        ],
        elements: vec![
            (Element::Fire, Element::Wind),
            (Element::Wind, Element::Land),
            (Element::Land, Element::Water),
            (Element::Water, Element::Fire),
            (Element::Light, Element::Dark),
            (Element::Dark, Element::Light),
        ],
    }
}

impl Backend for MemoryStore {
    fn handle(&mut self, query: Query) -> Result<QueryResult, StoreError> {
        Ok(match query {
            Query::Authenticate { username, password } => QueryResult::Account(
                self.accounts
                    .get(&username)
                    .filter(|account| account.password == password)
                    .cloned(),
            ),
            Query::LoadAvatar {
                account_id,
                avatar_id,
            } => QueryResult::Avatar(
                self.avatars
                    .get(&avatar_id)
                    .filter(|avatar| avatar.account_id == account_id)
                    .cloned(),
            ),
            Query::SaveAvatar(avatar) => {
                self.avatars.insert(avatar.id, avatar);
                QueryResult::Done
            }
            Query::RecordAttendance {
                avatar_id, ticks, ..
            } => {
                *self.attendance.entry(avatar_id).or_insert(0) += ticks;
                QueryResult::Done
            }
            Query::IssueTicket { account_id, ticket } => {
                self.tickets.insert(account_id, ticket);
                QueryResult::Done
            }
            Query::RedeemTicket { account_id, ticket } => {
                let matches = self.tickets.get(&account_id) == Some(&ticket);
                if matches {
                    self.tickets.remove(&account_id);
                }
                QueryResult::Redeemed(matches)
            }
            Query::MapSpawns { map_id } => QueryResult::Spawns(self.spawns.get(&map_id).cloned()),
            Query::Advantages => QueryResult::Advantages(self.advantages.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Broken;

    impl Backend for Broken {
        fn handle(&mut self, _query: Query) -> Result<QueryResult, StoreError> {
            Err(StoreError::Unavailable("offline".to_string()))
        }
    }

    #[tokio::test]
    async fn test_authenticate() {
        let store = Store::spawn(MemoryStore::seeded());

        let account = store.authenticate("tamer", "tamer").await.unwrap();
        assert_eq!(account.map(|a| a.id), Some(1));

        assert!(store.authenticate("tamer", "wrong").await.unwrap().is_none());
        assert!(store.authenticate("nobody", "tamer").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_avatar_ownership() {
        let store = Store::spawn(MemoryStore::seeded());
        assert!(store.load_avatar(1, 100).await.unwrap().is_some());
        assert!(store.load_avatar(2, 100).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let store = Store::spawn(MemoryStore::seeded());
        let mut avatar = store.load_avatar(1, 100).await.unwrap().unwrap();
        avatar.x = 1234;
        store.notify(Query::SaveAvatar(avatar));

        let reloaded = store.load_avatar(1, 100).await.unwrap().unwrap();
        assert_eq!(reloaded.x, 1234);
    }

    #[tokio::test]
    async fn test_spawns_and_advantages() {
        let store = Store::spawn(MemoryStore::seeded());
        assert_eq!(store.map_spawns(1).await.unwrap().map(|s| s.len()), Some(3));
        assert_eq!(store.map_spawns(4).await.unwrap(), Some(Vec::new()));
        assert!(store.map_spawns(77).await.unwrap().is_none());
        assert_eq!(store.advantages().await.unwrap(), default_advantages());
    }

    #[tokio::test]
    async fn test_tickets_are_single_use() {
        let store = Store::spawn(MemoryStore::seeded());
        assert!(!store.redeem_ticket(1, 0).await.unwrap());

        store.issue_ticket(1, 0xBEEF).await.unwrap();
        assert!(!store.redeem_ticket(2, 0xBEEF).await.unwrap());
        assert!(!store.redeem_ticket(1, 0xBEEE).await.unwrap());
        assert!(store.redeem_ticket(1, 0xBEEF).await.unwrap());
        assert!(!store.redeem_ticket(1, 0xBEEF).await.unwrap());
    }

    #[tokio::test]
    async fn test_new_ticket_replaces_old() {
        let store = Store::spawn(MemoryStore::seeded());
        store.issue_ticket(1, 11).await.unwrap();
        store.issue_ticket(1, 12).await.unwrap();
        assert!(!store.redeem_ticket(1, 11).await.unwrap());
        assert!(store.redeem_ticket(1, 12).await.unwrap());
    }

    #[tokio::test]
    async fn test_backend_errors_reach_caller() {
        let store = Store::spawn(Broken);
        let err = store.authenticate("a", "b").await.unwrap_err();
        assert_eq!(err, StoreError::Unavailable("offline".to_string()));

        // Detached queries only log.
        store.notify(Query::Advantages);
    }

    #[test]
    fn test_attendance_accumulates() {
        let mut store = MemoryStore::new();
        for _ in 0..3 {
            store
                .handle(Query::RecordAttendance {
                    account_id: 1,
                    avatar_id: 100,
                    ticks: 120,
                })
                .unwrap();
        }
        assert_eq!(store.attendance(100), 360);
        assert_eq!(store.attendance(200), 0);
    }
}
