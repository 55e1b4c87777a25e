//! The set of live map instances, each ticking on its own task.

use crate::combat::AdvantageTable;
use crate::config::TickConfig;
use crate::connection::Outbound;
use crate::map::MapState;
use crate::session::Session;
use crate::store::{Query, Store, StoreError};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use shared::{MapKey, MapKind};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorldError {
    /// Static content has no such map.
    UnknownMap(MapKey),
    Store(StoreError),
}

impl fmt::Display for WorldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorldError::UnknownMap(key) => write!(f, "no map content for {}", key),
            WorldError::Store(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for WorldError {}

impl From<StoreError> for WorldError {
    fn from(e: StoreError) -> Self {
        WorldError::Store(e)
    }
}

pub struct MapInstance {
    pub key: MapKey,
    state: Mutex<MapState>,
    ticker: std::sync::Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl MapInstance {
    pub async fn lock(&self) -> MutexGuard<'_, MapState> {
        self.state.lock().await
    }

    /// Set once the instance has been evicted; nothing may join it after.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn stop(&self) {
        let handle = self
            .ticker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

pub struct World {
    maps: Mutex<HashMap<MapKey, Arc<MapInstance>>>,
    /// Avatar id to the game connection that owns it.
    claims: std::sync::Mutex<HashMap<u32, u32>>,
    store: Store,
    config: TickConfig,
    advantages: AdvantageTable,
}

impl World {
    /// Fetches the static tables every map needs.
    pub async fn load(store: Store, config: TickConfig) -> Result<Arc<Self>, StoreError> {
        let advantages = store.advantages().await?;
        Ok(Arc::new(Self {
            maps: Mutex::new(HashMap::new()),
            claims: std::sync::Mutex::new(HashMap::new()),
            store,
            config,
            advantages,
        }))
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Returns the instance for `key`, opening it on first use. The registry
    /// lock is not held while static content is fetched.
    pub async fn instance(&self, key: MapKey) -> Result<Arc<MapInstance>, WorldError> {
        if let Some(instance) = self.get(key).await {
            return Ok(instance);
        }

        let spawns = self
            .store
            .map_spawns(key.map_id)
            .await?
            .ok_or(WorldError::UnknownMap(key))?;

        let mut maps = self.maps.lock().await;
        let instance = match maps.entry(key) {
            Entry::Occupied(opened) => return Ok(Arc::clone(opened.get())),
            Entry::Vacant(slot) => {
                let mut state =
                    MapState::new(key, self.advantages.clone(), StdRng::from_entropy());
                state.spawn_mobs(&spawns);
                let instance = Arc::new(MapInstance {
                    key,
                    state: Mutex::new(state),
                    ticker: std::sync::Mutex::new(None),
                    closed: AtomicBool::new(false),
                });
                slot.insert(Arc::clone(&instance));
                instance
            }
        };

        let handle = tokio::spawn(run_map_ticks(
            Arc::clone(&instance),
            self.store.clone(),
            self.config.clone(),
        ));
        *instance.ticker.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        info!("Map {} opened with {} mobs", key, spawns.len());
        Ok(instance)
    }

    pub async fn get(&self, key: MapKey) -> Option<Arc<MapInstance>> {
        self.maps.lock().await.get(&key).cloned()
    }

    pub async fn map_count(&self) -> usize {
        self.maps.lock().await.len()
    }

    /// Reserves an avatar for one connection. False while another
    /// connection holds it.
    pub fn claim(&self, avatar_id: u32, connection_id: u32) -> bool {
        let mut claims = self.claims.lock().unwrap_or_else(|e| e.into_inner());
        match claims.entry(avatar_id) {
            Entry::Occupied(held) => *held.get() == connection_id,
            Entry::Vacant(slot) => {
                slot.insert(connection_id);
                true
            }
        }
    }

    /// Drops the claim if `connection_id` holds it.
    pub fn release(&self, avatar_id: u32, connection_id: u32) {
        let mut claims = self.claims.lock().unwrap_or_else(|e| e.into_inner());
        if claims.get(&avatar_id) == Some(&connection_id) {
            claims.remove(&avatar_id);
        }
    }

    /// Drops every claim held by a connection that went away.
    pub fn release_connection(&self, connection_id: u32) {
        self.claims
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, holder| *holder != connection_id);
    }

    pub fn is_claimed(&self, avatar_id: u32) -> bool {
        self.claims
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&avatar_id)
    }

    /// Places a session on the map its record names.
    pub async fn enter(&self, session: Session) -> Result<(), WorldError> {
        let key = session.map;
        self.place(key, session).await.map_err(|(e, _)| e)
    }

    /// Inserts into the live instance for `key`, reopening it if it was
    /// evicted in between. Hands the session back on failure.
    async fn place(&self, key: MapKey, session: Session) -> Result<(), (WorldError, Session)> {
        loop {
            let instance = match self.instance(key).await {
                Ok(instance) => instance,
                Err(e) => return Err((e, session)),
            };
            let mut state = instance.lock().await;
            if instance.is_closed() {
                continue;
            }
            let avatar_id = session.avatar_id;
            if state.insert_session(session).is_some() {
                warn!("Avatar {} replaced an older session on {}", avatar_id, key);
            }
            return Ok(());
        }
    }

    pub async fn leave(&self, key: MapKey, avatar_id: u32) -> Option<Session> {
        let instance = self.get(key).await?;
        let session = instance.lock().await.leave(avatar_id);
        self.evict_if_idle(&instance).await;
        session
    }

    /// Like `leave`, but only when the session still belongs to `owner`.
    pub async fn leave_owned(
        &self,
        key: MapKey,
        avatar_id: u32,
        owner: &Outbound,
    ) -> Option<Session> {
        let instance = self.get(key).await?;
        let session = instance.lock().await.leave_owned(avatar_id, owner);
        self.evict_if_idle(&instance).await;
        session
    }

    /// Closes an empty instance that is not a world map and stops its tick.
    async fn evict_if_idle(&self, instance: &Arc<MapInstance>) {
        if instance.key.kind == MapKind::World {
            return;
        }
        let mut maps = self.maps.lock().await;
        let state = instance.lock().await;
        if !state.is_empty() || instance.is_closed() {
            return;
        }
        instance.closed.store(true, Ordering::Release);
        drop(state);

        if maps
            .get(&instance.key)
            .map_or(false, |current| Arc::ptr_eq(current, instance))
        {
            maps.remove(&instance.key);
        }
        instance.stop();
        info!("Map {} closed", instance.key);
    }

    /// Moves an avatar to another map. Only one map lock is held at a time.
    /// Returns false when the avatar was not on `from`.
    pub async fn transfer(
        &self,
        from: MapKey,
        avatar_id: u32,
        to: MapKey,
        position: (i32, i32),
    ) -> Result<bool, WorldError> {
        self.instance(to).await?;
        let Some(mut session) = self.leave(from, avatar_id).await else {
            return Ok(false);
        };
        let back = session.position();
        session.x = position.0;
        session.y = position.1;

        if let Err((e, mut session)) = self.place(to, session).await {
            session.x = back.0;
            session.y = back.1;
            if let Err((_, lost)) = self.place(from, session).await {
                warn!("Avatar {} dropped while moving to {}", lost.avatar_id, to);
            }
            return Err(e);
        }
        debug!("Avatar {} moved from {} to {}", avatar_id, from, to);
        Ok(true)
    }

    /// Stops every tick task.
    pub async fn shutdown(&self) {
        let maps = self.maps.lock().await;
        for instance in maps.values() {
            instance.stop();
        }
    }
}

async fn run_map_ticks(instance: Arc<MapInstance>, store: Store, config: TickConfig) {
    let mut ticker = interval(config.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;

        let report = {
            let mut state = instance.lock().await;
            let report = state.run_tick(Instant::now(), &config);
            if state.tick() % 120 == 0 && !state.is_empty() {
                debug!(
                    "Map {} tick {}: {} avatars, {} attacks, {} kills",
                    instance.key,
                    state.tick(),
                    state.len(),
                    report.attacks,
                    report.kills
                );
            }
            report
        };

        for e in &report.errors {
            warn!("Tick error on {}: {}", instance.key, e);
        }
        for attendance in report.attendance {
            store.notify(Query::RecordAttendance {
                account_id: attendance.account_id,
                avatar_id: attendance.avatar_id,
                ticks: attendance.ticks,
            });
        }
    }
}
