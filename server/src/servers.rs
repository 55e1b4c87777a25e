//! The two hosts: account login with reconnect throttling, and the game
//! server that owns the world.

use crate::config::ThrottleConfig;
use crate::connection::Connection;
use crate::handlers::{account_handlers, game_handlers, AccountServices, GameServices};
use crate::network::{DisconnectReason, EventFuture, HostEvents};
use crate::router::{Router, RouterError};
use crate::store::{Query, Store};
use crate::throttle::{Admission, ConnectionThrottle};
use crate::world::World;
use log::{debug, info};
use shared::Frame;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

pub struct AccountServer {
    router: Router<AccountServices>,
    services: AccountServices,
    throttle: Mutex<ConnectionThrottle>,
}

impl AccountServer {
    pub fn new(store: Store, throttle: &ThrottleConfig) -> Result<Self, RouterError> {
        Ok(Self {
            router: Router::with_handlers(account_handlers())?,
            services: AccountServices { store },
            throttle: Mutex::new(ConnectionThrottle::from_config(throttle)),
        })
    }

    pub fn throttle(&self) -> MutexGuard<'_, ConnectionThrottle> {
        self.throttle.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Periodically drops expired throttle entries.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let server = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let lifted = server.throttle().sweep(Instant::now());
                if lifted > 0 {
                    debug!("Lifted {} reconnect blocks", lifted);
                }
            }
        })
    }
}

impl HostEvents for AccountServer {
    fn on_connect(&self, remote: SocketAddr) -> Admission {
        self.throttle().check(remote.ip(), Instant::now())
    }

    fn on_data_received<'a>(&'a self, conn: &'a Connection, frame: Frame) -> EventFuture<'a> {
        Box::pin(async move {
            self.router.dispatch(conn, &self.services, frame).await;
        })
    }

    fn on_disconnect<'a>(
        &'a self,
        conn: &'a Connection,
        reason: DisconnectReason,
    ) -> EventFuture<'a> {
        Box::pin(async move {
            debug!(
                "Account connection {} (account {:?}) gone: {}",
                conn.id,
                conn.account_id(),
                reason
            );
        })
    }
}

pub struct GameServer {
    router: Router<GameServices>,
    services: GameServices,
}

impl GameServer {
    pub fn new(store: Store, world: Arc<World>) -> Result<Self, RouterError> {
        Ok(Self {
            router: Router::with_handlers(game_handlers())?,
            services: GameServices { store, world },
        })
    }

    pub fn world(&self) -> &Arc<World> {
        &self.services.world
    }
}

impl HostEvents for GameServer {
    fn on_data_received<'a>(&'a self, conn: &'a Connection, frame: Frame) -> EventFuture<'a> {
        Box::pin(async move {
            self.router.dispatch(conn, &self.services, frame).await;
        })
    }

    /// Pulls the avatar out of its map, queues a save and frees the avatar
    /// for the next connection.
    fn on_disconnect<'a>(
        &'a self,
        conn: &'a Connection,
        reason: DisconnectReason,
    ) -> EventFuture<'a> {
        Box::pin(async move {
            let world = &self.services.world;
            let Some(binding) = conn.unbind_session() else {
                world.release_connection(conn.id);
                debug!("Game connection {} gone before entering: {}", conn.id, reason);
                return;
            };

            match world
                .leave_owned(binding.map, binding.avatar_id, &conn.outbound)
                .await
            {
                Some(session) => {
                    info!(
                        "Avatar {} left {} ({})",
                        binding.avatar_id, binding.map, reason
                    );
                    self.services
                        .store
                        .notify(Query::SaveAvatar(session.to_record(Instant::now())));
                }
                None => debug!(
                    "Avatar {} was already gone from {}",
                    binding.avatar_id, binding.map
                ),
            }
            world.release_connection(conn.id);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TickConfig;
    use crate::connection::{Outbound, SessionBinding};
    use crate::session::Session;
    use crate::store::MemoryStore;
    use crate::throttle::Rejection;
    use shared::MapKey;

    fn remote() -> SocketAddr {
        SocketAddr::from(([192, 168, 1, 20], 50_000))
    }

    #[tokio::test]
    async fn test_account_server_throttles_by_ip() {
        let store = Store::spawn(MemoryStore::seeded());
        let server = AccountServer::new(store, &ThrottleConfig::default()).unwrap();

        assert_eq!(server.on_connect(remote()), Admission::Accept);
        let other_port = SocketAddr::from(([192, 168, 1, 20], 50_001));
        assert_eq!(
            server.on_connect(other_port),
            Admission::Reject(Rejection::TooFast)
        );
        assert!(server.throttle().is_blocked(remote().ip(), Instant::now()));
    }

    #[tokio::test]
    async fn test_game_disconnect_saves_avatar() {
        let store = Store::spawn(MemoryStore::seeded());
        let world = World::load(store.clone(), TickConfig::default()).await.unwrap();
        let server = GameServer::new(store.clone(), Arc::clone(&world)).unwrap();

        let record = store.load_avatar(1, 100).await.unwrap().unwrap();
        let (outbound, _rx) = Outbound::channel();
        let mut session = Session::from_record(record, 0, outbound.clone(), Instant::now());
        session.x = 321;
        world.enter(session).await.unwrap();

        let conn = Connection::new(9, remote(), outbound, 0);
        conn.bind_account(1);
        conn.bind_session(SessionBinding {
            avatar_id: 100,
            map: MapKey::world(1),
        });

        server.on_disconnect(&conn, DisconnectReason::Closed).await;
        assert!(conn.session().is_none());
        let instance = world.get(MapKey::world(1)).await.unwrap();
        assert!(instance.lock().await.session(100).is_none());

        // The save is queued ahead of this load on the same store task.
        let saved = store.load_avatar(1, 100).await.unwrap().unwrap();
        assert_eq!(saved.x, 321);
        world.shutdown().await;
    }

    #[tokio::test]
    async fn test_game_disconnect_without_session() {
        let store = Store::spawn(MemoryStore::seeded());
        let world = World::load(store.clone(), TickConfig::default()).await.unwrap();
        let server = GameServer::new(store, world).unwrap();
        let (outbound, _rx) = Outbound::channel();
        let conn = Connection::new(3, remote(), outbound, 0);

        server.on_disconnect(&conn, DisconnectReason::BadFrame).await;
        assert_eq!(server.world().map_count().await, 0);
    }

    /// A connection that lost the avatar to another one must not pull the
    /// live session out when it closes.
    #[tokio::test]
    async fn test_stale_disconnect_keeps_live_session() {
        let store = Store::spawn(MemoryStore::seeded());
        let world = World::load(store.clone(), TickConfig::default()).await.unwrap();
        let server = GameServer::new(store.clone(), Arc::clone(&world)).unwrap();

        let record = store.load_avatar(1, 100).await.unwrap().unwrap();
        let (live_outbound, _live_rx) = Outbound::channel();
        world
            .enter(Session::from_record(record, 0, live_outbound, Instant::now()))
            .await
            .unwrap();
        assert!(world.claim(100, 4));

        let (stale_outbound, _stale_rx) = Outbound::channel();
        let stale = Connection::new(5, remote(), stale_outbound, 0);
        stale.bind_account(1);
        stale.bind_session(SessionBinding {
            avatar_id: 100,
            map: MapKey::world(1),
        });

        server.on_disconnect(&stale, DisconnectReason::Closed).await;
        let instance = world.get(MapKey::world(1)).await.unwrap();
        assert!(instance.lock().await.session(100).is_some());
        assert!(world.is_claimed(100));
        world.shutdown().await;
    }

    #[tokio::test]
    async fn test_game_disconnect_frees_claim() {
        let store = Store::spawn(MemoryStore::seeded());
        let world = World::load(store.clone(), TickConfig::default()).await.unwrap();
        let server = GameServer::new(store, Arc::clone(&world)).unwrap();
        let (outbound, _rx) = Outbound::channel();
        let conn = Connection::new(6, remote(), outbound, 0);
        assert!(world.claim(200, conn.id));

        server.on_disconnect(&conn, DisconnectReason::Closed).await;
        assert!(!world.is_claimed(200));
        assert!(world.claim(200, 7));
    }
}
