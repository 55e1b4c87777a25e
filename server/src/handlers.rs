//! Packet handlers for the account and game hosts.

use crate::connection::{Connection, SessionBinding};
use crate::router::{Handler, HandlerError, HandlerFuture};
use crate::session::Session;
use crate::store::Store;
use crate::world::World;
use log::{info, warn};
use rand::Rng;
use shared::packets::{
    AttackTarget, ChangeMap, EnterWorld, EnterWorldResult, Login, LoginCode, LoginResult, Move,
};
use shared::{types, Frame, MapKey, Payload};
use std::sync::Arc;
use std::time::Instant;

pub struct AccountServices {
    pub store: Store,
}

pub struct GameServices {
    pub store: Store,
    pub world: Arc<World>,
}

pub fn account_handlers() -> Vec<Box<dyn Handler<AccountServices>>> {
    vec![Box::new(LoginHandler)]
}

pub fn game_handlers() -> Vec<Box<dyn Handler<GameServices>>> {
    vec![
        Box::new(EnterWorldHandler),
        Box::new(MoveHandler),
        Box::new(AttackTargetHandler),
        Box::new(StopAttackHandler),
        Box::new(ChangeMapHandler),
    ]
}

struct LoginHandler;

impl Handler<AccountServices> for LoginHandler {
    fn packet_type(&self) -> u16 {
        types::LOGIN
    }

    fn handle<'a>(
        &'a self,
        conn: &'a Connection,
        services: &'a AccountServices,
        frame: Frame,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            let request = match Login::from_frame(&frame) {
                Ok(request) => request,
                Err(e) => {
                    conn.send(&LoginResult::rejected(LoginCode::Malformed))?;
                    return Err(e.into());
                }
            };

            if request.handshake != conn.handshake() {
                warn!(
                    "Stale handshake {:#06x} from {} (expected {:#06x})",
                    request.handshake,
                    conn.remote,
                    conn.handshake()
                );
                conn.send(&LoginResult::rejected(LoginCode::StaleHandshake))?;
                return Ok(());
            }

            let account = match services
                .store
                .authenticate(&request.username, &request.password)
                .await
            {
                Ok(account) => account,
                Err(e) => {
                    conn.send(&LoginResult::rejected(LoginCode::Unavailable))?;
                    return Err(e.into());
                }
            };

            match account {
                Some(account) => {
                    let ticket = rand::thread_rng().gen_range(1..=u32::MAX);
                    if let Err(e) = services.store.issue_ticket(account.id, ticket).await {
                        conn.send(&LoginResult::rejected(LoginCode::Unavailable))?;
                        return Err(e.into());
                    }
                    conn.bind_account(account.id);
                    conn.send(&LoginResult {
                        code: LoginCode::Ok,
                        account_id: account.id,
                        access_level: account.access_level,
                        ticket,
                    })?;
                    info!("Account {} logged in from {}", account.id, conn.remote);
                }
                None => {
                    info!(
                        "Rejected credentials for '{}' from {}",
                        request.username, conn.remote
                    );
                    conn.send(&LoginResult::rejected(LoginCode::InvalidCredentials))?;
                }
            }
            Ok(())
        })
    }
}

fn binding(conn: &Connection) -> Result<SessionBinding, HandlerError> {
    conn.session().ok_or(HandlerError::NoSession)
}

struct EnterWorldHandler;

fn refuse_entry(conn: &Connection) -> Result<(), HandlerError> {
    conn.send(&EnterWorldResult {
        accepted: false,
        map: MapKey::world(0),
        x: 0,
        y: 0,
    })?;
    Ok(())
}

impl Handler<GameServices> for EnterWorldHandler {
    fn packet_type(&self) -> u16 {
        types::ENTER_WORLD
    }

    /// Redeems the login ticket, loads the avatar and puts it on its map.
    /// An avatar already played from another connection is refused.
    fn handle<'a>(
        &'a self,
        conn: &'a Connection,
        services: &'a GameServices,
        frame: Frame,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            let request = EnterWorld::from_frame(&frame)?;
            if conn.session().is_some() {
                return Err(HandlerError::Rejected("already in the world".to_string()));
            }

            if !services
                .store
                .redeem_ticket(request.account_id, request.ticket)
                .await?
            {
                warn!(
                    "Invalid ticket for account {} from {}",
                    request.account_id, conn.remote
                );
                refuse_entry(conn)?;
                return Err(HandlerError::NotAuthenticated);
            }

            let Some(record) = services
                .store
                .load_avatar(request.account_id, request.avatar_id)
                .await?
            else {
                refuse_entry(conn)?;
                return Err(HandlerError::Rejected(format!(
                    "account {} has no avatar {}",
                    request.account_id, request.avatar_id
                )));
            };

            let avatar_id = record.id;
            if !services.world.claim(avatar_id, conn.id) {
                refuse_entry(conn)?;
                return Err(HandlerError::Rejected(format!(
                    "avatar {} is already in the world",
                    avatar_id
                )));
            }

            let map = record.map;
            if let Err(e) = services.world.instance(map).await {
                services.world.release(avatar_id, conn.id);
                refuse_entry(conn)?;
                return Err(e.into());
            }
            conn.bind_account(record.account_id);
            conn.send(&EnterWorldResult {
                accepted: true,
                map,
                x: record.x,
                y: record.y,
            })?;

            let session = Session::from_record(record, 0, conn.outbound.clone(), Instant::now());
            if let Err(e) = services.world.enter(session).await {
                services.world.release(avatar_id, conn.id);
                return Err(e.into());
            }
            conn.bind_session(SessionBinding { avatar_id, map });
            info!("Avatar {} entered {} from {}", avatar_id, map, conn.remote);
            Ok(())
        })
    }
}

struct MoveHandler;

impl Handler<GameServices> for MoveHandler {
    fn packet_type(&self) -> u16 {
        types::MOVE
    }

    fn handle<'a>(
        &'a self,
        conn: &'a Connection,
        services: &'a GameServices,
        frame: Frame,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            let request = Move::from_frame(&frame)?;
            let binding = binding(conn)?;
            let instance = services
                .world
                .get(binding.map)
                .await
                .ok_or(HandlerError::NoSession)?;
            if !instance
                .lock()
                .await
                .move_avatar(binding.avatar_id, request.x, request.y)
            {
                return Err(HandlerError::NoSession);
            }
            Ok(())
        })
    }
}

struct AttackTargetHandler;

impl Handler<GameServices> for AttackTargetHandler {
    fn packet_type(&self) -> u16 {
        types::ATTACK_TARGET
    }

    fn handle<'a>(
        &'a self,
        conn: &'a Connection,
        services: &'a GameServices,
        frame: Frame,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            let request = AttackTarget::from_frame(&frame)?;
            let binding = binding(conn)?;
            let instance = services
                .world
                .get(binding.map)
                .await
                .ok_or(HandlerError::NoSession)?;
            let engaged = instance
                .lock()
                .await
                .engage(binding.avatar_id, request.mob_id);
            engaged.map_err(|e| {
                HandlerError::Rejected(format!("cannot attack mob {}: {}", request.mob_id, e))
            })
        })
    }
}

struct StopAttackHandler;

impl Handler<GameServices> for StopAttackHandler {
    fn packet_type(&self) -> u16 {
        types::STOP_ATTACK
    }

    fn handle<'a>(
        &'a self,
        conn: &'a Connection,
        services: &'a GameServices,
        _frame: Frame,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            let binding = binding(conn)?;
            if let Some(instance) = services.world.get(binding.map).await {
                instance.lock().await.disengage(binding.avatar_id);
            }
            Ok(())
        })
    }
}

struct ChangeMapHandler;

impl Handler<GameServices> for ChangeMapHandler {
    fn packet_type(&self) -> u16 {
        types::CHANGE_MAP
    }

    fn handle<'a>(
        &'a self,
        conn: &'a Connection,
        services: &'a GameServices,
        frame: Frame,
    ) -> HandlerFuture<'a> {
        Box::pin(async move {
            let request = ChangeMap::from_frame(&frame)?;
            let binding = binding(conn)?;
            if request.map == binding.map {
                return Err(HandlerError::Rejected(format!(
                    "already on {}",
                    request.map
                )));
            }

            let moved = services
                .world
                .transfer(
                    binding.map,
                    binding.avatar_id,
                    request.map,
                    (request.x, request.y),
                )
                .await?;
            if !moved {
                return Err(HandlerError::NoSession);
            }

            conn.bind_session(SessionBinding {
                avatar_id: binding.avatar_id,
                map: request.map,
            });
            conn.send(&EnterWorldResult {
                accepted: true,
                map: request.map,
                x: request.x,
                y: request.y,
            })?;
            Ok(())
        })
    }
}
