//! Integration tests for the account and game hosts
//!
//! These tests start real listeners on ephemeral ports and drive them with the
//! headless client over TCP.

use client::bot::{self, BotConfig};
use client::network::GameClient;
use server::app::{self, Running};
use server::config::{HostConfig, ServerConfig};
use server::store::{MemoryStore, Store};
use server::utils::token_from_secs;
use shared::packets::{
    AttackTarget, AvatarAppear, EnterWorld, EnterWorldResult, HandshakeAck, Login, LoginCode,
    MobAppear, Move,
};
use shared::{checksum, types, Frame, Payload, THROTTLE_NOTICE};
use std::time::Duration;
use tokio::time::sleep;

const WAIT: Duration = Duration::from_secs(5);

fn test_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.account = HostConfig::new("127.0.0.1", 0);
    config.game = HostConfig::new("127.0.0.1", 0);
    config.tick.interval_ms = 20;
    config.capture_dir = None;
    // Most tests reconnect from 127.0.0.1 several times.
    config.throttle.min_interval_secs = 0;
    config
}

async fn start(config: ServerConfig) -> Running {
    let store = Store::spawn(MemoryStore::seeded());
    app::start(&config, store).await.expect("servers start")
}

/// Logs in on the account host and returns the account id and entry ticket.
async fn login(running: &Running, username: &str) -> (u32, u32) {
    let mut account = GameClient::connect(running.account_addr).await.unwrap();
    let result = account.login(username, username).await.unwrap();
    assert_eq!(result.code, LoginCode::Ok);
    (result.account_id, result.ticket)
}

async fn request_entry(
    running: &Running,
    account_id: u32,
    avatar_id: u32,
    ticket: u32,
) -> (GameClient, EnterWorldResult) {
    let mut game = GameClient::connect(running.game_addr).await.unwrap();
    game.send(&EnterWorld {
        account_id,
        avatar_id,
        ticket,
    })
    .await
    .unwrap();
    let result: EnterWorldResult = game.expect(WAIT).await.unwrap();
    (game, result)
}

async fn enter_world(running: &Running, username: &str, avatar_id: u32) -> GameClient {
    let (account_id, ticket) = login(running, username).await;
    let (game, result) = request_entry(running, account_id, avatar_id, ticket).await;
    assert!(result.accepted, "avatar {} should be accepted", avatar_id);
    game
}

/// ACCOUNT HOST TESTS
mod account_tests {
    use super::*;

    /// A literal handshake frame gets a fresh token back.
    #[tokio::test]
    async fn handshake_frame_round_trip() {
        let running = start(test_config()).await;
        let mut client = GameClient::connect(running.account_addr).await.unwrap();

        let check = (10u16 ^ 6716).to_le_bytes();
        assert_eq!(checksum(10), u16::from_le_bytes(check));
        client
            .send_raw(&[10, 0, 1, 0, 0xAA, 0xBB, 0xCC, 0xDD, check[0], check[1]])
            .await
            .unwrap();

        let ack: HandshakeAck = client.expect(WAIT).await.unwrap();
        assert_eq!(ack.token, token_from_secs(u64::from(ack.server_time)));
        running.shutdown().await;
    }

    #[tokio::test]
    async fn login_with_valid_credentials() {
        let running = start(test_config()).await;
        let mut client = GameClient::connect(running.account_addr).await.unwrap();

        let result = client.login("tamer", "tamer").await.unwrap();
        assert_eq!(result.code, LoginCode::Ok);
        assert_eq!(result.account_id, 1);
        running.shutdown().await;
    }

    /// A rejected login leaves the connection usable.
    #[tokio::test]
    async fn login_with_bad_password() {
        let running = start(test_config()).await;
        let mut client = GameClient::connect(running.account_addr).await.unwrap();

        let result = client.login("tamer", "wrong").await.unwrap();
        assert_eq!(result.code, LoginCode::InvalidCredentials);
        assert_eq!(result.account_id, 0);

        let retry = client.login("tamer", "tamer").await.unwrap();
        assert_eq!(retry.code, LoginCode::Ok);
        running.shutdown().await;
    }

    #[tokio::test]
    async fn login_with_stale_handshake() {
        let running = start(test_config()).await;
        let mut client = GameClient::connect(running.account_addr).await.unwrap();
        let token = client.handshake().await.unwrap();

        client
            .send(&Login {
                handshake: token.wrapping_add(1),
                username: "tamer".to_string(),
                password: "tamer".to_string(),
            })
            .await
            .unwrap();
        let result: shared::packets::LoginResult = client.expect(WAIT).await.unwrap();
        assert_eq!(result.code, LoginCode::StaleHandshake);
        running.shutdown().await;
    }

    #[tokio::test]
    async fn login_with_malformed_payload() {
        let running = start(test_config()).await;
        let mut client = GameClient::connect(running.account_addr).await.unwrap();
        client.handshake().await.unwrap();

        let garbage = Frame::encode(types::LOGIN, &[1, 2]).unwrap();
        client.send_raw(&garbage).await.unwrap();
        let result: shared::packets::LoginResult = client.expect(WAIT).await.unwrap();
        assert_eq!(result.code, LoginCode::Malformed);
        running.shutdown().await;
    }

    /// Reconnecting inside the minimum interval earns the plaintext notice.
    #[tokio::test]
    async fn fast_reconnect_is_throttled() {
        let mut config = test_config();
        config.throttle.min_interval_secs = 20;
        let running = start(config).await;

        let mut first = GameClient::connect(running.account_addr).await.unwrap();
        let login = first.login("tamer", "tamer").await.unwrap();
        assert_eq!(login.code, LoginCode::Ok);

        let mut second = GameClient::connect(running.account_addr).await.unwrap();
        assert_eq!(second.read_notice(WAIT).await.unwrap(), THROTTLE_NOTICE);

        // Still blocked, and the game host is unaffected.
        let mut third = GameClient::connect(running.account_addr).await.unwrap();
        assert_eq!(third.read_notice(WAIT).await.unwrap(), THROTTLE_NOTICE);
        let (_game, result) = request_entry(&running, 1, 100, login.ticket).await;
        assert!(result.accepted);
        running.shutdown().await;
    }

    #[tokio::test]
    async fn bad_checksum_disconnects() {
        let running = start(test_config()).await;
        let mut client = GameClient::connect(running.account_addr).await.unwrap();
        client.handshake().await.unwrap();

        let mut corrupt = Login {
            handshake: 0,
            username: "tamer".to_string(),
            password: "tamer".to_string(),
        }
        .to_frame()
        .unwrap();
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0xFF;
        client.send_raw(&corrupt).await.unwrap();

        assert!(client.wait_closed(WAIT).await);
        running.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_type_is_ignored() {
        let running = start(test_config()).await;
        let mut client = GameClient::connect(running.account_addr).await.unwrap();

        let unknown = Frame::encode(0x4A4A, &[1, 2, 3]).unwrap();
        client.send_raw(&unknown).await.unwrap();
        client.keep_alive().await.unwrap();
        assert_eq!(
            client.login("rookie", "rookie").await.unwrap().account_id,
            2
        );
        running.shutdown().await;
    }
}

/// GAME HOST TESTS
mod game_tests {
    use super::*;

    #[tokio::test]
    async fn unknown_avatar_is_refused() {
        let running = start(test_config()).await;
        let (account_id, ticket) = login(&running, "rookie").await;

        let (_game, result) = request_entry(&running, account_id, 100, ticket).await;
        assert!(!result.accepted);
        running.shutdown().await;
    }

    /// Entry needs the ticket from a real login on the account host.
    #[tokio::test]
    async fn entry_without_login_is_refused() {
        let running = start(test_config()).await;

        let (_game, result) = request_entry(&running, 1, 100, 0xDEAD_BEEF).await;
        assert!(!result.accepted);

        let (account_id, ticket) = login(&running, "tamer").await;
        let (_game, result) = request_entry(&running, account_id, 100, ticket).await;
        assert!(result.accepted);
        running.shutdown().await;
    }

    /// A second connection cannot take over an avatar that is in the world.
    #[tokio::test]
    async fn avatar_in_use_is_refused() {
        let running = start(test_config()).await;
        let mut first = enter_world(&running, "tamer", 100).await;

        let (account_id, ticket) = login(&running, "tamer").await;
        let (_second, result) = request_entry(&running, account_id, 100, ticket).await;
        assert!(!result.accepted);

        first.send(&Move { x: 30, y: 0 }).await.unwrap();
        first.keep_alive().await.unwrap();
        assert!(!first.wait_closed(Duration::from_millis(200)).await);
        running.shutdown().await;
    }

    /// A handler error is logged and the connection carries on.
    #[tokio::test]
    async fn handler_error_keeps_connection() {
        let running = start(test_config()).await;
        let (account_id, ticket) = login(&running, "tamer").await;
        let mut game = GameClient::connect(running.game_addr).await.unwrap();

        game.send(&Move { x: 5, y: 5 }).await.unwrap();
        game.send(&AttackTarget { mob_id: 1 }).await.unwrap();
        game.send(&EnterWorld {
            account_id,
            avatar_id: 100,
            ticket,
        })
        .await
        .unwrap();
        let result: EnterWorldResult = game.expect(WAIT).await.unwrap();
        assert!(result.accepted);
        running.shutdown().await;
    }

    #[tokio::test]
    async fn nearby_mob_appears_and_fights_back() {
        let running = start(test_config()).await;
        let mut game = enter_world(&running, "tamer", 100).await;

        let mob: MobAppear = game.expect(WAIT).await.unwrap();
        assert_eq!(mob.template_id, 501);
        game.send(&AttackTarget { mob_id: mob.mob_id })
            .await
            .unwrap();

        let combat = tokio::time::timeout(WAIT, async {
            loop {
                let frame = game.recv_frame().await.unwrap();
                if matches!(
                    frame.packet_type,
                    types::DAMAGE | types::ATTACK_MISS | types::KILL
                ) {
                    return frame.packet_type;
                }
            }
        })
        .await;
        assert!(combat.is_ok(), "no combat event after engaging");
        running.shutdown().await;
    }

    #[tokio::test]
    async fn avatars_see_each_other() {
        let running = start(test_config()).await;
        let mut tai = enter_world(&running, "tamer", 100).await;
        let _matt = enter_world(&running, "rookie", 200).await;

        let seen: AvatarAppear = tai.expect(WAIT).await.unwrap();
        assert_eq!(seen.avatar_id, 200);
        assert_eq!(seen.name, "Matt");
        running.shutdown().await;
    }

    /// Leaving saves the position for the next visit.
    #[tokio::test]
    async fn disconnect_saves_position() {
        let running = start(test_config()).await;
        let mut game = enter_world(&running, "tamer", 100).await;
        game.send(&Move { x: 700, y: 50 }).await.unwrap();
        sleep(Duration::from_millis(100)).await;
        drop(game);
        sleep(Duration::from_millis(300)).await;

        let (account_id, ticket) = login(&running, "tamer").await;
        let (_again, result) = request_entry(&running, account_id, 100, ticket).await;
        assert!(result.accepted);
        assert_eq!((result.x, result.y), (700, 50));
        running.shutdown().await;
    }
}

/// END-TO-END TESTS
mod bot_tests {
    use super::*;

    #[tokio::test]
    async fn bot_logs_in_and_fights() {
        let running = start(test_config()).await;
        let config = BotConfig {
            account_addr: running.account_addr.to_string(),
            game_addr: running.game_addr.to_string(),
            username: "tamer".to_string(),
            password: "tamer".to_string(),
            avatar_id: 100,
            run_for: Duration::from_secs(2),
            fake_ping_ms: 0,
        };

        let report = bot::run(&config).await.unwrap();
        assert_eq!(report.account_id, 1);
        assert!(report.mobs_seen >= 1);
        assert!(report.hits + report.misses + report.kills > 0);
        running.shutdown().await;
    }

    #[tokio::test]
    async fn bot_with_wrong_password_stops() {
        let running = start(test_config()).await;
        let config = BotConfig {
            account_addr: running.account_addr.to_string(),
            game_addr: running.game_addr.to_string(),
            username: "tamer".to_string(),
            password: "nope".to_string(),
            avatar_id: 100,
            run_for: Duration::from_secs(1),
            fake_ping_ms: 0,
        };

        match bot::run(&config).await {
            Err(bot::BotError::LoginRejected(code)) => {
                assert_eq!(code, LoginCode::InvalidCredentials)
            }
            other => panic!("expected a login rejection, got {:?}", other),
        }
        running.shutdown().await;
    }
}
