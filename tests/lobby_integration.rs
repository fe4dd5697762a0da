//! Integration tests for the lobby, the roster and the open-games directory.

#[macro_use]
mod common;

use common::*;
use std::sync::Arc;
use sudoku_sync::{
    Difficulty, FeedItem, GameStatus, LobbyEvent, LobbySession, LocalHub, MemoryStore, Store,
};
use tokio::time::{Duration, timeout};

async fn wait_for(lobby: &LobbySession, wanted: LobbyEvent) {
    timeout(Duration::from_secs(2), async {
        while let Some(event) = lobby.recv().await {
            if event == wanted {
                return;
            }
        }
        panic!("lobby events ended");
    })
    .await
    .expect("event not seen in time");
}

#[tokio::test]
async fn test_auto_start_when_everyone_is_ready() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let hub = LocalHub::new();
    let alice = context(store.clone(), &hub, "alice", config());
    let bob = context(store.clone(), &hub, "bob", config());

    let game = alice
        .create_game(Difficulty::Easy, PUZZLE, SOLUTION)
        .await
        .unwrap();
    let host_lobby = LobbySession::open(&alice, &game.id).await.unwrap();

    bob.join_game(&game.id).await.unwrap();
    let guest_lobby = LobbySession::open(&bob, &game.id).await.unwrap();
    eventually!(host_lobby.roster().await.len() == 2);

    // one ready player is not enough
    assert!(host_lobby.toggle_ready().await.unwrap());
    eventually!(guest_lobby.is_ready("alice").await);
    assert_eq!(
        store.get_game(&game.id).await.unwrap().unwrap().status,
        GameStatus::Lobby
    );

    assert!(guest_lobby.toggle_ready().await.unwrap());
    wait_for(&host_lobby, LobbyEvent::GameStarted).await;
    wait_for(&guest_lobby, LobbyEvent::GameStarted).await;

    let stored = store.get_game(&game.id).await.unwrap().unwrap();
    assert_eq!(stored.status, GameStatus::Active);
    assert!(stored.started_at.is_some());

    // readiness churn after the start changes nothing
    assert!(!guest_lobby.toggle_ready().await.unwrap());
    assert!(guest_lobby.toggle_ready().await.unwrap());
    assert!(host_lobby.is_started().await);

    host_lobby.close().await.unwrap();
    guest_lobby.close().await.unwrap();
}

#[tokio::test]
async fn test_closing_retracts_readiness() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let hub = LocalHub::new();
    let alice = context(store.clone(), &hub, "alice", config());
    let bob = context(store.clone(), &hub, "bob", config());

    let game = alice
        .create_game(Difficulty::Easy, PUZZLE, SOLUTION)
        .await
        .unwrap();
    bob.join_game(&game.id).await.unwrap();
    let host_lobby = LobbySession::open(&alice, &game.id).await.unwrap();
    let guest_lobby = LobbySession::open(&bob, &game.id).await.unwrap();

    guest_lobby.toggle_ready().await.unwrap();
    eventually!(host_lobby.is_ready("bob").await);

    // presence goes with the connection, the roster entry stays
    guest_lobby.close().await.unwrap();
    eventually!(!host_lobby.ready().await.contains_key("bob"));
    assert_eq!(host_lobby.roster().await.len(), 2);

    host_lobby.close().await.unwrap();
}

#[tokio::test]
async fn test_leaving_updates_roster_and_collects_game() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let hub = LocalHub::new();
    let alice = context(store.clone(), &hub, "alice", config());
    let bob = context(store.clone(), &hub, "bob", config());

    let game = alice
        .create_game(Difficulty::Easy, PUZZLE, SOLUTION)
        .await
        .unwrap();
    bob.join_game(&game.id).await.unwrap();
    let host_lobby = LobbySession::open(&alice, &game.id).await.unwrap();
    let guest_lobby = LobbySession::open(&bob, &game.id).await.unwrap();

    guest_lobby.leave().await.unwrap();
    eventually!(host_lobby.roster().await.len() == 1);
    assert!(store.get_game(&game.id).await.unwrap().is_some());

    let watcher = context(store.clone(), &hub, "carol", config());
    let (_, mut feed) = watcher.watch_roster(&game.id).await.unwrap();

    host_lobby.leave().await.unwrap();
    assert!(store.get_game(&game.id).await.unwrap().is_none());
    let change = timeout(Duration::from_secs(1), feed.next())
        .await
        .unwrap()
        .and_then(FeedItem::into_change)
        .unwrap();
    assert_eq!(change.kind, sudoku_sync::ChangeKind::Delete);
}

#[tokio::test]
async fn test_open_games_directory() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let hub = LocalHub::new();
    let alice = context(store.clone(), &hub, "alice", config());
    let viewer = context(store.clone(), &hub, "viewer", config());

    let first = alice
        .create_game(Difficulty::Easy, PUZZLE, SOLUTION)
        .await
        .unwrap();
    alice.start_game(&first.id).await.unwrap();

    let (mut open, mut feed) = viewer.watch_open_games().await.unwrap();
    assert_eq!(open.len(), 1);

    // lobby games stay out until they start
    let second = alice
        .create_game(Difficulty::Hard, PUZZLE, SOLUTION)
        .await
        .unwrap();
    let item = feed.next().await.unwrap();
    assert!(!open.update(&viewer, item).await.unwrap());

    tokio::time::sleep(Duration::from_millis(5)).await;
    alice.start_game(&second.id).await.unwrap();
    while open.get(&second.id).is_none() {
        let item = timeout(Duration::from_secs(1), feed.next())
            .await
            .unwrap()
            .unwrap();
        open.update(&viewer, item).await.unwrap();
    }
    assert_eq!(open.games()[0].id, second.id);

    // finishing drops it from the list
    let solved = sudoku_sync::Grid::parse(SOLUTION).unwrap();
    alice.finish_game(&first.id, &solved).await.unwrap();
    while open.get(&first.id).is_some() {
        let item = timeout(Duration::from_secs(1), feed.next())
            .await
            .unwrap()
            .unwrap();
        open.update(&viewer, item).await.unwrap();
    }
    assert_eq!(open.len(), 1);
    assert_eq!(viewer.list_open_games().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_failed_start_waits_for_readiness_change() {
    let flaky = FlakyStore::default();
    let store: Arc<dyn Store> = Arc::new(flaky.clone());
    let hub = LocalHub::new();
    let alice = context(store.clone(), &hub, "alice", config());
    let bob = context(store.clone(), &hub, "bob", config());

    let game = alice
        .create_game(Difficulty::Easy, PUZZLE, SOLUTION)
        .await
        .unwrap();
    bob.join_game(&game.id).await.unwrap();
    let host_lobby = LobbySession::open(&alice, &game.id).await.unwrap();
    let guest_lobby = LobbySession::open(&bob, &game.id).await.unwrap();
    eventually!(host_lobby.roster().await.len() == 2);

    flaky.set_fail_transitions(true);
    host_lobby.toggle_ready().await.unwrap();
    guest_lobby.toggle_ready().await.unwrap();
    eventually!(matches!(host_lobby.try_recv().await, Some(LobbyEvent::StartFailed(_))));

    // nothing changes, so nothing retries
    tokio::time::sleep(Duration::from_millis(50)).await;
    let settled = flaky.transition_attempts();
    assert!(settled <= 4);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(flaky.transition_attempts(), settled);
    assert_eq!(
        store.get_game(&game.id).await.unwrap().unwrap().status,
        GameStatus::Lobby
    );

    // a readiness change is the next trigger
    flaky.set_fail_transitions(false);
    assert!(!guest_lobby.toggle_ready().await.unwrap());
    assert!(guest_lobby.toggle_ready().await.unwrap());
    wait_for(&host_lobby, LobbyEvent::GameStarted).await;
    assert_eq!(
        store.get_game(&game.id).await.unwrap().unwrap().status,
        GameStatus::Active
    );

    host_lobby.close().await.unwrap();
    guest_lobby.close().await.unwrap();
}

#[tokio::test]
async fn test_open_games_reload_after_lag() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::with_feed_capacity(2));
    let hub = LocalHub::new();
    let alice = context(store.clone(), &hub, "alice", config());
    let viewer = context(store.clone(), &hub, "viewer", config());

    let (mut open, mut feed) = viewer.watch_open_games().await.unwrap();
    assert!(open.is_empty());

    let mut ids = Vec::new();
    for _ in 0..3 {
        let game = alice
            .create_game(Difficulty::Easy, PUZZLE, SOLUTION)
            .await
            .unwrap();
        alice.start_game(&game.id).await.unwrap();
        ids.push(game.id);
    }

    let item = feed.next().await.unwrap();
    assert!(matches!(item, FeedItem::Lagged(_)));
    assert!(open.update(&viewer, item).await.unwrap());
    assert_eq!(open.len(), 3);
    for id in &ids {
        assert!(open.get(id).is_some());
    }
}
