use std::collections::HashSet;

use sluice_core::checkpoint::{CheckpointPolicy, CheckpointStore};
use sluice_core::traits::CheckpointBackend;
use sluice_db::CheckpointRepository;

use crate::integration::common::setup_test_db;

fn ids(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn save_and_load_scope() {
    let (pool, _container) = setup_test_db().await;
    let repo = CheckpointRepository::new(pool);

    repo.save("chess", "players_games", &ids(&["p1", "p2"]))
        .await
        .unwrap();

    let loaded = repo.load("chess", "players_games").await.unwrap();
    let expected: HashSet<String> = ids(&["p1", "p2"]).into_iter().collect();
    assert_eq!(loaded, expected);
}

#[tokio::test]
async fn save_is_idempotent() {
    let (pool, _container) = setup_test_db().await;
    let repo = CheckpointRepository::new(pool);

    repo.save("chess", "players_games", &ids(&["p1"])).await.unwrap();
    repo.save("chess", "players_games", &ids(&["p1", "p2"]))
        .await
        .unwrap();
    repo.save("chess", "players_games", &[]).await.unwrap();

    assert_eq!(repo.load("chess", "players_games").await.unwrap().len(), 2);
}

#[tokio::test]
async fn scopes_are_isolated() {
    let (pool, _container) = setup_test_db().await;
    let repo = CheckpointRepository::new(pool);

    repo.save("chess", "players_games", &ids(&["p1"])).await.unwrap();
    repo.save("other", "players_games", &ids(&["p2"])).await.unwrap();
    repo.save("chess", "players_archives", &ids(&["p3"]))
        .await
        .unwrap();

    let games = repo.load("chess", "players_games").await.unwrap();
    assert_eq!(games.len(), 1);
    assert!(games.contains("p1"));
    assert!(repo.load("missing", "players_games").await.unwrap().is_empty());
}

#[tokio::test]
async fn reset_removes_only_one_scope() {
    let (pool, _container) = setup_test_db().await;
    let repo = CheckpointRepository::new(pool);

    repo.save("chess", "players_games", &ids(&["p1", "p2"]))
        .await
        .unwrap();
    repo.save("chess", "players_archives", &ids(&["p3"]))
        .await
        .unwrap();

    let removed = repo.reset("chess", "players_games").await.unwrap();
    assert_eq!(removed, 2);
    assert!(repo.load("chess", "players_games").await.unwrap().is_empty());
    assert_eq!(repo.load("chess", "players_archives").await.unwrap().len(), 1);
}

#[tokio::test]
async fn scopes_summarize_pipeline() {
    let (pool, _container) = setup_test_db().await;
    let repo = CheckpointRepository::new(pool);

    repo.save("chess", "players_games", &ids(&["p1", "p2"]))
        .await
        .unwrap();
    repo.save("chess", "players_archives", &ids(&["p3"]))
        .await
        .unwrap();
    repo.save("other", "players_games", &ids(&["p4"])).await.unwrap();

    let scopes = repo.scopes("chess").await.unwrap();
    assert_eq!(scopes.len(), 2);
    assert_eq!(scopes[0].resource, "players_archives");
    assert_eq!(scopes[0].entries, 1);
    assert_eq!(scopes[1].resource, "players_games");
    assert_eq!(scopes[1].entries, 2);
    assert!(scopes.iter().all(|s| s.pipeline == "chess"));
    assert!(scopes.iter().all(|s| s.last_updated.is_some()));
}

#[tokio::test]
async fn store_resumes_from_repository() {
    let (pool, _container) = setup_test_db().await;
    let repo = CheckpointRepository::new(pool);

    let mut store = CheckpointStore::new(repo.clone(), "chess", CheckpointPolicy::CommitOnYield);
    store.load("players_games").await.unwrap();
    store.mark_processed("players_games", "p1");
    store.mark_processed("players_games", "p2");
    store.commit("players_games", "p1");
    assert_eq!(store.flush("players_games").await.unwrap(), 1);

    let mut restarted = CheckpointStore::new(repo, "chess", CheckpointPolicy::CommitOnYield);
    assert_eq!(restarted.load("players_games").await.unwrap(), 1);
    assert!(restarted.has("players_games", "p1"));
    assert!(!restarted.has("players_games", "p2"));
}
