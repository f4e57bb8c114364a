use bytes::Bytes;
use jasperdb::config::Config;
use jasperdb::core::commands::dispatch;
use jasperdb::core::persistence::aof::{self, AofWriterTask, AppendFsync};
use jasperdb::core::protocol::RespFrame;
use jasperdb::core::state::{ServerState, generate_run_id};
use std::sync::Arc;
use tokio::sync::broadcast;

fn command(args: &[&str]) -> RespFrame {
    RespFrame::command(args.iter().map(|s| Bytes::from(s.to_string())))
}

fn fresh_state() -> Arc<jasperdb::core::state::ServerState> {
    let mut config = Config::default();
    config.persistence.aof_enabled = false;
    ServerState::new(config, None, None, generate_run_id())
}

async fn append_commands(path: &str, policy: AppendFsync, commands: &[&[&str]]) {
    let (task, handle) = AofWriterTask::open(path, policy).await.unwrap();
    let (shutdown_tx, _) = broadcast::channel(1);
    let writer = tokio::spawn(task.run(shutdown_tx.subscribe()));

    for args in commands {
        handle.append(command(args)).await.unwrap();
    }

    shutdown_tx.send(()).unwrap();
    writer.await.unwrap();
}

#[tokio::test]
async fn test_replay_restores_dataset() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.aof");
    let path = path.to_str().unwrap();

    append_commands(
        path,
        AppendFsync::Always,
        &[&["SET", "a", "1"], &["SET", "b", "2"], &["DEL", "a"]],
    )
    .await;

    let state = fresh_state();
    let replay_state = state.clone();
    let applied = aof::replay(path, async |args| {
        dispatch::execute_parsed(&replay_state, &args).map(|_| ())
    })
    .await
    .unwrap();
    assert_eq!(applied, 3);

    // GET a returns the null bulk, GET b returns "2".
    let get_a = dispatch::execute_parsed(
        &state,
        &[Bytes::from_static(b"GET"), Bytes::from_static(b"a")],
    )
    .unwrap();
    assert_eq!(get_a, RespFrame::Null);

    let get_b = dispatch::execute_parsed(
        &state,
        &[Bytes::from_static(b"GET"), Bytes::from_static(b"b")],
    )
    .unwrap();
    assert_eq!(get_b, RespFrame::BulkString(Bytes::from_static(b"2")));
}

#[tokio::test]
async fn test_always_policy_is_durable_without_clean_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("crash.aof");
    let path = path.to_str().unwrap();

    let (task, handle) = AofWriterTask::open(path, AppendFsync::Always).await.unwrap();
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let writer = tokio::spawn(task.run(shutdown_tx.subscribe()));

    handle.append(command(&["SET", "a", "1"])).await.unwrap();
    handle.append(command(&["SET", "b", "2"])).await.unwrap();

    // Simulate a crash: abort the writer with no drain or final sync. Every
    // acked append must already be on disk.
    writer.abort();
    let _ = writer.await;

    let data = std::fs::read(path).unwrap();
    let expected_tail = command(&["SET", "b", "2"]).encode_to_vec().unwrap();
    assert!(
        data.ends_with(&expected_tail),
        "acked write missing from AOF after simulated crash"
    );
}

#[tokio::test]
async fn test_replay_skips_failing_commands_and_continues() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mixed.aof");
    let path = path.to_str().unwrap();

    append_commands(
        path,
        AppendFsync::No,
        &[
            &["SET", "good", "1"],
            &["NOSUCHCOMMAND", "x"],
            &["SET", "alsogood", "2"],
        ],
    )
    .await;

    let state = fresh_state();
    let replay_state = state.clone();
    let applied = aof::replay(path, async |args| {
        dispatch::execute_parsed(&replay_state, &args).map(|_| ())
    })
    .await
    .unwrap();

    // The unknown command is logged and skipped; replay carries on.
    assert_eq!(applied, 2);
    assert!(state.db.exists(&Bytes::from_static(b"good")));
    assert!(state.db.exists(&Bytes::from_static(b"alsogood")));
}

#[tokio::test]
async fn test_replay_tolerates_truncated_tail() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("torn.aof");
    let path_str = path.to_str().unwrap();

    append_commands(path_str, AppendFsync::Always, &[&["SET", "k", "v"]]).await;

    // Append half of a command, as a torn final write would leave behind.
    let mut data = std::fs::read(&path).unwrap();
    data.extend_from_slice(b"*3\r\n$3\r\nSET\r\n$1");
    std::fs::write(&path, data).unwrap();

    let state = fresh_state();
    let replay_state = state.clone();
    let applied = aof::replay(path_str, async |args| {
        dispatch::execute_parsed(&replay_state, &args).map(|_| ())
    })
    .await
    .unwrap();
    assert_eq!(applied, 1);
    assert!(state.db.exists(&Bytes::from_static(b"k")));
}

#[tokio::test]
async fn test_replay_missing_file_is_empty() {
    let applied = aof::replay("/nonexistent/nothing.aof", async |_args| Ok(()))
        .await
        .unwrap();
    assert_eq!(applied, 0);
}
