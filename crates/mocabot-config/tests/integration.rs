use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use mocabot_config::{MapStore, ReloadOutcome, StoreOptions};
use serde_json::{Value, json};

fn pair(store: &MapStore) -> (Value, Value) {
    let snapshot = store.snapshot();
    (
        snapshot.get("left").cloned().unwrap_or(Value::Null),
        snapshot.get("right").cloned().unwrap_or(Value::Null),
    )
}

#[test]
fn readers_never_observe_a_half_applied_document() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("system.json");
    fs::write(&path, r#"{"left": 0, "right": 0}"#)?;
    let store = Arc::new(MapStore::open(&path, StoreOptions::default())?);
    let done = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let store = Arc::clone(&store);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut observed = 0_u64;
                while !done.load(Ordering::Acquire) {
                    let (left, right) = pair(&store);
                    assert_eq!(left, right, "reader saw a torn document");
                    observed += 1;
                }
                observed
            })
        })
        .collect();

    for round in 1..=50_u64 {
        if round % 2 == 0 {
            store.update(|document| {
                document.insert("left".into(), json!(round));
                document.insert("right".into(), json!(round));
            })?;
        } else {
            fs::write(&path, format!(r#"{{"left": {round}, "right": {round}}}"#))?;
            store.reload()?;
        }
    }
    done.store(true, Ordering::Release);

    for reader in readers {
        let observed = reader
            .join()
            .map_err(|_| anyhow::anyhow!("reader thread panicked"))?;
        assert!(observed > 0);
    }
    assert_eq!(pair(&store), (json!(50), json!(50)));
    Ok(())
}

#[test]
fn malformed_edit_keeps_last_good_values_until_fixed() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("system.json");
    let store = MapStore::open(&path, StoreOptions::default())?;
    store.set("dos_detect", json!(5_000))?;

    fs::write(&path, "{\"dos_detect\": 12")?;
    assert!(store.reload().is_err());
    assert_eq!(store.get_as("dos_detect", 0_u64), 5_000);

    fs::write(&path, r#"{"dos_detect": 12}"#)?;
    let outcome = store.reload()?;
    assert!(matches!(outcome, ReloadOutcome::Applied(ref changes) if changes.len() == 1));
    assert_eq!(store.get_as("dos_detect", 0_u64), 12);
    Ok(())
}

#[tokio::test]
async fn reload_blocking_runs_off_the_async_thread() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("flags.json");
    let store = Arc::new(MapStore::open(&path, StoreOptions::default())?);
    fs::write(&path, r#"{"bot_reload": true}"#)?;

    let outcome = Arc::clone(&store).reload_blocking().await?;
    assert_eq!(outcome.changes().len(), 1);
    assert!(store.get_as("bot_reload", false));
    Ok(())
}
