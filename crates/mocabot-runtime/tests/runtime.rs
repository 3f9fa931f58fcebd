use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use mocabot_config::defaults::{BOT_RELOAD_FLAG, DOS_DETECT_KEY};
use mocabot_data::BotDatabase;
use mocabot_events::{FlagChange, FlagHandler};
use mocabot_runtime::{
    DOS_DETECT_TASK, DialogueRequest, Runtime, RuntimeError, STORE_RELOAD_TASK, StudyRequest,
    THROTTLE_PURGE_TASK,
};
use mocabot_telemetry::SecurityLevel;
use mocabot_test_support::fixtures::{Doubles, TestTree};
use serde_json::{Value, json};

async fn start(tree: &TestTree, doubles: &Doubles) -> Result<Arc<Runtime>> {
    Ok(Runtime::initialize(doubles.deps(tree)?).await?)
}

fn ask(remote_addr: &str, bot: &str, message: &str) -> DialogueRequest {
    DialogueRequest {
        remote_addr: remote_addr.to_string(),
        bot: bot.to_string(),
        message: message.to_string(),
        client_id: None,
    }
}

#[tokio::test]
async fn initialize_loads_bots_and_seeds_reload_flag() -> Result<()> {
    let tree = TestTree::new()?;
    let doubles = Doubles::default();
    tree.create_bot_dir("moca")?;

    let runtime = start(&tree, &doubles).await?;

    assert_eq!(runtime.bot_names(), vec!["moca".to_string()]);
    assert_eq!(runtime.get_flag(BOT_RELOAD_FLAG), Value::Bool(false));
    assert_eq!(runtime.flags().handler_ids(BOT_RELOAD_FLAG).len(), 1);
    assert_eq!(runtime.metrics().snapshot().registry_rebuilds_total, 1);
    Ok(())
}

#[tokio::test]
async fn initialize_fails_when_database_is_down() -> Result<()> {
    let tree = TestTree::new()?;
    let doubles = Doubles::default();
    tree.create_bot_dir("moca")?;
    doubles.database.set_fail_fetch(true);

    let result = Runtime::initialize(doubles.deps(&tree)?).await;
    assert!(matches!(result, Err(RuntimeError::Data { .. })));
    Ok(())
}

#[tokio::test]
async fn dialogue_answers_and_logs_the_exchange() -> Result<()> {
    let tree = TestTree::new()?;
    let doubles = Doubles::default();
    tree.create_bot_dir("moca")?;
    let runtime = start(&tree, &doubles).await?;

    let mut request = ask("10.0.0.1", "moca", "hello");
    request.client_id = Some("client-7".to_string());
    let reply = runtime.dialogue(request).await?;
    assert_eq!(reply.content, "moca: hello");

    let logs = runtime.chat_logs("moca").await?;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].remote_addr, "10.0.0.1");
    assert_eq!(logs[0].message, "hello");
    assert_eq!(logs[0].reply, "moca: hello");
    assert_eq!(logs[0].client_id.as_deref(), Some("client-7"));
    assert_eq!(runtime.metrics().snapshot().dialogue_requests_total, 1);
    assert_eq!(runtime.dos_tally().count("10.0.0.1"), 1);
    Ok(())
}

#[tokio::test]
async fn dialogue_refusals_carry_their_reason() -> Result<()> {
    let tree = TestTree::new()?;
    let doubles = Doubles::default();
    tree.create_bot_dir("moca")?;
    let runtime = start(&tree, &doubles).await?;

    let unknown = runtime.dialogue(ask("10.0.0.1", "ghost", "hi")).await;
    assert!(matches!(unknown, Err(ref err) if err.is_not_found()));

    let too_long = runtime
        .dialogue(ask("10.0.0.1", "moca", &"x".repeat(513)))
        .await;
    assert!(matches!(
        too_long,
        Err(RuntimeError::InvalidInput {
            field: "message",
            reason: "too_long",
            ..
        })
    ));

    let mut long_client = ask("10.0.0.1", "moca", "hi");
    long_client.client_id = Some("c".repeat(65));
    assert!(matches!(
        runtime.dialogue(long_client).await,
        Err(RuntimeError::InvalidInput {
            field: "client_id",
            ..
        })
    ));

    runtime.blacklist_ip("10.0.0.9")?;
    assert!(matches!(
        runtime.dialogue(ask("10.0.0.9", "moca", "hi")).await,
        Err(RuntimeError::Forbidden { ref remote_addr }) if remote_addr == "10.0.0.9"
    ));

    runtime.set_maintenance(true)?;
    assert!(matches!(
        runtime.dialogue(ask("10.0.0.1", "moca", "hi")).await,
        Err(RuntimeError::Maintenance)
    ));
    runtime.set_maintenance(false)?;
    assert!(runtime.dialogue(ask("10.0.0.1", "moca", "hi")).await.is_ok());
    assert_eq!(doubles.database.chats().len(), 1);
    Ok(())
}

#[tokio::test]
async fn dialogue_throttles_each_client_independently() -> Result<()> {
    let mut tree = TestTree::new()?;
    tree.settings_mut().dialogue_limit.limit = 2;
    let doubles = Doubles::default();
    tree.create_bot_dir("moca")?;
    let runtime = start(&tree, &doubles).await?;

    runtime.dialogue(ask("10.0.0.1", "moca", "one")).await?;
    runtime.dialogue(ask("10.0.0.1", "moca", "two")).await?;
    let third = runtime.dialogue(ask("10.0.0.1", "moca", "three")).await;
    assert!(matches!(
        third,
        Err(RuntimeError::RateLimited {
            count: 3,
            limit: 2,
            ..
        })
    ));
    runtime.dialogue(ask("10.0.0.2", "moca", "other")).await?;

    assert_eq!(runtime.metrics().snapshot().rate_limit_throttled_total, 1);
    assert_eq!(doubles.database.chats().len(), 3);
    Ok(())
}

#[tokio::test]
async fn create_bot_publishes_directory_row_and_engine() -> Result<()> {
    let tree = TestTree::new()?;
    let doubles = Doubles::default();
    let runtime = start(&tree, &doubles).await?;

    let id = runtime.create_bot("latte").await?;
    assert!(tree.settings().bot_dir("latte").is_dir());
    assert_eq!(runtime.registry().lookup_id("latte"), Some(id));
    assert_eq!(runtime.bot_names(), vec!["latte".to_string()]);
    assert_eq!(runtime.get_flag(BOT_RELOAD_FLAG), Value::Bool(true));
    assert!(
        doubles
            .security
            .entries()
            .iter()
            .any(|(message, level)| message.contains("latte") && *level == SecurityLevel::Info)
    );

    assert!(matches!(
        runtime.create_bot("latte").await,
        Err(RuntimeError::BotExists { .. })
    ));
    assert!(matches!(
        runtime.create_bot("no way").await,
        Err(RuntimeError::InvalidInput { field: "name", .. })
    ));
    Ok(())
}

#[tokio::test]
async fn create_bot_rejects_names_that_already_have_a_row() -> Result<()> {
    let tree = TestTree::new()?;
    let doubles = Doubles::default();
    let runtime = start(&tree, &doubles).await?;
    doubles.database.insert_bot("ghost").await?;

    assert!(matches!(
        runtime.create_bot("ghost").await,
        Err(RuntimeError::BotExists { .. })
    ));
    assert!(!tree.settings().bot_dir("ghost").exists());

    doubles.database.set_fail_insert(true);
    assert!(matches!(
        runtime.create_bot("mocha").await,
        Err(RuntimeError::Data { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn study_feeds_engine_saves_and_records_rows() -> Result<()> {
    let tree = TestTree::new()?;
    let doubles = Doubles::default();
    tree.create_bot_dir("moca")?;
    let runtime = start(&tree, &doubles).await?;
    let engine = doubles
        .factory
        .engine("moca")
        .ok_or_else(|| anyhow::anyhow!("engine was not opened"))?;

    let studied = runtime
        .study(StudyRequest {
            bot: "moca".to_string(),
            messages: vec!["hi".to_string(), "x".repeat(600), "how are you".to_string()],
        })
        .await?;

    assert_eq!(studied, 2);
    assert_eq!(engine.studied(), vec!["hi".to_string(), "how are you".to_string()]);
    assert_eq!(engine.saves(), 1);
    let dictionary = runtime.bot_dictionary("moca").await?;
    let messages: Vec<&str> = dictionary.iter().map(|row| row.message.as_str()).collect();
    assert_eq!(messages, vec!["hi", "how are you"]);
    assert_eq!(runtime.get_flag(BOT_RELOAD_FLAG), Value::Bool(true));

    assert!(matches!(
        runtime
            .study(StudyRequest {
                bot: "moca".to_string(),
                messages: Vec::new(),
            })
            .await,
        Err(RuntimeError::InvalidInput {
            field: "messages",
            ..
        })
    ));
    assert!(matches!(
        runtime.bot_dictionary("ghost").await,
        Err(RuntimeError::UnknownBot { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn reload_flag_written_by_another_process_rebuilds_registry() -> Result<()> {
    let tree = TestTree::new()?;
    let doubles = Doubles::default();
    tree.create_bot_dir("moca")?;
    let runtime = start(&tree, &doubles).await?;

    tree.create_bot_dir("latte")?;
    tree.write_json(&tree.settings().flags_file(), &json!({ "bot_reload": true }))?;
    runtime.flags().reload().await?;

    assert_eq!(
        runtime.bot_names(),
        vec!["latte".to_string(), "moca".to_string()]
    );
    assert_eq!(runtime.metrics().snapshot().registry_rebuilds_total, 2);
    Ok(())
}

#[tokio::test]
async fn anomaly_sweep_blacklists_flooding_clients() -> Result<()> {
    let tree = TestTree::new()?;
    let doubles = Doubles::default();
    tree.create_bot_dir("moca")?;
    let runtime = start(&tree, &doubles).await?;
    runtime.set_config(DOS_DETECT_KEY, json!(3))?;

    for _ in 0..4 {
        runtime.record_request("203.0.113.5");
    }
    runtime.record_request("203.0.113.6");

    let sweep = runtime.sweep_anomalies().await?;
    assert_eq!(sweep.inspected, 2);
    assert_eq!(sweep.blacklisted, vec!["203.0.113.5".to_string()]);
    assert!(runtime.is_blacklisted("203.0.113.5"));
    assert!(runtime.dos_tally().is_empty());
    assert!(
        doubles
            .security
            .entries()
            .iter()
            .any(|(message, level)| message.contains("203.0.113.5")
                && *level == SecurityLevel::Warning)
    );
    assert!(matches!(
        runtime.dialogue(ask("203.0.113.5", "moca", "hi")).await,
        Err(RuntimeError::Forbidden { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn blacklist_and_api_keys_are_operator_managed() -> Result<()> {
    let tree = TestTree::new()?;
    tree.write_json(&tree.settings().api_keys_file(), &json!(["key-1"]))?;
    let doubles = Doubles::default();
    let runtime = start(&tree, &doubles).await?;

    assert!(runtime.is_api_key_allowed("key-1"));
    assert!(!runtime.is_api_key_allowed("key-2"));
    assert!(!runtime.is_api_key_allowed(""));

    assert!(runtime.blacklist_ip("198.51.100.1")?);
    assert!(!runtime.blacklist_ip("198.51.100.1")?);
    assert_eq!(runtime.blacklist(), vec!["198.51.100.1".to_string()]);
    assert!(runtime.unblacklist_ip("198.51.100.1")?);
    assert!(!runtime.unblacklist_ip("198.51.100.1")?);
    assert!(runtime.blacklist().is_empty());
    Ok(())
}

struct Refuse;

#[async_trait]
impl FlagHandler for Refuse {
    async fn on_change(&self, _change: &FlagChange) -> anyhow::Result<()> {
        Err(anyhow::anyhow!("refused"))
    }
}

#[tokio::test]
async fn set_flag_counts_handler_failures_under_the_flag() -> Result<()> {
    let tree = TestTree::new()?;
    let doubles = Doubles::default();
    let runtime = start(&tree, &doubles).await?;
    runtime
        .flags()
        .add_handler("refuse", "greeting_enabled", Arc::new(Refuse));

    let report = runtime.set_flag("greeting_enabled", json!(true)).await?;
    assert_eq!(report.invoked, 1);
    assert_eq!(report.failed, 1);
    let unchanged = runtime.set_flag("greeting_enabled", json!(true)).await?;
    assert_eq!(unchanged.invoked, 0);

    let rendered = runtime.render_metrics()?;
    assert!(rendered.contains("flag_handler_failures_total{flag=\"greeting_enabled\"} 1"));
    assert_eq!(runtime.get_flag("greeting_enabled"), json!(true));
    Ok(())
}

#[tokio::test]
async fn config_values_fall_back_to_defaults() -> Result<()> {
    let tree = TestTree::new()?;
    let doubles = Doubles::default();
    let runtime = start(&tree, &doubles).await?;

    assert_eq!(runtime.config_get("greeting", "hello".to_string()), "hello");
    runtime.set_config("greeting", json!("bonjour"))?;
    assert_eq!(runtime.config_get("greeting", "hello".to_string()), "bonjour");
    assert!(!runtime.in_maintenance());
    assert!(runtime.render_metrics()?.contains("dialogue_requests_total"));
    Ok(())
}

#[tokio::test]
async fn background_tasks_start_and_stop() -> Result<()> {
    let tree = TestTree::new()?;
    let doubles = Doubles::default();
    let runtime = start(&tree, &doubles).await?;

    let scheduler = runtime.start_background();
    let names: Vec<&str> = scheduler.tasks().iter().map(|task| task.name()).collect();
    assert_eq!(
        names,
        vec![STORE_RELOAD_TASK, DOS_DETECT_TASK, THROTTLE_PURGE_TASK]
    );
    scheduler.shutdown().await;
    Ok(())
}
