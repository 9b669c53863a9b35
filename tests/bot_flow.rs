//! Telegram conversation flows against a wiremock Bot API.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use wiremock::matchers::{method, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

use arxiv_notifier::bot::session::{FlowState, SessionManager};
use arxiv_notifier::bot::{BotSettings, TelegramBot};
use arxiv_notifier::config::TelegramConfig;
use arxiv_notifier::pipeline::PollPipeline;
use arxiv_notifier::schedule::Schedule;
use arxiv_notifier::services::telegram::{TelegramClient, Update};
use arxiv_notifier::services::transport::Transports;
use arxiv_notifier::store::operations::subscribers::{Platform, Recipient};
use arxiv_notifier::store::Store;
use common::app::{pipeline_settings, test_config};
use common::fakes::{fresh_paper, FakeIndex, RecordingTransport};

const CHAT: i64 = 4242;

struct BotHarness {
    server: MockServer,
    bot: Arc<TelegramBot>,
    store: Arc<Store>,
    index: Arc<FakeIndex>,
    delivered: Arc<RecordingTransport>,
    _dir: tempfile::TempDir,
}

async fn harness(session_timeout: Duration) -> BotHarness {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path_regex(r"/sendMessage$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": true,
            "result": {"message_id": 100, "chat": {"id": CHAT}}
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path_regex(r"/editMessageText$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": true,
            "result": {"message_id": 100, "chat": {"id": CHAT}}
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path_regex(r"/(deleteMessage|answerCallbackQuery)$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true, "result": true})))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir.path().join("bot.sled").to_string_lossy());
    let store = Arc::new(Store::open(&config.sled_path).unwrap());
    store.run_migrations().unwrap();

    let index = Arc::new(FakeIndex::new());
    let delivered = Arc::new(RecordingTransport::new(Platform::Telegram));
    let pipeline = Arc::new(PollPipeline::new(
        store.clone(),
        index.clone(),
        None,
        Transports::new().with(delivered.clone()),
        pipeline_settings(&config),
    ));

    let client = TelegramClient::new(&TelegramConfig {
        enabled: true,
        token: "1:TEST".to_string(),
        api_url: server.uri(),
        poll_timeout_secs: 0,
    });
    let bot = Arc::new(TelegramBot::new(
        client,
        store.clone(),
        pipeline,
        SessionManager::new(session_timeout),
        BotSettings {
            fetch_interval_hours: 6,
            max_results_cap: 20,
        },
    ));

    BotHarness {
        server,
        bot,
        store,
        index,
        delivered,
        _dir: dir,
    }
}

fn text(update_id: i64, text: &str) -> Update {
    serde_json::from_value(json!({
        "update_id": update_id,
        "message": {
            "message_id": update_id,
            "chat": {"id": CHAT},
            "from": {"id": CHAT, "first_name": "Ada"},
            "text": text
        }
    }))
    .unwrap()
}

fn callback(update_id: i64, data: &str) -> Update {
    serde_json::from_value(json!({
        "update_id": update_id,
        "callback_query": {
            "id": format!("cb-{update_id}"),
            "from": {"id": CHAT, "first_name": "Ada"},
            "message": {"message_id": 100, "chat": {"id": CHAT}},
            "data": data
        }
    }))
    .unwrap()
}

/// Texts of every `method` call received so far.
async fn sent_texts(server: &MockServer, api_method: &str) -> Vec<String> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|r| r.url.path().ends_with(api_method))
        .filter_map(|r| serde_json::from_slice::<Value>(&r.body).ok())
        .filter_map(|v| v["text"].as_str().map(str::to_string))
        .collect()
}

fn queries(store: &Store) -> Vec<(String, u32)> {
    store
        .get_subscriber(&Recipient::telegram(CHAT))
        .unwrap()
        .map(|s| {
            s.search_queries
                .into_iter()
                .map(|q| (q.query, q.max_results))
                .collect()
        })
        .unwrap_or_default()
}

#[tokio::test]
async fn add_query_conversation() {
    let h = harness(Duration::from_secs(180)).await;

    h.bot.handle_update(text(1, "/set_keywords")).await;
    assert_eq!(h.bot.sessions().len().await, 1);

    h.bot.handle_update(text(2, "cat:cs.CV")).await;
    h.bot.handle_update(text(3, "abc")).await;
    h.bot.handle_update(text(4, "50")).await;
    h.bot.handle_update(text(5, "5")).await;

    assert_eq!(queries(&h.store), vec![("cat:cs.CV".to_string(), 5)]);
    assert!(h.bot.sessions().is_empty().await);

    let texts = sent_texts(&h.server, "sendMessage").await;
    assert!(texts[0].contains("您还没有设置任何检索式"));
    assert!(texts.iter().any(|t| t == "请输入有效的数字。"));
    assert!(texts.iter().any(|t| t == "请输入1-20之间的数字。"));
    assert!(texts.last().unwrap().contains("添加成功"));
}

#[tokio::test]
async fn delete_query_via_keyboard() {
    let h = harness(Duration::from_secs(180)).await;
    let r = Recipient::telegram(CHAT);
    h.store.add_search_query(&r, "a", 1, 20).unwrap();
    h.store.add_search_query(&r, "b", 2, 20).unwrap();

    h.bot.handle_update(text(1, "/set_keywords")).await;
    h.bot.handle_update(callback(2, "delete_query")).await;
    let session = h.bot.sessions().touch(CHAT).await.unwrap();
    assert_eq!(session.state, FlowState::DeletingQuery);

    h.bot.handle_update(text(3, "9")).await;
    assert_eq!(queries(&h.store).len(), 2);

    h.bot.handle_update(text(4, "1")).await;
    assert_eq!(queries(&h.store), vec![("b".to_string(), 2)]);

    let texts = sent_texts(&h.server, "sendMessage").await;
    assert!(texts.iter().any(|t| t == "编号无效。"));
    assert!(texts.iter().any(|t| t == "🗑 已删除：a"));
    let edits = sent_texts(&h.server, "editMessageText").await;
    assert!(edits[0].starts_with("请输入要删除的编号"));
}

#[tokio::test]
async fn cancel_and_stale_buttons() {
    let h = harness(Duration::from_secs(180)).await;
    h.store
        .add_search_query(&Recipient::telegram(CHAT), "a", 1, 20)
        .unwrap();

    h.bot.handle_update(text(1, "/set_keywords")).await;
    h.bot.handle_update(callback(2, "cancel")).await;
    assert!(h.bot.sessions().is_empty().await);

    // 会话结束后的按钮不再生效
    h.bot.handle_update(callback(3, "add_query")).await;
    assert!(h.bot.sessions().is_empty().await);
    assert_eq!(sent_texts(&h.server, "editMessageText").await, vec!["操作已取消。"]);

    h.bot.handle_update(text(4, "/cancel")).await;
    let texts = sent_texts(&h.server, "sendMessage").await;
    assert_eq!(texts.last().unwrap(), "当前没有进行中的操作。");
}

#[tokio::test]
async fn text_outside_conversation_is_ignored() {
    let h = harness(Duration::from_secs(180)).await;
    h.bot.handle_update(text(1, "hello there")).await;
    h.bot.handle_update(text(2, "/unknown_command")).await;
    assert!(sent_texts(&h.server, "sendMessage").await.is_empty());
}

#[tokio::test]
async fn idle_sessions_expire_with_notice() {
    let h = harness(Duration::from_millis(10)).await;
    h.bot.handle_update(text(1, "/set_keywords")).await;

    let expired = h
        .bot
        .expire_sessions(Instant::now() + Duration::from_secs(1))
        .await;
    assert_eq!(expired, 1);
    assert!(h.bot.sessions().is_empty().await);

    let texts = sent_texts(&h.server, "sendMessage").await;
    assert_eq!(texts.last().unwrap(), "⚠️ 操作超时，已自动取消。");
    let deletes = h
        .server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|r| r.url.path().ends_with("deleteMessage"))
        .count();
    assert_eq!(deletes, 1);

    // 超时后输入的文本不再进入流程
    h.bot.handle_update(text(2, "cat:cs.CV")).await;
    assert!(queries(&h.store).is_empty());
}

#[tokio::test]
async fn prefs_and_schedule_commands() {
    let h = harness(Duration::from_secs(180)).await;

    h.bot.handle_update(text(1, "/prefs tags off")).await;
    h.bot.handle_update(text(2, "/schedule daily 07:45")).await;
    h.bot.handle_update(text(3, "/schedule sometimes")).await;

    let sub = h
        .store
        .get_subscriber(&Recipient::telegram(CHAT))
        .unwrap()
        .unwrap();
    assert!(!sub.preferences.show_tags);
    assert!(sub.preferences.show_summary);
    assert_eq!(sub.schedule, Some(Schedule::Daily { hour: 7, minute: 45 }));

    let texts = sent_texts(&h.server, "sendMessage").await;
    assert_eq!(texts[0], "✅ 已更新：tags = off");
    assert!(texts[1].contains("daily 07:45"));
    assert!(texts[2].starts_with("用法：/schedule"));
}

#[tokio::test]
async fn fetch_now_reports_progress_and_delivers() {
    let h = harness(Duration::from_secs(180)).await;
    h.index.set("cat:cs.CV", vec![fresh_paper("2406.00001v1")]);
    h.store
        .add_search_query(&Recipient::telegram(CHAT), "cat:cs.CV", 5, 20)
        .unwrap();

    h.bot.fetch_now(CHAT).await.unwrap();

    assert_eq!(
        h.delivered.sent(),
        vec![(CHAT.to_string(), "2406.00001v1".to_string())]
    );
    let texts = sent_texts(&h.server, "sendMessage").await;
    assert!(texts[0].contains("您一共有以下检索式"));
    assert!(texts[1].contains("正在根据检索式"));
    assert_eq!(texts[2], "该检索式的论文已全部发送。");
    assert!(h
        .store
        .get_subscriber(&Recipient::telegram(CHAT))
        .unwrap()
        .unwrap()
        .last_check
        .is_some());
}

#[tokio::test]
async fn fetch_now_without_queries_asks_for_them() {
    let h = harness(Duration::from_secs(180)).await;
    h.bot.fetch_now(CHAT).await.unwrap();
    assert_eq!(
        sent_texts(&h.server, "sendMessage").await,
        vec!["您没有设置检索式，请设置检索式。"]
    );
    assert_eq!(h.index.calls(), 0);
}
