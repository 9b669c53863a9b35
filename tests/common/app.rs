use std::sync::Arc;

use axum::Router;
use tempfile::TempDir;
use tokio::sync::broadcast;

use arxiv_notifier::config::{
    ArxivConfig, Config, LLMConfig, MatrixConfig, TelegramConfig, WorkerConfig,
};
use arxiv_notifier::pipeline::{PipelineSettings, PollPipeline};
use arxiv_notifier::routes::build_router;
use arxiv_notifier::services::transport::Transports;
use arxiv_notifier::state::AppState;
use arxiv_notifier::store::operations::subscribers::Platform;
use arxiv_notifier::store::Store;

use super::fakes::{FakeIndex, RecordingTransport};

pub const ADMIN_TOKEN: &str = "integration-admin-token";

pub struct TestApp {
    pub app: Router,
    pub state: AppState,
    pub store: Arc<Store>,
    pub pipeline: Arc<PollPipeline>,
    pub index: Arc<FakeIndex>,
    pub telegram: Arc<RecordingTransport>,
    pub config: Config,
    _temp_dir: TempDir,
}

pub fn test_config(sled_path: &str) -> Config {
    // 直接构造 Config，避免 set_var 在并行测试中产生竞态
    Config {
        host: std::net::IpAddr::V4(std::net::Ipv4Addr::new(127, 0, 0, 1)),
        port: 3000,
        http_enabled: true,
        admin_token: ADMIN_TOKEN.to_string(),
        log_level: "info".to_string(),
        enable_file_logs: false,
        log_dir: "./logs".to_string(),
        sled_path: sled_path.to_string(),
        arxiv: ArxivConfig {
            api_url: "http://127.0.0.1:9/api/query".to_string(),
            max_results: 20,
            request_interval_ms: 0,
            timeout_secs: 5,
            default_categories: Vec::new(),
        },
        llm: LLMConfig {
            enabled: false,
            mock: true,
            api_url: String::new(),
            api_key: String::new(),
            model: "test-model".to_string(),
            timeout_secs: 5,
            max_tags: 5,
            concurrency: 2,
        },
        telegram: TelegramConfig {
            enabled: true,
            token: "123:test".to_string(),
            api_url: "http://127.0.0.1:9".to_string(),
            poll_timeout_secs: 1,
        },
        matrix: MatrixConfig {
            enabled: false,
            homeserver: String::new(),
            access_token: String::new(),
            room_id: String::new(),
            queries: Vec::new(),
        },
        worker: WorkerConfig {
            is_leader: false,
            fetch_interval_hours: 6,
            poll_cron: "0 * * * * *".to_string(),
            session_timeout_secs: 180,
            stale_claim_minutes: 30,
        },
    }
}

pub fn pipeline_settings(config: &Config) -> PipelineSettings {
    PipelineSettings {
        default_interval_hours: config.worker.fetch_interval_hours,
        default_categories: config.arxiv.default_categories.clone(),
        max_results: config.arxiv.max_results,
        stale_claim: chrono::Duration::minutes(config.worker.stale_claim_minutes),
    }
}

/// Router over a temp store, a fake index and a recording Telegram transport.
pub async fn spawn_test_server() -> TestApp {
    let temp_dir = tempfile::tempdir().expect("tempdir");
    let sled_path = temp_dir.path().join("notifier-test.sled");
    let config = test_config(&sled_path.to_string_lossy());

    let store = Arc::new(Store::open(&config.sled_path).expect("open store"));
    store.run_migrations().expect("run migrations");

    let index = Arc::new(FakeIndex::new());
    let telegram = Arc::new(RecordingTransport::new(Platform::Telegram));
    let transports = Transports::new().with(telegram.clone());

    let pipeline = Arc::new(PollPipeline::new(
        store.clone(),
        index.clone(),
        None,
        transports,
        pipeline_settings(&config),
    ));

    let (shutdown_tx, _) = broadcast::channel::<()>(8);
    let state = AppState::new(store.clone(), pipeline.clone(), &config, shutdown_tx);
    let app = build_router(state.clone());

    TestApp {
        app,
        state,
        store,
        pipeline,
        index,
        telegram,
        config,
        _temp_dir: temp_dir,
    }
}
