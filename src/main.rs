use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arxiv_notifier::bot::session::SessionManager;
use arxiv_notifier::bot::{BotSettings, TelegramBot};
use arxiv_notifier::config::Config;
use arxiv_notifier::logging::{init_tracing, LogConfig};
use arxiv_notifier::pipeline::{PipelineSettings, PollPipeline};
use arxiv_notifier::routes::build_router;
use arxiv_notifier::services::arxiv::ArxivClient;
use arxiv_notifier::services::enrichment::PaperEnricher;
use arxiv_notifier::services::llm_provider::LlmProvider;
use arxiv_notifier::services::matrix::MatrixClient;
use arxiv_notifier::services::telegram::TelegramClient;
use arxiv_notifier::services::transport::Transports;
use arxiv_notifier::state::AppState;
use arxiv_notifier::store::operations::subscribers::{Platform, Recipient};
use arxiv_notifier::store::Store;
use arxiv_notifier::workers::WorkerManager;
use axum::http::{header, HeaderValue};
use tokio::sync::broadcast;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let config = Config::from_env();

    init_tracing(&LogConfig::from(&config));
    tracing::info!("Starting arxiv-notifier");

    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "Configuration rejected");
        std::process::exit(1);
    }

    let store = Arc::new(Store::open(&config.sled_path).expect("Failed to open sled database"));
    store.run_migrations().expect("Failed to run migrations");

    let (shutdown_tx, _) = broadcast::channel::<()>(8);

    let index = Arc::new(ArxivClient::new(&config.arxiv));
    let enricher = if config.llm.enabled {
        tracing::info!(model = %config.llm.model, mock = config.llm.mock, "LLM enrichment enabled");
        Some(Arc::new(PaperEnricher::new(
            LlmProvider::new(&config.llm),
            config.llm.max_tags,
            config.llm.concurrency,
        )))
    } else {
        None
    };

    let mut transports = Transports::new();
    let telegram = config
        .telegram
        .enabled
        .then(|| TelegramClient::new(&config.telegram));
    if let Some(client) = &telegram {
        transports.register(Arc::new(client.clone()));
    }
    if config.matrix.enabled {
        transports.register(Arc::new(MatrixClient::new(&config.matrix)));
        seed_matrix_room(&store, &config);
    }
    if transports.is_empty() {
        tracing::warn!("No chat platform enabled; papers will be stored but not delivered");
    }

    let pipeline = Arc::new(PollPipeline::new(
        store.clone(),
        index,
        enricher,
        transports,
        PipelineSettings {
            default_interval_hours: config.worker.fetch_interval_hours,
            default_categories: config.arxiv.default_categories.clone(),
            max_results: config.arxiv.max_results,
            stale_claim: chrono::Duration::minutes(config.worker.stale_claim_minutes),
        },
    ));

    // getUpdates 只允许一个消费者，bot 只在 leader 上运行
    let bot = match telegram {
        Some(client) if config.worker.is_leader => Some(Arc::new(TelegramBot::new(
            client,
            store.clone(),
            pipeline.clone(),
            SessionManager::new(Duration::from_secs(config.worker.session_timeout_secs)),
            BotSettings {
                fetch_interval_hours: config.worker.fetch_interval_hours,
                max_results_cap: config.arxiv.max_results,
            },
        ))),
        Some(_) => {
            tracing::info!("Not the worker leader; Telegram bot stays idle");
            None
        }
        None => None,
    };

    if let Some(bot) = &bot {
        let bot = bot.clone();
        let rx = shutdown_tx.subscribe();
        tokio::spawn(async move { bot.run(rx).await });
    }

    let worker_handle = if config.worker.is_leader {
        let worker_manager = WorkerManager::new(
            store.clone(),
            Some(pipeline.clone()),
            bot,
            shutdown_tx.subscribe(),
            &config.worker,
        );
        Some(tokio::spawn(async move {
            if let Err(e) = worker_manager.start().await {
                tracing::error!(error = %e, "Worker manager failed");
            }
        }))
    } else {
        None
    };

    if let Some(handle) = worker_handle {
        // Worker panic 只记录，不影响管理接口
        tokio::spawn(async move {
            match handle.await {
                Err(e) => tracing::error!(error = %e, "Worker task panicked"),
                Ok(()) => tracing::info!("Worker manager exited normally"),
            }
        });
    }

    if config.http_enabled {
        if config.admin_token.trim().is_empty() {
            tracing::warn!("ADMIN_TOKEN is empty; every admin API call will be rejected");
        }

        let state = AppState::new(store.clone(), pipeline.clone(), &config, shutdown_tx.clone());
        let app = build_router(state)
            .layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE, header::ACCEPT])
                    .allow_methods(Any),
            )
            .layer(TraceLayer::new_for_http())
            .layer(CatchPanicLayer::new())
            .layer(SetResponseHeaderLayer::overriding(
                header::X_CONTENT_TYPE_OPTIONS,
                HeaderValue::from_static("nosniff"),
            ))
            .layer(SetResponseHeaderLayer::overriding(
                header::X_FRAME_OPTIONS,
                HeaderValue::from_static("DENY"),
            ))
            .layer(SetResponseHeaderLayer::if_not_present(
                header::REFERRER_POLICY,
                HeaderValue::from_static("no-referrer"),
            ));

        let addr = SocketAddr::new(config.host, config.port);
        tracing::info!(%addr, "Admin API listening");
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .expect("Failed to bind TCP listener");

        if let Err(e) = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal(shutdown_tx.clone()))
        .await
        {
            tracing::error!(error = %e, "HTTP server crashed");
        }
    } else {
        tracing::info!("Admin API disabled");
        shutdown_signal(shutdown_tx.clone()).await;
    }

    tracing::info!("Flushing store before exit");
    if let Err(e) = store.flush() {
        tracing::error!(error = %e, "Failed to flush store before exit");
    }
    tracing::info!("Shutdown complete");
}

/// The configured Matrix room is a subscriber like any chat. Queries from the
/// environment replace the stored list only when any are configured.
fn seed_matrix_room(store: &Store, config: &Config) {
    let recipient = Recipient::new(Platform::Matrix, config.matrix.room_id.trim());
    let cap = config.arxiv.max_results;
    let queries: Vec<_> = config
        .matrix
        .queries
        .iter()
        .cloned()
        .map(|mut q| {
            q.max_results = q.max_results.min(cap);
            q
        })
        .collect();

    let result = store.update_subscriber(&recipient, |sub| {
        if !queries.is_empty() {
            sub.search_queries = queries.clone();
        }
        if sub.description.is_none() {
            sub.description = Some("Matrix room".to_string());
        }
    });
    match result {
        Ok(sub) => tracing::info!(
            room = %recipient.chat_id,
            queries = sub.search_queries.len(),
            "Matrix room subscriber ready"
        ),
        Err(e) => tracing::error!(error = %e, room = %recipient.chat_id, "Failed to seed Matrix room"),
    }
}

async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    tracing::info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
