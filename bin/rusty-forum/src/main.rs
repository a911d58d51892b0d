//! # Rusty-Forum Binary
//!
//! Assembles the services from configuration, recovers jobs a previous
//! process left claimed, runs one worker per queue and drains them on
//! Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rf_cache::MemoryCache;
use rf_config::{CacheBackend, CacheSettings, LogFormat, QueueBackend, QueueSettings, Settings};
use rf_core::jobs::JobKind;
use rf_core::models::ThreadQuery;
use rf_core::traits::{Cache, ForumRepo, JobQueue};
use rf_db_sqlite::{SqliteForumRepo, SqliteJobQueue};
use rf_engine::{DispatchPolicy, MutationEngine, ReadSettings, ThreadReader};
use rf_queue_memory::MemoryJobQueue;
use rf_realtime_local::RoomHub;
use rf_workers::http::{self, HttpClassifier, HttpSummarizer, HttpWebhook};
use rf_workers::{JobHandler, ModerationHandler, NotificationHandler, SummaryHandler, Worker};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

const ROOM_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

fn build_cache(settings: &CacheSettings) -> anyhow::Result<Arc<dyn Cache>> {
    match settings.backend {
        CacheBackend::Memory => Ok(Arc::new(MemoryCache::new())),
        #[cfg(feature = "redis")]
        CacheBackend::Redis => {
            use secrecy::ExposeSecret;
            let url = settings.redis_url.as_ref().context("cache.redis_url is not set")?;
            Ok(Arc::new(rf_cache::RedisCache::new(url.expose_secret())?))
        }
        #[cfg(not(feature = "redis"))]
        CacheBackend::Redis => anyhow::bail!("cache.backend = redis needs the `redis` feature"),
    }
}

fn read_settings(cache: &CacheSettings) -> ReadSettings {
    ReadSettings {
        list_ttl: cache.list_ttl(),
        detail_ttl: cache.detail_ttl(),
    }
}

fn dispatch_policy(queues: &QueueSettings) -> DispatchPolicy {
    JobKind::ALL
        .into_iter()
        .fold(DispatchPolicy::default(), |policy, kind| {
            policy.with_route(kind, queues.name(kind), queues.job_options(kind))
        })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load()?;
    init_tracing(settings.log_format);

    // 1. Storage
    let pool = rf_db_sqlite::connect(&settings.database.url, settings.database.max_connections)
        .await
        .context("failed to open database")?;
    let repo: Arc<dyn ForumRepo> = Arc::new(SqliteForumRepo::new(pool.clone()));

    // 2. Cache, queue and realtime hub
    let cache = build_cache(&settings.cache)?;
    let queue: Arc<dyn JobQueue> = match settings.queues.backend {
        QueueBackend::Sqlite => Arc::new(SqliteJobQueue::new(pool.clone())),
        QueueBackend::Memory => Arc::new(MemoryJobQueue::new()),
    };
    let hub = Arc::new(RoomHub::default());

    let engine = MutationEngine::new(
        repo.clone(),
        cache.clone(),
        queue.clone(),
        hub.clone(),
        dispatch_policy(&settings.queues),
    );
    let reader = ThreadReader::new(repo.clone(), cache.clone(), read_settings(&settings.cache));

    // 3. At-least-once: jobs a crashed process held go back in line.
    for kind in JobKind::ALL {
        let name = settings.queues.name(kind);
        match queue.recover_stalled(name).await {
            Ok(0) => {}
            Ok(recovered) => tracing::warn!(queue = name, recovered, "requeued stalled jobs"),
            Err(err) => tracing::error!(queue = name, error = %err, "stalled job recovery failed"),
        }
    }

    // 4. Workers
    let client = http::client()?;
    let classifier = Arc::new(HttpClassifier::new(
        client.clone(),
        &settings.classifier.endpoint,
        settings.classifier.api_key.clone(),
        &settings.classifier.model,
    ));
    let summarizer = Arc::new(HttpSummarizer::new(
        client.clone(),
        &settings.summarizer.endpoint,
        settings.summarizer.api_key.clone(),
        &settings.summarizer.model,
    ));
    let webhook = Arc::new(HttpWebhook::new(client));

    let handlers: [(JobKind, Arc<dyn JobHandler>); 3] = [
        (
            JobKind::Moderation,
            Arc::new(ModerationHandler::new(
                engine.clone(),
                repo.clone(),
                classifier,
                settings.classifier.timeout(),
            )),
        ),
        (
            JobKind::Summary,
            Arc::new(SummaryHandler::new(
                engine.clone(),
                repo.clone(),
                summarizer,
                settings.summarizer.timeout(),
            )),
        ),
        (
            JobKind::Notification,
            Arc::new(NotificationHandler::new(
                webhook,
                settings.webhook.url.clone(),
                settings.webhook.timeout(),
            )),
        ),
    ];

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();
    for (kind, handler) in handlers {
        let worker = Worker::new(
            settings.queues.name(kind),
            queue.clone(),
            handler,
            settings.queues.concurrency(kind),
        )
        .with_poll_interval(settings.queues.poll_interval());
        tasks.spawn(worker.run(shutdown_rx.clone()));
    }

    let prune_hub = hub.clone();
    let mut prune_shutdown = shutdown_rx.clone();
    tasks.spawn(async move {
        let mut ticker = tokio::time::interval(ROOM_PRUNE_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let pruned = prune_hub.prune();
                    if pruned > 0 {
                        tracing::debug!(pruned, "dropped empty realtime rooms");
                    }
                }
                _ = prune_shutdown.changed() => break,
            }
        }
    });

    // Warms the front-page list so the first reader is served from cache.
    match reader.list_threads(&ThreadQuery::default()).await {
        Ok(front) => tracing::info!(threads = front.total, "thread list cached"),
        Err(err) => tracing::warn!(error = %err, "could not warm thread list"),
    }

    tracing::info!(
        database = %settings.database.url,
        cache = ?settings.cache.backend,
        queue = ?settings.queues.backend,
        "rusty-forum running, Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;
    tracing::info!("shutdown requested, draining workers");
    let _ = shutdown_tx.send(true);

    while let Some(done) = tasks.join_next().await {
        if let Err(err) = done {
            tracing::error!(error = %err, "background task failed");
        }
    }
    pool.close().await;
    tracing::info!("bye");
    Ok(())
}
