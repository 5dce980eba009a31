use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;

use snowline_common::config::AppConfig;
use snowline_common::history::HistoryStore;
use snowline_common::preferences::PreferencesStore;
use snowline_common::redis_pool;
use snowline_common::store::{KeyValueStore, RedisStore};
use snowline_common::types::NotificationEvent;
use snowline_engine::recovery::ErrorRecovery;
use snowline_engine::retry::{RetryEngine, RetryOverrides};
use snowline_engine::throttle::{ThrottleConfig, ThrottleOverrides};
use snowline_listener::feed::RedisChangeFeed;
use snowline_listener::listener::{ListenerConfig, ListenerOverrides, RealtimeListener};
use snowline_notifier::hooks::PipelineRecoveryHooks;
use snowline_notifier::in_app::InAppDispatcher;
use snowline_notifier::ingress::Ingress;
use snowline_notifier::pipeline::{NotificationPipeline, PipelineConfig, PipelineDeps, PipelineOverrides};
use snowline_notifier::push::{HttpPushGateway, PushSender, UnsupportedPush};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "snowline_notifier=info,snowline_listener=info,snowline_engine=info".into()),
        )
        .json()
        .init();

    tracing::info!("Snowline notifier starting...");

    let config = AppConfig::from_env()?;

    // Persistent state
    let conn = redis_pool::create_redis_pool(&config.redis_url).await?;
    let kv: Arc<dyn KeyValueStore> = Arc::new(RedisStore::new(conn));
    let preferences = PreferencesStore::new(kv.clone(), config.preferences_key.clone());
    let history = HistoryStore::new(kv, config.history_key.clone());

    // Delivery channels
    let push: Arc<dyn PushSender> = match &config.push_gateway_url {
        Some(url) => {
            tracing::info!(url = %url, "Push gateway configured");
            Arc::new(HttpPushGateway::new(url.clone(), config.push_gateway_token.clone())?)
        }
        None => {
            tracing::info!("No push gateway configured, delivering in-app only");
            Arc::new(UnsupportedPush)
        }
    };
    let in_app = Arc::new(InAppDispatcher::new());
    let in_app_log = tokio::spawn(log_in_app(in_app.clone()));

    let retry = Arc::new(RetryEngine::new());
    let recovery = Arc::new(ErrorRecovery::new());

    let pipeline = NotificationPipeline::new(
        PipelineConfig::default().with_overrides(&pipeline_overrides(&config)),
        PipelineDeps {
            preferences: preferences.clone(),
            history: history.clone(),
            push: push.clone(),
            in_app,
            retry: retry.clone(),
            recovery,
        },
    )?;

    // Change feed
    let client = redis_pool::open_client(&config.redis_url)?;
    let feed = Arc::new(RedisChangeFeed::new(client, config.change_feed_channel_prefix.clone()));
    let listener = RealtimeListener::new(feed, ListenerConfig::default().with_overrides(&listener_overrides(&config)))?;

    pipeline.set_recovery_hooks(Arc::new(
        PipelineRecoveryHooks::new(pipeline.downgrade(), retry.clone(), push, preferences, history)
            .with_listener(listener.clone()),
    ));

    let throttle = ThrottleConfig::default().with_overrides(&throttle_overrides(&config));
    let (ingress, mut consumer) = Ingress::start(config.ingress_mode, throttle, pipeline.clone())?;
    let ingress = Arc::new(ingress);
    listener.add_event_handler({
        let ingress = ingress.clone();
        move |event: &NotificationEvent| ingress.submit(event.clone())
    });

    let mut queue_processor = tokio::spawn(
        retry
            .clone()
            .run_queue_processor(Duration::from_millis(config.queue_process_interval_ms)),
    );

    tracing::info!(channel = %config.change_feed_channel(), mode = ?config.ingress_mode, "Connecting to change feed");
    if let Err(e) = listener.connect().await {
        tracing::warn!(error = %e, "Initial change feed subscription failed, retrying in background");
    }

    // Run until Ctrl+C
    tokio::select! {
        result = &mut consumer => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Ingress consumer exited with error");
            }
        }
        result = &mut queue_processor => {
            tracing::error!(error = ?result.err(), "Failure queue processor exited unexpectedly");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal, stopping gracefully...");
        }
    }

    listener.disconnect().await;
    let held = ingress.shutdown();
    let undelivered = pipeline.shutdown();
    queue_processor.abort();
    consumer.abort();
    in_app_log.abort();

    let stats = pipeline.stats();
    tracing::info!(
        held,
        undelivered,
        failure_queue = retry.queue_len(),
        delivered_push = stats.delivered_push,
        delivered_in_app = stats.delivered_in_app,
        escalated = stats.escalated,
        "Snowline notifier stopped."
    );
    Ok(())
}

/// In-app sink for the daemon: every in-app notification is logged.
async fn log_in_app(in_app: Arc<InAppDispatcher>) {
    let mut rx = in_app.subscribe();
    drop(in_app);
    loop {
        match rx.recv().await {
            Ok(n) => tracing::info!(
                notification_id = %n.notification_id,
                area = %n.area,
                kind = %n.kind,
                title = %n.title,
                "{}", n.message
            ),
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "In-app log sink lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

fn pipeline_overrides(config: &AppConfig) -> PipelineOverrides {
    PipelineOverrides {
        batch_size: config.pipeline_batch_size,
        debounce_delay_ms: config.pipeline_debounce_ms,
        delivery_delay_ms: config.pipeline_delivery_delay_ms,
        delivery_timeout_ms: config.pipeline_delivery_timeout_ms,
        push_retry: Some(RetryOverrides {
            max_retries: config.push_max_retries,
            base_delay_ms: config.push_base_delay_ms,
            ..Default::default()
        }),
        requeue_retry: Some(RetryOverrides {
            max_retries: config.requeue_max_retries,
            base_delay_ms: config.requeue_base_delay_ms,
            max_delay_ms: config.requeue_max_delay_ms,
            ..Default::default()
        }),
        push_icon: config.push_icon.clone(),
        auto_recover: Some(config.auto_recover),
    }
}

fn listener_overrides(config: &AppConfig) -> ListenerOverrides {
    ListenerOverrides {
        schema: Some(config.change_feed_schema.clone()),
        table: Some(config.change_feed_table.clone()),
        auto_reconnect: None,
        reconnect_delay_ms: config.reconnect_delay_ms,
        max_reconnect_attempts: config.max_reconnect_attempts,
    }
}

fn throttle_overrides(config: &AppConfig) -> ThrottleOverrides {
    ThrottleOverrides {
        throttle_delay_ms: config.throttle_delay_ms,
        batch_size: config.throttle_batch_size,
        batch_timeout_ms: config.throttle_batch_timeout_ms,
        debounce_delay_ms: config.throttle_debounce_ms,
        max_queue_size: config.throttle_max_queue_size,
    }
}
