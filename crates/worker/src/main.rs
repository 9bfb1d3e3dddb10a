use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use outliner_common::config::AppConfig;
use outliner_common::credentials::{ServiceAccountKey, ServiceAccountTokens, TokenSource};
use outliner_engine::completion::CompletionTracker;
use outliner_engine::reactions::{FollowReaction, MentionReaction};
use outliner_engine::watcher::CollectionWatcher;
use outliner_notifier::Dispatcher;
use outliner_notifier::fcm::FcmClient;
use outliner_store::feed::PollingFeed;
use outliner_store::firestore::FirestoreClient;
use outliner_store::{ChangeFeed, DocumentStore};

/// Bearer token accepted by the Firestore emulator.
const EMULATOR_TOKEN: &str = "owner";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "outliner_worker=info,outliner_engine=info,outliner_store=info,outliner_notifier=info"
                    .into()
            }),
        )
        .json()
        .init();

    tracing::info!("Outliner notification worker starting...");

    // Load configuration
    let config = AppConfig::from_env()?;

    // Load credentials
    let key = match &config.credentials_path {
        Some(path) => Some(
            ServiceAccountKey::from_file(path)
                .with_context(|| format!("Failed to load credentials from {}", path.display()))?,
        ),
        None => None,
    };

    let project_id = config
        .project_id
        .clone()
        .or_else(|| key.as_ref().and_then(|k| k.project_id.clone()))
        .context("FIREBASE_PROJECT_ID is not set and the credentials carry no project_id")?;

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .context("Failed to build HTTP client")?;

    let service_tokens = key.map(|key| {
        Arc::new(TokenSource::ServiceAccount(ServiceAccountTokens::new(
            key,
            http.clone(),
        )))
    });

    let store_tokens = if config.uses_emulator() {
        Arc::new(TokenSource::Static(EMULATOR_TOKEN.to_string()))
    } else {
        service_tokens
            .clone()
            .context("Credentials are required outside the emulator")?
    };
    let gateway_tokens = service_tokens
        .clone()
        .unwrap_or_else(|| Arc::clone(&store_tokens));

    // Build document store and change feed
    let firestore = Arc::new(FirestoreClient::new(
        http.clone(),
        config.firestore_base_url.clone(),
        project_id.clone(),
        config.firestore_database.clone(),
        store_tokens,
    ));
    let store: Arc<dyn DocumentStore> = firestore.clone();
    let feed: Arc<dyn ChangeFeed> =
        Arc::new(PollingFeed::new(firestore, config.feed_poll_interval_ms));

    // Build push gateway
    let fcm = FcmClient::new(
        http,
        config.fcm_base_url.clone(),
        project_id.clone(),
        gateway_tokens,
        config.fcm_max_concurrency,
    );
    let dispatcher = Dispatcher::new(Arc::new(fcm));

    tracing::info!(
        project_id = %project_id,
        emulator = config.uses_emulator(),
        "Document store and push gateway clients created, listening for changes..."
    );

    // Start both watchers
    let shutdown = CancellationToken::new();
    let tracker = CompletionTracker::new();

    let posts = CollectionWatcher::new(
        config.posts_collection.clone(),
        Arc::clone(&feed),
        MentionReaction::new(
            Arc::clone(&store),
            dispatcher.clone(),
            config.users_collection.clone(),
        ),
    );
    let follows = CollectionWatcher::new(
        config.follows_collection.clone(),
        feed,
        FollowReaction::new(store, dispatcher, config.users_collection.clone()),
    );

    let posts_guard = tracker.guard(config.posts_collection.clone());
    let follows_guard = tracker.guard(config.follows_collection.clone());
    tokio::spawn(posts.run(shutdown.clone(), posts_guard));
    tokio::spawn(follows.run(shutdown.clone(), follows_guard));

    // Cancel on Ctrl+C or when the optional run deadline passes
    let deadline = config.run_timeout_secs.map(Duration::from_secs);
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        let expired = async {
            match deadline {
                Some(after) => tokio::time::sleep(after).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received shutdown signal, stopping gracefully...");
            }
            _ = expired => {
                tracing::info!("Run deadline reached, stopping gracefully...");
            }
            _ = signal_token.cancelled() => {}
        }
        signal_token.cancel();
    });

    tracker.wait().await;
    shutdown.cancel();

    tracing::info!("Outliner notification worker stopped.");
    Ok(())
}
