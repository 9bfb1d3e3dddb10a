use std::path::PathBuf;

use serde::Deserialize;

/// Default Firestore REST endpoint.
pub const DEFAULT_FIRESTORE_BASE_URL: &str = "https://firestore.googleapis.com/v1";

/// Default FCM HTTP v1 endpoint.
pub const DEFAULT_FCM_BASE_URL: &str = "https://fcm.googleapis.com/v1";

/// Worker configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Project id shared by the document store and the push gateway.
    /// Falls back to the credential bundle's `project_id` when unset.
    pub project_id: Option<String>,

    /// Path to the service-account JSON bundle
    pub credentials_path: Option<PathBuf>,

    /// Firestore database id (default: "(default)")
    pub firestore_database: String,

    /// `host:port` of a local Firestore emulator
    pub firestore_emulator_host: Option<String>,

    /// Firestore REST base URL
    pub firestore_base_url: String,

    /// FCM HTTP v1 base URL
    pub fcm_base_url: String,

    /// Collection carrying posts
    pub posts_collection: String,

    /// Collection carrying follow relationships
    pub follows_collection: String,

    /// Collection carrying user profiles
    pub users_collection: String,

    /// Change feed polling interval in milliseconds (default: 1000)
    pub feed_poll_interval_ms: u64,

    /// Maximum in-flight sends per multicast (default: 10)
    pub fcm_max_concurrency: usize,

    /// Optional process-wide run deadline in seconds
    pub run_timeout_secs: Option<u64>,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let firestore_emulator_host = std::env::var("FIRESTORE_EMULATOR_HOST").ok();
        let credentials_path = std::env::var("GOOGLE_APPLICATION_CREDENTIALS")
            .ok()
            .map(PathBuf::from);

        if credentials_path.is_none() && firestore_emulator_host.is_none() {
            anyhow::bail!(
                "GOOGLE_APPLICATION_CREDENTIALS environment variable is required \
                 (or set FIRESTORE_EMULATOR_HOST for local runs)"
            );
        }

        let base_url_override = std::env::var("FIRESTORE_BASE_URL").ok();
        let firestore_base_url = match (base_url_override, &firestore_emulator_host) {
            (Some(url), _) => url,
            (None, Some(host)) => format!("http://{}/v1", host),
            (None, None) => DEFAULT_FIRESTORE_BASE_URL.to_string(),
        };

        Ok(Self {
            project_id: std::env::var("FIREBASE_PROJECT_ID").ok(),
            credentials_path,
            firestore_database: std::env::var("FIRESTORE_DATABASE")
                .unwrap_or_else(|_| "(default)".to_string()),
            firestore_emulator_host,
            firestore_base_url,
            fcm_base_url: std::env::var("FCM_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_FCM_BASE_URL.to_string()),
            posts_collection: std::env::var("POSTS_COLLECTION")
                .unwrap_or_else(|_| "posts".to_string()),
            follows_collection: std::env::var("FOLLOWS_COLLECTION")
                .unwrap_or_else(|_| "follows".to_string()),
            users_collection: std::env::var("USERS_COLLECTION")
                .unwrap_or_else(|_| "users".to_string()),
            feed_poll_interval_ms: std::env::var("FEED_POLL_INTERVAL_MS")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("FEED_POLL_INTERVAL_MS must be a valid u64"))?,
            fcm_max_concurrency: std::env::var("FCM_MAX_CONCURRENCY")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("FCM_MAX_CONCURRENCY must be a valid usize"))?,
            run_timeout_secs: std::env::var("WORKER_RUN_TIMEOUT_SECS")
                .ok()
                .map(|v| v.parse())
                .transpose()
                .map_err(|_| anyhow::anyhow!("WORKER_RUN_TIMEOUT_SECS must be a valid u64"))?,
        })
    }

    /// Whether the store should talk to a local emulator instead of Google.
    pub fn uses_emulator(&self) -> bool {
        self.firestore_emulator_host.is_some()
    }
}
