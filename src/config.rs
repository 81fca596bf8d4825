use std::{
    env::{self, VarError},
    fmt::Display,
    str::FromStr,
    time::Duration,
};

use rearch::{CData, CapsuleHandle, Container};
use sea_orm::{ConnectOptions, Database, DbConn};
use tracing::{info, instrument, warn};
use url::Url;

use crate::{
    image_compress::CompressOptions,
    rate_limit::{DEFAULT_MAX_REQUESTS, DEFAULT_WINDOW},
    short_code::DEFAULT_SHORT_CODE_LENGTH,
};

pub const SERVICE_NAME: &str = "LưuGọn API";

/// Everything the service reads from its environment, besides the database URL.
#[derive(Clone, Debug)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
    pub supabase_url: Url,
    pub supabase_key: String,
    pub storage_bucket: String,
    pub max_file_size_bytes: usize,
    pub allowed_image_types: Vec<String>,
    pub allowed_image_extensions: Vec<String>,
    pub max_text_length: usize,
    pub base_url: Url,
    pub rate_limit_requests: usize,
    pub rate_limit_window: Duration,
    pub short_code_length: usize,
    pub item_ttl: Option<Duration>,
    pub image: CompressOptions,
}

impl Settings {
    /// Builds the public short URL for a code: the base URL, one `/`, then the code.
    #[must_use]
    pub fn short_url(&self, short_code: &str) -> String {
        format!("{}/{short_code}", self.base_url.as_str().trim_end_matches('/'))
    }

    /// Settings with the documented defaults and placeholder store credentials.
    #[must_use]
    #[allow(clippy::unwrap_used, clippy::missing_panics_doc)]
    pub fn with_defaults() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            port: 8000,
            cors_origins: vec!["http://localhost:3000".to_owned()],
            supabase_url: Url::parse("http://localhost:54321").unwrap(),
            supabase_key: String::new(),
            storage_bucket: "luugon-files".to_owned(),
            max_file_size_bytes: 10 * 1024 * 1024,
            allowed_image_types: split_list("image/jpeg,image/png,image/webp,image/gif"),
            allowed_image_extensions: split_list(".jpg,.jpeg,.png,.webp,.gif"),
            max_text_length: 1_000_000,
            base_url: Url::parse("http://localhost:3000").unwrap(),
            rate_limit_requests: DEFAULT_MAX_REQUESTS,
            rate_limit_window: DEFAULT_WINDOW,
            short_code_length: DEFAULT_SHORT_CODE_LENGTH,
            item_ttl: None,
            image: CompressOptions::default(),
        }
    }
}

/// # Errors
/// Will return [`Err`] if the connection to the database fails.
#[instrument]
pub async fn init_container() -> anyhow::Result<Container> {
    info!("Initializing container");
    let container = Container::new();

    let (db_connection_options, set_db_conn) =
        container.read((db_connection_options_capsule, db_conn_init_action));

    info!(?db_connection_options, "Connecting to database");
    set_db_conn(Database::connect(db_connection_options).await?);

    info!("Container initialized");
    Ok(container)
}

/// # Panics
/// Panics when a required environment variable is not set, or any variable is invalid.
#[must_use]
pub fn settings_capsule(_: CapsuleHandle) -> Settings {
    let defaults = Settings::with_defaults();
    let max_file_size_mb: usize = env_or("MAX_FILE_SIZE_MB", 10);

    Settings {
        host: env_or("HOST", defaults.host),
        port: env_or("PORT", defaults.port),
        cors_origins: split_list(&env_or("CORS_ORIGINS", defaults.cors_origins.join(","))),
        supabase_url: required_env("SUPABASE_URL"),
        supabase_key: required_env("SUPABASE_KEY"),
        storage_bucket: env_or("STORAGE_BUCKET", defaults.storage_bucket),
        max_file_size_bytes: max_file_size_mb * 1024 * 1024,
        allowed_image_types: split_list(&env_or(
            "ALLOWED_IMAGE_TYPES",
            defaults.allowed_image_types.join(","),
        )),
        allowed_image_extensions: split_list(&env_or(
            "ALLOWED_IMAGE_EXTENSIONS",
            defaults.allowed_image_extensions.join(","),
        )),
        max_text_length: env_or("MAX_TEXT_LENGTH", defaults.max_text_length),
        base_url: env_or("BASE_URL", defaults.base_url),
        rate_limit_requests: env_or("RATE_LIMIT_REQUESTS", defaults.rate_limit_requests),
        rate_limit_window: Duration::from_secs(env_or(
            "RATE_LIMIT_PERIOD_SECONDS",
            defaults.rate_limit_window.as_secs(),
        )),
        short_code_length: env_or("SHORT_CODE_LENGTH", defaults.short_code_length),
        item_ttl: optional_env::<u64>("ITEM_TTL_SECONDS").map(Duration::from_secs),
        image: defaults.image,
    }
}

/// # Panics
/// Panics when environment variable is not set or is invalid.
#[must_use]
pub fn db_connection_options_capsule(_: CapsuleHandle) -> ConnectOptions {
    required_env::<String>("DB_URL").into()
}

fn db_conn_manager(
    CapsuleHandle { register, .. }: CapsuleHandle,
) -> (Option<DbConn>, impl use<> + CData + Fn(Option<DbConn>)) {
    register.register(rearch_effects::state::<rearch_effects::Cloned<_>>(None))
}

pub fn db_conn_init_action(
    CapsuleHandle { mut get, .. }: CapsuleHandle,
) -> impl use<> + CData + Fn(DbConn) {
    let set_db_conn = get.as_ref(db_conn_manager).1.clone();
    move |db| set_db_conn(Some(db))
}

/// # Panics
/// Panics when the [`DbConn`] was not set via [`db_conn_init_action`].
pub fn db_conn_capsule(CapsuleHandle { mut get, .. }: CapsuleHandle) -> DbConn {
    let db_conn = get.as_ref(db_conn_manager).0.clone();
    db_conn.expect("DbConn should've been set via db_conn_init_action!")
}

pub fn addr_capsule(CapsuleHandle { mut get, .. }: CapsuleHandle) -> String {
    let settings = get.as_ref(settings_capsule);
    format!("{}:{}", settings.host, settings.port)
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_owned)
        .collect()
}

fn optional_env<T>(name: &str) -> Option<T>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(name) {
        Ok(raw) => match raw.parse() {
            Ok(value) => {
                info!("{name} environment variable set");
                Some(value)
            }
            Err(err) => panic!("{name} environment variable is invalid: {err}"),
        },
        Err(VarError::NotPresent) => None,
        Err(VarError::NotUnicode(actual)) => {
            panic!(
                "{name} environment variable is invalid unicode: {}",
                actual.display()
            );
        }
    }
}

fn env_or<T>(name: &str, default: T) -> T
where
    T: FromStr + Display,
    T::Err: Display,
{
    optional_env(name).unwrap_or_else(|| {
        warn!("{name} environment variable not set; defaulting to {default}");
        default
    })
}

fn required_env<T>(name: &str) -> T
where
    T: FromStr,
    T::Err: Display,
{
    optional_env(name).unwrap_or_else(|| panic!("{name} is not set"))
}
