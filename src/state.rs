use std::{env, str::FromStr};

use migration::{Migrator, MigratorTrait};
use tokio_util::sync::CancellationToken;

use crate::{
  monitor::Monitor,
  prelude::*,
  sv::{self, Locks, RealtimeConfig, store::Limits},
};

#[derive(Debug, Clone)]
pub struct Config {
  pub database_url: String,
  pub port: u16,
  pub secret: String,
  /// Admin routes answer 403 while unset
  pub admin_secret: Option<String>,

  pub initial_allowance_seconds: i64,
  pub max_session_seconds: i64,
  pub min_session_seconds: i64,
  /// Descending, in seconds; the largest one is the warning threshold
  pub warning_thresholds: Vec<i64>,
  pub max_concurrent_sessions: i32,

  pub stale_after: Duration,
  pub replay_tolerance: Duration,
  pub heartbeat_token_ttl: Duration,
  pub store_timeout: Duration,

  pub sweep_interval: Duration,
  pub reaper_interval: Duration,
  pub monitor_idle_timeout: Duration,
  pub monitor_close_grace: Duration,

  pub realtime: RealtimeConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      database_url: String::from("sqlite:drival.db?mode=rwc"),
      port: 3000,
      secret: String::new(),
      admin_secret: None,

      initial_allowance_seconds: 30 * 60,
      max_session_seconds: 15 * 60,
      min_session_seconds: 60,
      warning_thresholds: vec![120, 60, 30],
      max_concurrent_sessions: 1,

      stale_after: Duration::from_secs(5 * 60),
      replay_tolerance: Duration::from_secs(5 * 60),
      heartbeat_token_ttl: Duration::from_secs(5 * 60),
      store_timeout: Duration::from_secs(5),

      sweep_interval: Duration::from_secs(3 * 60),
      reaper_interval: Duration::from_secs(30),
      monitor_idle_timeout: Duration::from_secs(90),
      monitor_close_grace: Duration::from_secs(1),

      realtime: RealtimeConfig::default(),
    }
  }
}

impl Config {
  pub fn from_env() -> anyhow::Result<Self> {
    let defaults = Self::default();

    let config = Self {
      database_url: var("DATABASE_URL").unwrap_or(defaults.database_url),
      port: parse("PORT")?.unwrap_or(defaults.port),
      secret: var("SESSION_SECRET").context("SESSION_SECRET not set")?,
      admin_secret: var("ADMIN_SECRET"),

      initial_allowance_seconds: seconds("INITIAL_ALLOWANCE")?
        .unwrap_or(defaults.initial_allowance_seconds),
      max_session_seconds: seconds("MAX_SESSION")?
        .unwrap_or(defaults.max_session_seconds),
      min_session_seconds: seconds("MIN_SESSION")?
        .unwrap_or(defaults.min_session_seconds),
      warning_thresholds: match var("QUOTA_WARNING_THRESHOLDS") {
        Some(raw) => thresholds(&raw)?,
        None => defaults.warning_thresholds,
      },
      max_concurrent_sessions: parse("MAX_CONCURRENT_SESSIONS")?
        .unwrap_or(defaults.max_concurrent_sessions),

      stale_after: duration("STALE_AFTER")?.unwrap_or(defaults.stale_after),
      replay_tolerance: duration("REPLAY_TOLERANCE")?
        .unwrap_or(defaults.replay_tolerance),
      heartbeat_token_ttl: duration("HEARTBEAT_TOKEN_TTL")?
        .unwrap_or(defaults.heartbeat_token_ttl),
      store_timeout: duration("STORE_TIMEOUT")?
        .unwrap_or(defaults.store_timeout),

      sweep_interval: duration("SWEEP_INTERVAL")?
        .unwrap_or(defaults.sweep_interval),
      reaper_interval: duration("REAPER_INTERVAL")?
        .unwrap_or(defaults.reaper_interval),
      monitor_idle_timeout: duration("MONITOR_IDLE_TIMEOUT")?
        .unwrap_or(defaults.monitor_idle_timeout),
      monitor_close_grace: duration("MONITOR_CLOSE_GRACE")?
        .unwrap_or(defaults.monitor_close_grace),

      realtime: RealtimeConfig {
        api_url: var("REALTIME_API_URL").unwrap_or(defaults.realtime.api_url),
        api_key: var("REALTIME_API_KEY").unwrap_or_default(),
        model: var("REALTIME_MODEL").unwrap_or(defaults.realtime.model),
        voice: var("REALTIME_VOICE").unwrap_or(defaults.realtime.voice),
      },
    };

    config.check()?;
    Ok(config)
  }

  fn check(&self) -> anyhow::Result<()> {
    anyhow::ensure!(
      self.min_session_seconds > 0
        && self.min_session_seconds <= self.max_session_seconds,
      "MIN_SESSION must be positive and not exceed MAX_SESSION"
    );
    anyhow::ensure!(
      self.max_concurrent_sessions > 0,
      "MAX_CONCURRENT_SESSIONS must be positive"
    );

    if self.realtime.api_key.is_empty() {
      warn!("REALTIME_API_KEY not set, session creation will be refused");
    }
    if self.monitor_close_grace < Duration::from_millis(500) {
      warn!("MONITOR_CLOSE_GRACE below 500ms may drop termination notices");
    }
    Ok(())
  }

  pub fn warning_threshold(&self) -> i64 {
    self.warning_thresholds.iter().copied().max().unwrap_or(0)
  }

  pub fn default_limits(&self) -> Limits {
    Limits {
      enabled: true,
      max_concurrent_sessions: self.max_concurrent_sessions,
    }
  }
}

fn var(key: &str) -> Option<String> {
  env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse<T>(key: &str) -> anyhow::Result<Option<T>>
where
  T: FromStr,
  T::Err: std::error::Error + Send + Sync + 'static,
{
  var(key)
    .map(|raw| {
      raw.trim().parse().with_context(|| format!("Invalid {key}: {raw}"))
    })
    .transpose()
}

fn duration(key: &str) -> anyhow::Result<Option<Duration>> {
  var(key)
    .map(|raw| {
      humantime::parse_duration(raw.trim())
        .with_context(|| format!("Invalid {key}: {raw}"))
    })
    .transpose()
}

fn seconds(key: &str) -> anyhow::Result<Option<i64>> {
  Ok(duration(key)?.map(|duration| duration.as_secs() as i64))
}

fn thresholds(raw: &str) -> anyhow::Result<Vec<i64>> {
  let mut thresholds = raw
    .split(',')
    .filter(|s| !s.trim().is_empty())
    .map(|s| {
      s.trim()
        .parse::<i64>()
        .with_context(|| format!("Invalid warning threshold: {s}"))
    })
    .collect::<anyhow::Result<Vec<_>>>()?;

  thresholds.retain(|&threshold| threshold > 0);
  thresholds.sort_unstable_by(|a, b| b.cmp(a));
  thresholds.dedup();
  Ok(thresholds)
}

pub struct Services<'a> {
  pub store: sv::Store<'a>,
  pub usage: sv::Usage<'a>,
  pub realtime: sv::Realtime<'a>,
}

pub struct AppState {
  pub db: DatabaseConnection,
  pub config: Config,
  pub tokens: sv::Tokens,
  pub monitor: Monitor,
  pub locks: Locks,
  pub http: reqwest::Client,
  /// Cancelled once on shutdown; plugins and jobs stop on it
  pub shutdown: CancellationToken,
}

impl AppState {
  pub async fn new(config: Config) -> anyhow::Result<Self> {
    info!("Connecting to database...");
    let db = Database::connect(&config.database_url)
      .await
      .context("Failed to connect to database")?;

    info!("Running migrations...");
    Migrator::up(&db, None).await.context("Failed to run migrations")?;

    Self::with_db(db, config)
  }

  pub fn with_db(
    db: DatabaseConnection,
    config: Config,
  ) -> anyhow::Result<Self> {
    let http = reqwest::Client::builder()
      .timeout(Duration::from_secs(15))
      .build()
      .context("Failed to build HTTP client")?;

    Ok(Self {
      db,
      tokens: sv::Tokens::new(
        config.secret.as_bytes(),
        config.heartbeat_token_ttl,
      ),
      monitor: Monitor::new(
        config.monitor_idle_timeout,
        config.monitor_close_grace,
      ),
      locks: DashMap::new(),
      http,
      shutdown: CancellationToken::new(),
      config,
    })
  }

  pub fn sv(&self) -> Services<'_> {
    let store = sv::Store::new(&self.db);
    Services {
      store,
      usage: sv::Usage::new(
        store,
        &self.tokens,
        &self.config,
        &self.locks,
        &self.monitor,
      ),
      realtime: sv::Realtime::new(&self.http, &self.config.realtime),
    }
  }
}
