//! Periodic background jobs.

use crate::{plugins::Plugin, prelude::*, state::{AppState, Config}};

#[async_trait]
pub trait Job: Send + Sync {
  fn name(&self) -> &'static str;

  fn interval(&self, config: &Config) -> Duration;

  async fn tick(&self, app: &AppState) -> anyhow::Result<()>;
}

/// Runs a [`Job`] on its interval until shutdown. A failed tick is logged
/// and the schedule continues.
pub struct Cron<J>(pub J);

#[async_trait]
impl<J: Job> Plugin for Cron<J> {
  fn name(&self) -> &'static str {
    self.0.name()
  }

  async fn start(&self, app: Arc<AppState>) -> anyhow::Result<()> {
    let mut interval = time::interval(self.0.interval(&app.config));
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    // the first tick completes immediately
    interval.tick().await;

    loop {
      tokio::select! {
        _ = app.shutdown.cancelled() => return Ok(()),
        _ = interval.tick() => {}
      }

      if let Err(err) = self.0.tick(&app).await {
        error!("Job `{}` failed: {err:#}", self.0.name());
      }
    }
  }
}

/// Ends stale, expired and exhausted sessions. Their push channels are
/// terminated as part of ending them.
pub struct SweepSessions;

#[async_trait]
impl Job for SweepSessions {
  fn name(&self) -> &'static str {
    "sweep-sessions"
  }

  fn interval(&self, config: &Config) -> Duration {
    config.sweep_interval
  }

  async fn tick(&self, app: &AppState) -> anyhow::Result<()> {
    let ended = app.sv().usage.cleanup_expired_sessions().await?;
    if !ended.is_empty() {
      info!("Sweep ended {} session(s)", ended.len());
    }
    Ok(())
  }
}

pub struct ReapChannels;

#[async_trait]
impl Job for ReapChannels {
  fn name(&self) -> &'static str {
    "reap-channels"
  }

  fn interval(&self, config: &Config) -> Duration {
    config.reaper_interval
  }

  async fn tick(&self, app: &AppState) -> anyhow::Result<()> {
    let reaped = app.monitor.reap_idle();
    if reaped > 0 {
      debug!("Reaped {reaped} idle push channel(s)");
    }
    Ok(())
  }
}
