//! Drival usage server: meters realtime voice sessions against monthly quotas.

mod entity;
mod error;
mod monitor;
mod plugins;
mod prelude;
mod state;
mod sv;
mod utils;

use tracing_subscriber::{
  EnvFilter, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::{
  plugins::{
    App,
    cron::{Cron, ReapChannels, SweepSessions},
  },
  prelude::*,
  state::{AppState, Config},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  dotenvy::dotenv().ok();

  tracing_subscriber::registry()
    .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
      "drival=debug,tower_http=debug,axum=trace,sea_orm=warn".into()
    }))
    .with(tracing_subscriber::fmt::layer())
    .init();

  info!("Starting Drival usage server v{}", env!("CARGO_PKG_VERSION"));

  let config = Config::from_env()?;
  let app = Arc::new(AppState::new(config).await?);

  let handles = App::new()
    .register(plugins::server::Plugin)
    .register(Cron(SweepSessions))
    .register(Cron(ReapChannels))
    .run(app.clone());

  tokio::signal::ctrl_c().await.context("Failed to listen for ctrl-c")?;
  info!("Shutting down...");

  let closed = app.monitor.shutdown();
  info!("Notified {closed} push channel(s)");
  app.shutdown.cancel();

  // let the close frames go out before the runtime stops
  time::sleep(app.config.monitor_close_grace).await;
  if time::timeout(Duration::from_secs(10), futures::future::join_all(handles))
    .await
    .is_err()
  {
    warn!("Services did not stop in time");
  }

  Ok(())
}
