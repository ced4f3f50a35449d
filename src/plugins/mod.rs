pub mod cron;
pub mod server;

use tokio::task::JoinHandle;

use crate::{prelude::*, state::AppState};

#[async_trait]
pub trait Plugin: Send + Sync {
  fn name(&self) -> &'static str {
    std::any::type_name::<Self>()
  }

  async fn start(&self, app: Arc<AppState>) -> anyhow::Result<()>;
}

pub struct App {
  plugins: Vec<Arc<dyn Plugin>>,
}

impl App {
  pub fn new() -> Self {
    Self { plugins: Vec::new() }
  }

  pub fn register<P: Plugin + 'static>(mut self, plugin: P) -> Self {
    self.plugins.push(Arc::new(plugin));
    self
  }

  /// Supervises every plugin, restarting it after a crash until shutdown.
  pub fn run(self, app: Arc<AppState>) -> Vec<JoinHandle<()>> {
    self
      .plugins
      .into_iter()
      .map(|plugin| tokio::spawn(supervise(plugin, app.clone())))
      .collect()
  }
}

async fn supervise(plugin: Arc<dyn Plugin>, app: Arc<AppState>) {
  let name = plugin.name();
  info!("SYSTEM: Service `{name}` initialized");

  loop {
    let handle = tokio::spawn({
      let (app, plugin) = (app.clone(), plugin.clone());
      async move { plugin.start(app).await }
    });

    match handle.await {
      Ok(Ok(())) if app.shutdown.is_cancelled() => {
        info!("Service `{name}` shutdown.");
        break;
      }
      Ok(Ok(())) => {
        warn!("Service `{name}` stopped unexpectedly (Ok).");
      }
      Ok(Err(err)) => {
        error!("Service `{name}` crashed with error: {err:#}.");
      }
      Err(join_err) if join_err.is_cancelled() => {
        info!("Service `{name}` shutdown.");
        break;
      }
      Err(_) => {
        error!("Service `{name}` PANICKED!");
      }
    }

    tokio::select! {
      _ = app.shutdown.cancelled() => break,
      _ = time::sleep(Duration::from_secs(5)) => {}
    }
    info!("SYSTEM: Restarting service `{name}`...");
  }
}
