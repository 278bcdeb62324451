//! `sealnote listen`

use anyhow::Context;
use clap::Args;
use sealnote_cloud::{
    subscription_path, GcsFetcher, LocalFetcher, PubSubConfig, PubSubSource,
    DEFAULT_PUBSUB_ENDPOINT, DEFAULT_STORAGE_ENDPOINT,
};
use sealnote_core::{ObjectFetcher, OutputSink, Pipeline, PipelineSettings, ReceiverConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Args, Debug)]
pub struct ListenArgs {
    /// PEM private key [default: ~/.sealnote/private_key.pem]
    #[arg(long, env = "SEALNOTE_PRIVATE_KEY")]
    pub private_key: Option<PathBuf>,

    /// Subscription id or full `projects/.../subscriptions/...` path
    #[arg(long, env = "SEALNOTE_SUBSCRIPTION")]
    pub subscription: String,

    /// Project used to expand a bare subscription id
    #[arg(long, env = "GOOGLE_CLOUD_PROJECT")]
    pub project: Option<String>,

    #[arg(long, env = "SEALNOTE_OUTPUT_DIR", default_value = "output")]
    pub output_dir: PathBuf,

    #[arg(long, env = "SEALNOTE_MAX_CONCURRENCY", default_value_t = 4)]
    pub max_concurrency: usize,

    #[arg(long, env = "SEALNOTE_FETCH_TIMEOUT_SECS", default_value_t = 30)]
    pub fetch_timeout_secs: u64,

    #[arg(long, env = "SEALNOTE_DISPATCH_TIMEOUT_SECS", default_value_t = 10)]
    pub dispatch_timeout_secs: u64,

    /// Messages requested per pull, capped at --max-concurrency
    #[arg(long, env = "SEALNOTE_MAX_MESSAGES", default_value_t = 10)]
    pub max_messages: u32,

    /// OAuth bearer token for Cloud Storage and Pub/Sub
    #[arg(long, env = "SEALNOTE_ACCESS_TOKEN", hide_env_values = true)]
    pub access_token: Option<String>,

    #[arg(long, env = "SEALNOTE_STORAGE_ENDPOINT", default_value = DEFAULT_STORAGE_ENDPOINT)]
    pub storage_endpoint: String,

    #[arg(long, env = "SEALNOTE_PUBSUB_ENDPOINT", default_value = DEFAULT_PUBSUB_ENDPOINT)]
    pub pubsub_endpoint: String,

    /// Read objects from `{root}/{bucket}/{name}` instead of Cloud Storage
    #[arg(long, env = "SEALNOTE_STORAGE_ROOT")]
    pub storage_root: Option<PathBuf>,
}

impl ListenArgs {
    fn receiver_config(&self) -> ReceiverConfig {
        ReceiverConfig {
            private_key_path: self.private_key.clone().unwrap_or_else(default_key_path),
            subscription: self.subscription.clone(),
            output_dir: self.output_dir.clone(),
            settings: PipelineSettings {
                max_concurrency: self.max_concurrency,
                fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
                dispatch_timeout: Duration::from_secs(self.dispatch_timeout_secs),
                ..PipelineSettings::default()
            },
        }
    }

    /// Never pull more than the workers can start: buffered messages sit
    /// unleased and Pub/Sub would redeliver them while they wait.
    fn pull_batch(&self) -> u32 {
        let workers = u32::try_from(self.max_concurrency).unwrap_or(u32::MAX);
        self.max_messages.min(workers).max(1)
    }

    fn fetcher(&self) -> Arc<dyn ObjectFetcher> {
        match &self.storage_root {
            Some(root) => {
                tracing::info!(root = %root.display(), "reading objects from local directory");
                Arc::new(LocalFetcher::new(root))
            }
            None => Arc::new(GcsFetcher::new(
                self.storage_endpoint.clone(),
                self.access_token.clone(),
            )),
        }
    }
}

fn default_key_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_default()
        .join(".sealnote")
        .join("private_key.pem")
}

pub async fn run(args: ListenArgs) -> anyhow::Result<()> {
    let config = args.receiver_config();
    config.validate().context("Invalid configuration")?;

    let key = config.load_key().context("Failed to load private key")?;
    tracing::info!(bits = key.bits(), path = %config.private_key_path.display(), "private key loaded");

    let subscription = subscription_path(args.project.as_deref(), &args.subscription)?;
    let source = PubSubSource::new(PubSubConfig {
        endpoint: args.pubsub_endpoint.clone(),
        subscription: subscription.clone(),
        access_token: args.access_token.clone(),
        max_messages: args.pull_batch(),
    });

    let pipeline = Arc::new(Pipeline::new(
        args.fetcher(),
        key,
        OutputSink::new(&config.output_dir),
        config.settings.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("interrupt received, finishing in-flight notes");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => tracing::warn!(error = %e, "cannot listen for interrupts"),
        }
    });

    tracing::info!(
        subscription = %subscription,
        output = %config.output_dir.display(),
        "receiver started"
    );
    let summary = pipeline.run(source, shutdown_rx).await;

    if summary.panicked > 0 {
        anyhow::bail!("{} notification workers panicked", summary.panicked);
    }
    Ok(())
}
