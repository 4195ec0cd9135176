//! postbox - delivers signup emails queued by the user service.
//!
//! Usage:
//!
//! ```text
//! postbox [CONFIG]                              run consumers and the sweeper
//! postbox welcome USER_ID NAME EMAIL [CONFIG]   create and queue a welcome email
//! ```

mod config;
mod shutdown;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info, info_span, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use postbox_core::{
    BrokerChannel, Consumer, EmailProcessor, MemoryBroker, Publisher, SignupMailer, SmtpSender,
    SqliteBroker, SqliteEmailStore, Sweeper, WelcomeEmailData,
};

use config::{BrokerKind, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "postbox=info,postbox_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.split_first() {
        Some((command, rest)) if command == "welcome" => enqueue_welcome(rest).await,
        _ => run(args.first().map(Path::new)).await,
    }
}

/// The queue the process talks to.
enum Broker {
    Memory(MemoryBroker),
    Sqlite(SqliteBroker),
}

impl Broker {
    async fn open(config: &Config) -> anyhow::Result<Self> {
        let options = config.queue_options();
        match config.broker.kind {
            BrokerKind::Memory => {
                warn!("using in-memory broker, queued messages are lost on exit");
                Ok(Self::Memory(MemoryBroker::new(options)))
            }
            BrokerKind::Sqlite => {
                let broker = SqliteBroker::connect_with_retry(
                    &config.broker.path,
                    options,
                    config.broker.connect_attempts,
                )
                .await
                .with_context(|| format!("failed to connect to broker at {}", config.broker.path))?;
                Ok(Self::Sqlite(broker))
            }
        }
    }

    /// Open a channel for one role (publisher or one consumer).
    fn channel(&self) -> Arc<dyn BrokerChannel> {
        match self {
            Self::Memory(broker) => Arc::new(broker.channel()),
            Self::Sqlite(broker) => Arc::new(broker.channel()),
        }
    }

    async fn close(&self) {
        match self {
            Self::Memory(broker) => broker.close().await,
            Self::Sqlite(broker) => broker.shutdown().await,
        }
    }
}

async fn open_store(config: &Config) -> anyhow::Result<Arc<SqliteEmailStore>> {
    let store = SqliteEmailStore::new(&config.database.path)
        .await
        .with_context(|| format!("failed to open email store at {}", config.database.path))?;
    Ok(Arc::new(store))
}

async fn run(config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = Config::load(config_path)?;
    info!(
        database = %config.database.path,
        queue = %config.broker.queue,
        consumers = config.worker.consumers,
        "starting postbox"
    );

    let store = open_store(&config).await?;
    let broker = Broker::open(&config).await?;
    let sender = SmtpSender::new(&config.smtp_settings()).context("failed to configure SMTP")?;

    let processor = EmailProcessor::new(store.clone(), Arc::new(sender))
        .with_send_timeout(Duration::from_secs(config.worker.send_timeout_secs));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();
    let mut channels = Vec::with_capacity(config.worker.consumers);

    for worker in 0..config.worker.consumers {
        let channel = broker.channel();
        channels.push(channel.clone());

        let consumer = Consumer::new(channel, processor.clone())
            .with_max_redeliveries(config.broker.max_redeliveries)
            .with_processing_timeout(Duration::from_secs(config.worker.processing_timeout_secs));
        let shutdown = shutdown_rx.clone();
        tasks.spawn(
            async move { consumer.run(shutdown).await }.instrument(info_span!("consumer", worker)),
        );
    }

    let sweeper = Sweeper::new(processor)
        .with_interval(Duration::from_secs(config.sweep.interval_secs))
        .with_batch_size(config.sweep.batch_size);
    tasks.spawn(async move { sweeper.run(shutdown_rx).await }.instrument(info_span!("sweeper")));

    shutdown::shutdown_signal().await;
    if shutdown_tx.send(true).is_err() {
        debug!("all workers already stopped");
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "worker task failed");
        }
    }

    for channel in channels {
        channel.close().await;
    }
    broker.close().await;
    store.close().await;

    info!("postbox stopped");
    Ok(())
}

async fn enqueue_welcome(args: &[String]) -> anyhow::Result<()> {
    let [user_id, user_name, user_email, rest @ ..] = args else {
        bail!("usage: postbox welcome USER_ID NAME EMAIL [CONFIG]");
    };

    let config = Config::load(rest.first().map(Path::new))?;
    if config.broker.kind == BrokerKind::Memory {
        warn!("in-memory broker: the message will not outlive this process, the sweeper will deliver the email");
    }

    let store = open_store(&config).await?;
    let broker = Broker::open(&config).await?;
    let channel = broker.channel();
    let mailer = SignupMailer::new(store.clone(), Arc::new(Publisher::new(channel.clone())));

    let data = WelcomeEmailData::new(user_id.as_str(), user_name.as_str(), user_email.as_str());
    let email = mailer
        .welcome(&data)
        .await
        .context("failed to create welcome email")?;
    info!(email_id = %email.id, to = %email.to, "welcome email queued");

    channel.close().await;
    broker.close().await;
    store.close().await;
    Ok(())
}
