//! # SQS Listener CLI
//!
//! Command-line runner for listener containers.
//!
//! - `run` listens on one or more queues and logs every payload it receives
//! - `config` validates the resolved configuration and optionally prints it

use async_trait::async_trait;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use sqs_listener_core::{
    ConfigurationError, ContainerError, ContainerOptions, EventBridgeMessageConverter,
    InMemoryBackend, JsonMessageConverter, ListenerSettings, Message, MessageConverter,
    MessageListener, MessageListenerContainer, ProcessingError, QueueBackend, QueueName,
    ShutdownReport, SnsMessageConverter, SqsBackend, StringMessageConverter,
};
use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;

// ============================================================================
// CLI Structure
// ============================================================================

/// SQS listener - poll queues and process messages with backpressure
#[derive(Parser, Debug)]
#[command(name = "sqs-listener")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Poll SQS queues and process messages with backpressure")]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "SQS_LISTENER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Logging level or filter directive
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    pub json_logs: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Listen on queues until Ctrl-C
    Run(RunArgs),

    /// Validate configuration
    Config {
        /// Show resolved configuration
        #[arg(short, long)]
        show: bool,
    },
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Queue name or URL; repeat for several queues. Overrides the
    /// configured queues.
    #[arg(short, long = "queue")]
    pub queues: Vec<String>,

    /// How message bodies are decoded
    #[arg(long, value_enum, default_value = "raw")]
    pub converter: ConverterKind,

    /// Override for the SQS endpoint
    #[arg(long)]
    pub endpoint_url: Option<String>,

    /// Use an in-memory backend instead of SQS
    #[arg(long)]
    pub in_memory: bool,

    /// Messages to enqueue per queue when running in memory
    #[arg(long, default_value = "0")]
    pub seed: usize,

    /// Stop after this many seconds instead of waiting for Ctrl-C
    #[arg(long)]
    pub duration_seconds: Option<u64>,
}

/// Payload decoding
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ConverterKind {
    /// Body as text
    Raw,
    /// Body as JSON
    Json,
    /// SNS notification, message as text
    Sns,
    /// EventBridge event, detail as JSON
    Eventbridge,
}

// ============================================================================
// CLI Error Types
// ============================================================================

/// CLI-specific errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Container error: {0}")]
    Container(#[from] ContainerError),

    #[error("Invalid argument: {arg} - {message}")]
    InvalidArgument { arg: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(_) => 1,
            Self::Container(_) => 2,
            Self::InvalidArgument { .. } => 3,
            Self::Io(_) => 4,
        }
    }
}

// ============================================================================
// Listener
// ============================================================================

/// Logs every payload and counts them
#[derive(Debug, Default)]
pub struct LoggingListener {
    received: AtomicUsize,
}

impl LoggingListener {
    pub fn received(&self) -> usize {
        self.received.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<T: Debug + Send + Sync> MessageListener<T> for LoggingListener {
    async fn on_message(&self, message: &Message<T>) -> Result<(), ProcessingError> {
        self.received.fetch_add(1, Ordering::SeqCst);
        info!(
            queue = %message.envelope().queue,
            message_id = %message.message_id(),
            sequence = message.envelope().sequence,
            payload = ?message.payload(),
            "Received message"
        );
        Ok(())
    }
}

// ============================================================================
// Entry Points
// ============================================================================

/// Parse arguments, install logging and run the selected command
pub async fn run_cli() -> Result<(), CliError> {
    let cli = Cli::parse();
    initialize_logging(&cli)?;
    run(cli).await
}

pub async fn run(cli: Cli) -> Result<(), CliError> {
    let settings = ListenerSettings::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run(args) => {
            execute_run_command(settings, args).await?;
            Ok(())
        }
        Commands::Config { show } => execute_config_command(&settings, show),
    }
}

fn initialize_logging(cli: &Cli) -> Result<(), CliError> {
    let filter = EnvFilter::try_new(&cli.log_level).map_err(|e| CliError::InvalidArgument {
        arg: "log-level".to_string(),
        message: e.to_string(),
    })?;

    tracing_subscriber::registry()
        .with(filter)
        .with(cli.json_logs.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!cli.json_logs).then(|| tracing_subscriber::fmt::layer()))
        .try_init()
        .map_err(|e| CliError::InvalidArgument {
            arg: "log-level".to_string(),
            message: e.to_string(),
        })
}

// ============================================================================
// Commands
// ============================================================================

fn execute_config_command(settings: &ListenerSettings, show: bool) -> Result<(), CliError> {
    info!(queues = settings.queues.len(), "Configuration is valid");

    if show {
        let rendered = serde_json::to_string_pretty(settings).map_err(std::io::Error::from)?;
        println!("{}", rendered);
    }
    Ok(())
}

/// Listen until Ctrl-C or the requested duration elapses
pub async fn execute_run_command(
    mut settings: ListenerSettings,
    args: RunArgs,
) -> Result<ShutdownReport, CliError> {
    if !args.queues.is_empty() {
        settings.queues = args.queues.clone();
    }
    if args.endpoint_url.is_some() {
        settings.endpoint_url = args.endpoint_url.clone();
    }

    let queues = settings.queue_names().map_err(ConfigurationError::from)?;
    if queues.is_empty() {
        return Err(CliError::InvalidArgument {
            arg: "queue".to_string(),
            message: "at least one queue is required".to_string(),
        });
    }

    let options = settings.to_options();
    options.validate().map_err(ConfigurationError::from)?;

    let backend: Arc<dyn QueueBackend> = if args.in_memory {
        let backend = InMemoryBackend::default();
        for queue in &queues {
            backend.create_queue(queue);
            for index in 0..args.seed {
                backend.send_message(queue, demo_payload(args.converter, queue, index));
            }
        }
        info!(queues = queues.len(), seeded = args.seed, "Using in-memory backend");
        Arc::new(backend)
    } else {
        Arc::new(SqsBackend::from_env(settings.endpoint_url.as_deref()).await)
    };

    let duration = args.duration_seconds.map(Duration::from_secs);
    match args.converter {
        ConverterKind::Raw => {
            listen::<String>(Arc::new(StringMessageConverter), backend, queues, options, duration)
                .await
        }
        ConverterKind::Json => {
            listen::<Value>(
                Arc::new(JsonMessageConverter::<Value>::new()),
                backend,
                queues,
                options,
                duration,
            )
            .await
        }
        ConverterKind::Sns => {
            listen::<String>(
                Arc::new(SnsMessageConverter::new(StringMessageConverter)),
                backend,
                queues,
                options,
                duration,
            )
            .await
        }
        ConverterKind::Eventbridge => {
            listen::<Value>(
                Arc::new(EventBridgeMessageConverter::new(JsonMessageConverter::<Value>::new())),
                backend,
                queues,
                options,
                duration,
            )
            .await
        }
    }
}

async fn listen<T>(
    converter: Arc<dyn MessageConverter<T>>,
    backend: Arc<dyn QueueBackend>,
    queues: Vec<QueueName>,
    options: ContainerOptions,
    duration: Option<Duration>,
) -> Result<ShutdownReport, CliError>
where
    T: Debug + Send + Sync + 'static,
{
    let listener = Arc::new(LoggingListener::default());
    let mut container = MessageListenerContainer::builder(backend, converter, listener.clone())
        .queues(queues)
        .options(options)
        .build();

    container.start().await?;
    info!("Listening, press Ctrl-C to stop");

    wait_for_shutdown(duration).await;

    let report = container.stop().await?;
    info!(
        received = listener.received(),
        deleted = report.stats.deleted,
        drained_in_time = report.drained_in_time,
        "Listener finished"
    );
    Ok(report)
}

async fn wait_for_shutdown(duration: Option<Duration>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Could not listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    match duration {
        Some(duration) => {
            tokio::select! {
                _ = ctrl_c => info!("Ctrl-C received"),
                _ = tokio::time::sleep(duration) => info!(seconds = duration.as_secs(), "Run duration elapsed"),
            }
        }
        None => {
            ctrl_c.await;
            info!("Ctrl-C received");
        }
    }
}

/// Sample body for the in-memory backend in the shape `converter` expects
pub fn demo_payload(converter: ConverterKind, queue: &QueueName, index: usize) -> String {
    let text = format!("message {} for {}", index, queue);

    match converter {
        ConverterKind::Raw => text,
        ConverterKind::Json => json!({ "queue": queue.as_str(), "index": index }).to_string(),
        ConverterKind::Sns => json!({
            "Type": "Notification",
            "MessageId": format!("demo-{}", index),
            "TopicArn": "arn:aws:sns:us-east-1:000000000000:demo",
            "Message": text,
        })
        .to_string(),
        ConverterKind::Eventbridge => json!({
            "version": "0",
            "source": "sqs-listener.demo",
            "detail-type": "DemoEvent",
            "detail": { "queue": queue.as_str(), "index": index },
        })
        .to_string(),
    }
}
