use crate::{
    broker::{ChannelNames, NatsSettings, RetryPolicy},
    correlator::CorrelatorConfig,
    dispatch::DispatchLimits,
    telemetry::LogFormat,
    transport::Compression,
    worker::WorkerConfig,
};
use anyhow::bail;
use clap::{Parser, Subcommand};
use core::time::Duration;

/// Runtime configuration for the `sentiment-dispatch` binary.
///
/// Every setting can come from a CLI flag or an environment variable (a
/// `.env` file is loaded first). Defaults target a local engine on
/// `127.0.0.1:50051` and a local NATS server.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "sentiment-dispatch",
    version,
    about = "Dispatch sentiment analysis synchronously, through a broker, or as a streamed batch"
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// Console log layout.
    ///
    /// Environment variable: `LOG_FORMAT`
    #[arg(long, global = true, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Compact)]
    pub log_format: LogFormat,

    /// Language tag sent with every request.
    ///
    /// Environment variable: `ANALYSIS_LANGUAGE`
    #[arg(long, global = true, env = "ANALYSIS_LANGUAGE", default_value_t = String::from("en"))]
    pub language: String,

    /// Address of the analysis engine.
    ///
    /// Environment variable: `ENGINE_ADDR`
    #[arg(long, global = true, env = "ENGINE_ADDR", default_value_t = String::from("http://127.0.0.1:50051"))]
    pub engine_addr: String,

    /// Upper bound on establishing the engine connection, in milliseconds.
    ///
    /// Environment variable: `ENGINE_CONNECT_TIMEOUT_MS`
    #[arg(long, global = true, env = "ENGINE_CONNECT_TIMEOUT_MS", default_value_t = 5_000)]
    pub engine_connect_timeout_ms: u64,

    /// Deadline applied to each sync call, batch, and worker engine call, in
    /// milliseconds. `0` disables the deadline.
    ///
    /// Environment variable: `CALL_TIMEOUT_MS`
    #[arg(long, global = true, env = "CALL_TIMEOUT_MS", default_value_t = 30_000)]
    pub call_timeout_ms: u64,

    /// Compression applied to engine requests.
    ///
    /// Environment variable: `ENGINE_COMPRESSION`
    #[arg(long, global = true, env = "ENGINE_COMPRESSION", value_enum, default_value_t = Compression::None)]
    pub compression: Compression,

    /// Capacity of the outbound request buffer on the batch stream.
    ///
    /// Environment variable: `STREAM_BUFFER_SIZE`
    #[arg(long, global = true, env = "STREAM_BUFFER_SIZE", default_value_t = 16)]
    pub stream_buffer_size: usize,

    /// Number of unary fallback calls in flight when a batch stream fails.
    ///
    /// Environment variable: `FALLBACK_CONCURRENCY`
    #[arg(long, global = true, env = "FALLBACK_CONCURRENCY", default_value_t = 4)]
    pub fallback_concurrency: usize,

    /// Maximum number of texts accepted in one batch.
    ///
    /// Environment variable: `MAX_BATCH_SIZE`
    #[arg(long, global = true, env = "MAX_BATCH_SIZE", default_value_t = 100)]
    pub max_batch_size: usize,

    /// NATS server URL.
    ///
    /// Environment variable: `NATS_URL`
    #[arg(long, global = true, env = "NATS_URL", default_value_t = String::from("nats://127.0.0.1:4222"))]
    pub nats_url: String,

    /// Subject tasks are published on.
    ///
    /// Environment variable: `TASK_SUBJECT`
    #[arg(long, global = true, env = "TASK_SUBJECT", default_value_t = String::from("sentiment.tasks"))]
    pub task_subject: String,

    /// Subject results are published on.
    ///
    /// Environment variable: `RESULT_SUBJECT`
    #[arg(long, global = true, env = "RESULT_SUBJECT", default_value_t = String::from("sentiment.results"))]
    pub result_subject: String,

    /// JetStream stream backing the task subject.
    ///
    /// Environment variable: `TASK_STREAM`
    #[arg(long, global = true, env = "TASK_STREAM", default_value_t = String::from("SENTIMENT_TASKS"))]
    pub task_stream: String,

    /// JetStream stream backing the result subject.
    ///
    /// Environment variable: `RESULT_STREAM`
    #[arg(long, global = true, env = "RESULT_STREAM", default_value_t = String::from("SENTIMENT_RESULTS"))]
    pub result_stream: String,

    /// Durable consumer shared by task workers.
    ///
    /// Environment variable: `TASK_CONSUMER`
    #[arg(long, global = true, env = "TASK_CONSUMER", default_value_t = String::from("sentiment-workers"))]
    pub task_consumer: String,

    /// Name prefix of the consumer each correlating process reads results
    /// through. A unique suffix is appended per process.
    ///
    /// Environment variable: `RESULT_CONSUMER`
    #[arg(long, global = true, env = "RESULT_CONSUMER", default_value_t = String::from("sentiment-correlator"))]
    pub result_consumer: String,

    /// Number of broker connection attempts before giving up.
    ///
    /// Environment variable: `BROKER_CONNECT_ATTEMPTS`
    #[arg(long, global = true, env = "BROKER_CONNECT_ATTEMPTS", default_value_t = 5)]
    pub broker_connect_attempts: u32,

    /// Retry step in milliseconds. Attempt `n` waits `n * step` before the
    /// next try.
    ///
    /// Environment variable: `BROKER_RETRY_STEP_MS`
    #[arg(long, global = true, env = "BROKER_RETRY_STEP_MS", default_value_t = 2_000)]
    pub broker_retry_step_ms: u64,

    /// How long an async task may wait for its result, in seconds.
    ///
    /// Environment variable: `TASK_TIMEOUT_SECS`
    #[arg(long, global = true, env = "TASK_TIMEOUT_SECS", default_value_t = 300)]
    pub task_timeout_secs: u64,

    /// How often pending tasks are checked for expiry, in seconds.
    ///
    /// Environment variable: `EVICTION_INTERVAL_SECS`
    #[arg(long, global = true, env = "EVICTION_INTERVAL_SECS", default_value_t = 5)]
    pub eviction_interval_secs: u64,

    /// Number of concurrent task handlers in `worker` mode.
    ///
    /// Environment variable: `WORKER_CONCURRENCY`
    #[arg(long, global = true, env = "WORKER_CONCURRENCY", default_value_t = 4)]
    pub worker_concurrency: usize,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Classify one text with a direct engine call.
    Analyze { text: String },
    /// Publish one text to the task channel and print its request id.
    Submit {
        text: String,
        /// Wait for the result and print it instead of the request id.
        #[arg(long, default_value_t = false)]
        wait: bool,
    },
    /// Classify many texts over one engine stream.
    Batch {
        #[arg(required = true)]
        texts: Vec<String>,
    },
    /// Consume the task channel until interrupted.
    Worker,
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub command: Command,
    pub log_format: LogFormat,
    pub language: String,
    pub engine_addr: String,
    pub engine_connect_timeout: Duration,
    pub call_timeout: Option<Duration>,
    pub compression: Compression,
    pub stream_buffer_size: usize,
    pub limits: DispatchLimits,
    pub nats: NatsSettings,
    pub correlator: CorrelatorConfig,
    pub worker: WorkerConfig,
}

impl TryFrom<CliArgs> for DispatchConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        for (name, value) in [
            ("STREAM_BUFFER_SIZE", args.stream_buffer_size),
            ("FALLBACK_CONCURRENCY", args.fallback_concurrency),
            ("MAX_BATCH_SIZE", args.max_batch_size),
            ("WORKER_CONCURRENCY", args.worker_concurrency),
        ] {
            if value == 0 {
                bail!("{name} must be greater than 0");
            }
        }

        if args.broker_connect_attempts == 0 {
            bail!("BROKER_CONNECT_ATTEMPTS must be greater than 0");
        }

        if args.task_timeout_secs == 0 {
            bail!("TASK_TIMEOUT_SECS must be greater than 0");
        }

        if args.eviction_interval_secs == 0 {
            bail!("EVICTION_INTERVAL_SECS must be greater than 0");
        }

        if let Command::Batch { texts } = &args.command {
            if texts.len() > args.max_batch_size {
                bail!(
                    "batch of {} texts exceeds MAX_BATCH_SIZE ({})",
                    texts.len(),
                    args.max_batch_size
                );
            }
        }

        let call_timeout =
            (args.call_timeout_ms > 0).then(|| Duration::from_millis(args.call_timeout_ms));

        let nats = NatsSettings {
            url: args.nats_url,
            retry: RetryPolicy {
                attempts: args.broker_connect_attempts,
                step: Duration::from_millis(args.broker_retry_step_ms),
            },
            tasks: ChannelNames {
                subject: args.task_subject,
                stream: args.task_stream,
                consumer: args.task_consumer,
            },
            results: ChannelNames {
                subject: args.result_subject,
                stream: args.result_stream,
                consumer: args.result_consumer,
            },
            ..NatsSettings::default()
        };

        Ok(Self {
            command: args.command,
            log_format: args.log_format,
            language: args.language,
            engine_addr: args.engine_addr,
            engine_connect_timeout: Duration::from_millis(args.engine_connect_timeout_ms),
            call_timeout,
            compression: args.compression,
            stream_buffer_size: args.stream_buffer_size,
            limits: DispatchLimits {
                max_batch_size: args.max_batch_size,
                fallback_concurrency: args.fallback_concurrency,
            },
            nats,
            correlator: CorrelatorConfig {
                task_timeout: Duration::from_secs(args.task_timeout_secs),
                eviction_interval: Duration::from_secs(args.eviction_interval_secs),
                ..CorrelatorConfig::default()
            },
            worker: WorkerConfig {
                concurrency: args.worker_concurrency,
                call_timeout,
                ..WorkerConfig::default()
            },
        })
    }
}
