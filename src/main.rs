use clap::Parser;
use futures::future::BoxFuture;
use futures::stream::{FuturesOrdered, StreamExt};
use futures::FutureExt;
use order_events::kafka::{
    BrokerTransport, ConnectionPool, DeliveryOutcome, KafkaTransport, MemoryBroker, Publisher,
    TopicManager,
};
use order_events::order::OrderRequest;
use order_events::schema::{HttpRegistry, MemoryRegistry, RegistryTransport, SchemaRegistryClient};
use order_events::{Config, OrderPipeline, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "order-events")]
#[command(about = "Publishes OrderCreated events for newline-delimited JSON orders", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    #[arg(short, long, value_name = "FILE", help = "Read orders from FILE instead of stdin")]
    input: Option<PathBuf>,

    #[arg(long, help = "Use an in-memory registry and broker")]
    dry_run: bool,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,
}

/// One line of output per input line.
#[derive(Debug, Serialize)]
struct Report {
    line: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    order_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    outcome: Option<DeliveryOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl Report {
    fn delivered(line: usize, order_id: String, outcome: DeliveryOutcome) -> Self {
        Self {
            line,
            order_id: Some(order_id),
            outcome: Some(outcome),
            error: None,
        }
    }

    fn rejected(line: usize, order_id: Option<String>, error: String) -> Self {
        Self {
            line,
            order_id,
            outcome: None,
            error: Some(error),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Starting order-events");
    info!("Loading configuration from {:?}", args.config);

    let config = match Config::from_file(&args.config) {
        Ok(cfg) => {
            info!("Configuration loaded successfully");
            cfg
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e);
        }
    };

    let session_id = config
        .kafka
        .producer_session_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    info!(
        kafka_brokers = ?config.kafka.brokers,
        kafka_topic = %config.kafka.topic,
        kafka_acks = ?config.kafka.acks,
        schema_registry = %config.schema_registry.url,
        session = %session_id,
        dry_run = args.dry_run,
        "Configuration summary"
    );

    let (registry, transports): (Arc<dyn RegistryTransport>, Vec<Arc<dyn BrokerTransport>>) =
        if args.dry_run {
            let broker = MemoryBroker::new(config.kafka.topic_partitions.max(1));
            (
                Arc::new(MemoryRegistry::new()) as Arc<dyn RegistryTransport>,
                vec![Arc::new(broker) as Arc<dyn BrokerTransport>],
            )
        } else {
            if config.kafka.create_topic {
                let mut topics = TopicManager::new(
                    &config.kafka.brokers,
                    config.kafka.topic_partitions,
                    config.kafka.replication_factor,
                )?;
                topics.ensure_topic_exists(&config.kafka.topic).await?;
            }
            (
                Arc::new(HttpRegistry::new(&config.schema_registry)?) as Arc<dyn RegistryTransport>,
                KafkaTransport::connect_pool(&config.kafka, &config.publisher, &session_id)?,
            )
        };

    let pool = ConnectionPool::new(transports, config.publisher.max_in_flight_per_connection)?;
    let publisher = Publisher::start(
        config.publisher.clone(),
        config.kafka.topic.clone(),
        session_id,
        pool,
    )
    .await?;
    let registry = Arc::new(SchemaRegistryClient::new(
        &config.schema_registry,
        config.kafka.topic.clone(),
        registry,
    ));
    let pipeline = OrderPipeline::new(registry, publisher.clone())?;

    let input: Box<dyn AsyncRead + Unpin + Send> = match &args.input {
        Some(path) => Box::new(tokio::fs::File::open(path).await?),
        None => Box::new(tokio::io::stdin()),
    };

    tokio::select! {
        result = process(&pipeline, input) => {
            if let Err(e) = result {
                error!("Stopped reading orders: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, draining publisher");
        }
    }

    publisher.shutdown().await;

    let stats = publisher.tracker().stats();
    info!(
        succeeded = stats.succeeded,
        failed = stats.failed,
        "order-events finished"
    );
    Ok(())
}

/// Submits each input line in order and prints reports in the same order.
async fn process<R: AsyncRead + Unpin>(pipeline: &OrderPipeline, input: R) -> Result<()> {
    let mut lines = BufReader::new(input).lines();
    let mut reports: FuturesOrdered<BoxFuture<'static, Report>> = FuturesOrdered::new();
    let mut line_no = 0;

    loop {
        tokio::select! {
            Some(report) = reports.next(), if !reports.is_empty() => emit(&report)?,
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                line_no += 1;
                if line.trim().is_empty() {
                    continue;
                }

                let report = match serde_json::from_str::<OrderRequest>(&line) {
                    Err(e) => {
                        warn!(line = line_no, "Skipping unparseable order: {}", e);
                        std::future::ready(Report::rejected(line_no, None, format!("invalid order JSON: {}", e))).boxed()
                    }
                    Ok(request) => {
                        let order_id = request.order_id.clone();
                        match pipeline.submit(request).await {
                            Ok(handle) => {
                                let line = line_no;
                                async move { Report::delivered(line, order_id, handle.await) }.boxed()
                            }
                            Err(e) => std::future::ready(Report::rejected(line_no, Some(order_id), e.to_string())).boxed(),
                        }
                    }
                };
                reports.push_back(report);
            }
        }
    }

    while let Some(report) = reports.next().await {
        emit(&report)?;
    }
    Ok(())
}

fn emit(report: &Report) -> Result<()> {
    println!("{}", serde_json::to_string(report)?);
    Ok(())
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("order_events=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("order_events=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
