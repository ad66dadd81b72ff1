//! netscope CLI
//!
//! Sends one request through an intercepted client and prints what the
//! recorder captured.
//!
//! Usage:
//!   netscope http://localhost:8080/v1/ping
//!   netscope -X POST -d '{"a":1}' --via hyper --config netscope.yaml http://localhost:8080/items

use anyhow::Context;
use bytes::Bytes;
use clap::{Parser, ValueEnum};
use http_body_util::Full;
use netscope::adapters::hyper::intercepted_client;
use netscope::metrics::collect_metrics;
use netscope::model::{Outcome, Transaction};
use netscope::{Engine, NetscopeConfig, ReqwestInterceptExt};
use std::sync::Arc;
use std::time::Duration;
use tower::{Service, ServiceExt};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Via {
    Reqwest,
    Hyper,
}

/// Send a request through the netscope interception engine
#[derive(Parser, Debug)]
#[command(name = "netscope")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Request URL
    url: String,

    /// HTTP method
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,

    /// YAML config with mock rules and recorder settings
    #[arg(short, long)]
    config: Option<String>,

    /// Client library to send the request with
    #[arg(long, value_enum, default_value_t = Via::Reqwest)]
    via: Via,

    /// Request body
    #[arg(short = 'd', long)]
    data: Option<String>,

    /// Extra request header, `Name: value` (repeatable)
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,

    /// Request timeout in seconds
    #[arg(short, long, default_value = "30")]
    timeout: u64,

    /// Print recorded transactions as JSON
    #[arg(long)]
    json: bool,

    /// Print Prometheus metrics after the request
    #[arg(long)]
    metrics: bool,

    /// Log filter, used when RUST_LOG is not set
    #[arg(long, env = "NETSCOPE_LOG")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => NetscopeConfig::from_file(path)?,
        None => NetscopeConfig::default(),
    };

    let level = args.log_level.as_deref().unwrap_or(&config.log_level);
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let engine = Engine::from_config(&config).await?;
    let _reaper = engine.spawn_reaper(config.reaper.interval(), config.reaper.grace());

    let headers = parse_headers(&args.headers)?;
    let timeout = Duration::from_secs(args.timeout);
    let sent = match args.via {
        Via::Reqwest => send_reqwest(&engine, &args, &headers, timeout).await,
        Via::Hyper => send_hyper(&engine, &args, &headers, timeout).await,
    };
    if let Err(e) = &sent {
        warn!("Request failed: {:#}", e);
    }

    let transactions = engine.recorder().snapshot();
    if args.json {
        println!("{}", engine.recorder().export_json()?);
    } else {
        for transaction in &transactions {
            print_transaction(transaction);
        }
        if let Ok(body) = &sent {
            println!();
            println!("{}", String::from_utf8_lossy(body));
        }
    }

    if args.metrics {
        println!("{}", collect_metrics());
    }

    sent.map(|_| ())
}

fn parse_headers(raw: &[String]) -> Result<Vec<(String, String)>, anyhow::Error> {
    raw.iter()
        .map(|h| {
            let (name, value) = h
                .split_once(':')
                .with_context(|| format!("Header '{h}' must look like 'Name: value'"))?;
            Ok((name.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

async fn send_reqwest(
    engine: &Arc<Engine>,
    args: &Args,
    headers: &[(String, String)],
    timeout: Duration,
) -> Result<Bytes, anyhow::Error> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()?
        .intercepted(Arc::clone(engine))
        .with_name("netscope-cli/reqwest");

    let method = reqwest::Method::from_bytes(args.method.as_bytes())
        .with_context(|| format!("Invalid method '{}'", args.method))?;
    let mut builder = client.request(method, &args.url);
    for (name, value) in headers {
        builder = builder.header(name, value);
    }
    if let Some(data) = &args.data {
        builder = builder.body(data.clone());
    }

    let response = client.send(builder).await?;
    debug!("reqwest response status {}", response.status());
    Ok(response.bytes().await?)
}

async fn send_hyper(
    engine: &Arc<Engine>,
    args: &Args,
    headers: &[(String, String)],
    timeout: Duration,
) -> Result<Bytes, anyhow::Error> {
    let mut service = intercepted_client(Arc::clone(engine))?;

    let mut builder = hyper::Request::builder()
        .method(args.method.as_str())
        .uri(args.url.as_str());
    for (name, value) in headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    let body = args.data.clone().map(Bytes::from).unwrap_or_default();
    let request = builder.body(Full::new(body)).context("Invalid request")?;

    let call = async {
        let ready = service.ready().await.map_err(|e| anyhow::anyhow!(e))?;
        ready.call(request).await.map_err(|e| anyhow::anyhow!(e))
    };
    let response = tokio::time::timeout(timeout, call)
        .await
        .context("Request timed out")??;
    debug!("hyper response status {}", response.status());

    let bytes = http_body_util::BodyExt::collect(response.into_body())
        .await
        .map_err(|e| anyhow::anyhow!(e))?
        .to_bytes();
    Ok(bytes)
}

fn print_transaction(transaction: &Transaction) {
    let request = &transaction.request;
    println!(
        "#{} [{}] {} {}",
        transaction.id,
        transaction.adapter,
        request.method(),
        request.url()
    );
    if let Some(mock) = &transaction.mock {
        println!("    mock: rule '{}' -> {}", mock.rule_id, mock.dialed_url);
    }
    match &transaction.outcome {
        Outcome::Pending => println!("    pending"),
        Outcome::Response(response) => println!(
            "    {} ({} bytes, {} ms)",
            response.status(),
            response.body_bytes().len(),
            response.timing().duration().as_millis()
        ),
        Outcome::Error(failure) => println!("    {}", failure),
    }
}
