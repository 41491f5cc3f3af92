//! `producer`: polls the crm or web API and forwards valid records to
//! Firehose, serving `/health` on the side.
use std::{io::Write, net::SocketAddr, time::Duration};

use anyhow::Context;
use aws_config::{BehaviorVersion, Region};
use clap::Parser;
use tokio::sync::watch;

mod health;
mod records;
mod sink;

use records::Service;
use sink::{Api, Firehose};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Which producer to run.
    #[clap(long, env = "SERVICE", value_enum)]
    service: Service,

    /// API to poll. Defaults to the service's public endpoint.
    #[clap(long, env = "API_URL")]
    api_url: Option<String>,

    /// Firehose stream to deliver to. Defaults to `<service>-stream-dev`.
    #[clap(long, env = "STREAM_NAME")]
    stream_name: Option<String>,

    /// Seconds between polls.
    #[clap(long, env = "POLL_INTERVAL", default_value_t = 30)]
    poll_interval: u64,

    /// Consecutive failed cycles before pausing for `retry_delay`.
    #[clap(long, env = "MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Seconds to pause after `max_retries` consecutive failures.
    #[clap(long, env = "RETRY_DELAY", default_value_t = 60)]
    retry_delay: u64,

    #[clap(long, env = "AWS_DEFAULT_REGION", default_value = "eu-west-1")]
    region: String,

    #[clap(long, env = "HEALTH_PORT", default_value_t = 8080)]
    health_port: u16,
}

impl Args {
    fn api_url(&self) -> String {
        self.api_url
            .clone()
            .unwrap_or_else(|| self.service.default_api_url().to_owned())
    }

    fn stream_name(&self) -> String {
        self.stream_name
            .clone()
            .unwrap_or_else(|| format!("{}-stream-dev", self.service))
    }
    /// How long to wait before the next cycle. Resets `failures` once it
    /// reaches `max_retries`.
    fn pause(&self, failures: &mut u32) -> Duration {
        if *failures >= self.max_retries {
            log::error!(
                "{failures} consecutive failures, waiting {}s",
                self.retry_delay
            );
            *failures = 0;
            Duration::from_secs(self.retry_delay)
        } else {
            Duration::from_secs(self.poll_interval)
        }
    }
}

fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stdout)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] [{}] {}",
                chrono::Utc::now().to_rfc3339(),
                record.level(),
                record.args()
            )
        })
        .init();
}

/// Resolves once SIGINT or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("could not listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                log::error!("could not listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => log::info!("received SIGINT"),
        _ = terminate => log::info!("received SIGTERM"),
    }
}

async fn run_cycle(api: &Api, firehose: &Firehose, args: &Args) -> anyhow::Result<usize> {
    let items = api.fetch().await?;
    if items.is_empty() {
        log::info!("no data available in this polling cycle");
        return Ok(0);
    }
    let fetched = items.len();
    let records = records::process(args.service, &args.region, items, chrono::Utc::now());
    log::info!("{} of {fetched} fetched records are valid", records.len());
    if records.is_empty() {
        return Ok(0);
    }
    firehose.send(&records).await
}

/// Run cycles until `shutdown` fires. Returns the number of cycles run.
async fn poll(
    api: Api,
    firehose: Firehose,
    args: &Args,
    mut shutdown: watch::Receiver<bool>,
) -> u64 {
    log::info!(
        "polling {} every {}s into {}",
        api.url(),
        args.poll_interval,
        args.stream_name()
    );
    let mut cycle = 0u64;
    let mut total = 0usize;
    let mut failures = 0u32;
    loop {
        cycle += 1;
        match run_cycle(&api, &firehose, args).await {
            Ok(sent) => {
                total += sent;
                failures = 0;
                log::info!("cycle #{cycle} sent {sent} records");
            }
            Err(e) => {
                failures += 1;
                log::warn!("cycle #{cycle} failed ({failures} in a row): {e:#}");
            }
        }
        let pause = args.pause(&mut failures);
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(pause) => {}
        }
    }
    log::info!("producer stopped after {cycle} cycles, {total} records sent");
    cycle
}

async fn run(args: Args) -> anyhow::Result<()> {
    let sdk_config = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(args.region.clone()))
        .load()
        .await;
    let firehose = Firehose::new(
        aws_sdk_firehose::Client::new(&sdk_config),
        args.stream_name(),
    );
    let api = Api::new(args.api_url())?;

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = tx.send(true);
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], args.health_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind health server to {addr}"))?;
    log::info!("health server listening on {addr}");
    let app = health::router(health::HealthState {
        producer: args.service.producer_name(),
    });
    let mut server_shutdown = rx.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.changed().await;
            })
            .await
    });

    poll(api, firehose, &args, rx).await;
    server
        .await
        .context("health server panicked")?
        .context("health server failed")?;
    Ok(())
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    init_logging();
    let args = Args::parse();
    log::info!("starting {} producer", args.service);
    match run(args).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e:?}");
            std::process::ExitCode::FAILURE
        }
    }
}
