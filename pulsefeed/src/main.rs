use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pulsefeed::api::{ApiServer, ApiServerConfig};
use pulsefeed::output::{batch_line, body_text, response_line, stream_event_line};
use pulsefeed_client::{
    ApiClient, BatchRequest, ClientConfig, ReconnectPolicy, RequestOptions, StreamOptions,
    Subscription,
};

#[derive(Parser)]
#[command(name = "pulsefeed")]
#[command(about = "Caching, request-coalescing client for upstream data APIs", long_about = None)]
struct Cli {
    /// Base URL for relative endpoints (overrides PULSEFEED_BASE_URL)
    #[arg(short, long, global = true)]
    base_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch an endpoint through the cache
    Get {
        endpoint: String,

        /// Cache tag for the stored response
        #[arg(long)]
        tag: Vec<String>,

        /// Cache lifetime in milliseconds
        #[arg(long)]
        ttl_ms: Option<u64>,

        /// Issue the request this many times; repeats are served from cache
        #[arg(long, default_value = "1")]
        repeat: u32,

        /// Print only the status line
        #[arg(short, long)]
        quiet: bool,
    },

    /// Fetch several endpoints concurrently
    Batch {
        #[arg(required = true)]
        endpoints: Vec<String>,
    },

    /// Print server-sent events until interrupted
    Stream {
        url: String,

        /// Reconnect with backoff when the stream drops
        #[arg(long)]
        reconnect: bool,
    },

    /// Print WebSocket messages until interrupted
    Socket {
        url: String,

        /// Text frames to send once connected
        #[arg(long)]
        send: Vec<String>,

        /// Reconnect with backoff when the socket drops
        #[arg(long)]
        reconnect: bool,
    },

    /// Start the HTTP gateway
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Port to bind to
        #[arg(short, long, default_value = "8080")]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "pulsefeed=info,pulsefeed_client=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let mut config = ClientConfig::from_env().context("invalid PULSEFEED_* configuration")?;
    if let Some(base_url) = cli.base_url {
        config.base_url = Some(base_url);
    }

    match cli.command {
        Commands::Get {
            endpoint,
            tag,
            ttl_ms,
            repeat,
            quiet,
        } => {
            let client = ApiClient::new(config)?;
            let mut options = RequestOptions::new();
            for tag in tag {
                options = options.tag(tag);
            }
            if let Some(ms) = ttl_ms {
                options = options.ttl(Duration::from_millis(ms));
            }

            for _ in 0..repeat.max(1) {
                let response = client
                    .get(&endpoint, options.clone())
                    .await
                    .with_context(|| format!("GET {} failed", endpoint))?;
                println!("{}", response_line(&endpoint, &response));
                if !quiet {
                    println!("{}", body_text(&response));
                }
            }

            if repeat > 1 {
                println!("{}", client.metrics().await);
            }
        }

        Commands::Batch { endpoints } => {
            let client = ApiClient::new(config)?;
            let requests = endpoints
                .iter()
                .map(|endpoint| BatchRequest::from(endpoint.as_str()))
                .collect();
            let results = client.batch(requests).await;

            let failed = results.iter().filter(|r| r.is_err()).count();
            for (index, (endpoint, result)) in endpoints.iter().zip(&results).enumerate() {
                println!("{}", batch_line(index, endpoint, result));
            }
            println!("{} succeeded, {} failed", results.len() - failed, failed);
        }

        Commands::Stream { url, reconnect } => {
            let client = ApiClient::new(config)?;
            let subscription = client.stream(&url, stream_options(reconnect)).await?;
            print_until_interrupted(subscription).await;
        }

        Commands::Socket {
            url,
            send,
            reconnect,
        } => {
            let client = ApiClient::new(config)?;
            let subscription = client
                .connect_socket(&url, stream_options(reconnect))
                .await?;
            for text in send {
                subscription.send_text(text).await?;
            }
            print_until_interrupted(subscription).await;
        }

        Commands::Serve { host, port } => {
            let server = ApiServer::new(ApiServerConfig {
                host,
                port,
                client: config,
            });
            let (addr, serve) = server.bind().await?;
            println!("Gateway listening on http://{}", addr);
            tokio::select! {
                result = serve => result?,
                _ = tokio::signal::ctrl_c() => println!("Shutting down"),
            }
        }
    }

    Ok(())
}

fn stream_options(reconnect: bool) -> StreamOptions {
    let options = StreamOptions::default();
    if reconnect {
        options.with_reconnect(ReconnectPolicy::default())
    } else {
        options
    }
}

async fn print_until_interrupted(mut subscription: Subscription) {
    loop {
        tokio::select! {
            event = subscription.next_event() => match event {
                Some(event) => println!("{}", stream_event_line(&event)),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                subscription.close();
                break;
            }
        }
    }
}
