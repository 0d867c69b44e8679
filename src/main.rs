use std::{path::Path, sync::Arc};

use clap::Parser;
use rust_decimal::Decimal;
use tollgate::{
    AppState,
    config::{self, GatewayConfig},
    db::DbPool,
    jobs,
    limiter::PersistentLimiter,
    observability,
    pricing::{PricingEngine, Usage},
    routes,
};

/// Config file picked up from the working directory when `--config` is absent.
const DEFAULT_CONFIG_FILE: &str = "tollgate.toml";

/// CLI arguments for the tollgate proxy
#[derive(Parser, Debug)]
#[command(version, about = "Spend-limiting proxy for metered LLM APIs", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to config file (defaults to ./tollgate.toml if it exists,
    /// otherwise built-in defaults)
    #[arg(short, long, global = true)]
    config: Option<String>,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Start the proxy and admin listeners (default)
    Serve(ServeOverrides),
    /// Validate the configuration and tariff, then print a summary
    Check,
    /// Price a hypothetical request against the configured tariff
    Price {
        /// Model name as the upstream would report it
        #[arg(short, long)]
        model: String,
        /// Prompt tokens, cached ones included
        #[arg(long)]
        prompt: i64,
        /// Prompt tokens served from the prompt cache
        #[arg(long, default_value = "0")]
        cached: i64,
        /// Completion tokens
        #[arg(long)]
        completion: i64,
        /// Service tier (standard when omitted)
        #[arg(long)]
        tier: Option<String>,
    },
}

/// Values that take precedence over the config file.
#[derive(clap::Args, Debug, Default)]
struct ServeOverrides {
    /// Port for the proxy listener
    #[arg(short, long)]
    port: Option<u16>,
    /// Upstream base URL
    #[arg(long)]
    upstream: Option<String>,
    /// Per-key spend limit in USD per hour (negative disables tracking)
    #[arg(long, allow_hyphen_values = true)]
    spend_limit_per_hour: Option<Decimal>,
}

impl ServeOverrides {
    fn apply(self, config: &mut GatewayConfig) {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(upstream) = self.upstream {
            config.upstream.base_url = upstream;
        }
        if let Some(limit) = self.spend_limit_per_hour {
            config.limits.spend_limit_per_hour = limit;
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    match args.command {
        Some(Command::Check) => run_check(args.config.as_deref()),
        Some(Command::Price {
            model,
            prompt,
            cached,
            completion,
            tier,
        }) => run_price(
            args.config.as_deref(),
            &model,
            Usage::new(prompt, cached, completion),
            tier.as_deref(),
        ),
        Some(Command::Serve(overrides)) => run_server(args.config.as_deref(), overrides).await,
        None => run_server(args.config.as_deref(), ServeOverrides::default()).await,
    }
}

/// Load the explicit config file, `./tollgate.toml`, or the defaults, in that order.
fn load_config(explicit_path: Option<&str>) -> GatewayConfig {
    let path = match explicit_path {
        Some(path) => Some(path),
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => Some(DEFAULT_CONFIG_FILE),
        None => None,
    };

    let result = match path {
        Some(path) => GatewayConfig::from_file(path),
        None => GatewayConfig::from_str(""),
    };

    match result {
        Ok(config) => config,
        Err(e) => {
            eprintln!(
                "Failed to load config from {}: {}",
                path.unwrap_or("<defaults>"),
                e
            );
            std::process::exit(1);
        }
    }
}

fn load_pricing(config: &GatewayConfig) -> PricingEngine {
    match config.load_tariff() {
        Ok(tariff) => PricingEngine::new(tariff),
        Err(e) => {
            eprintln!("Failed to load tariff: {}", e);
            std::process::exit(1);
        }
    }
}

fn run_check(config_path: Option<&str>) {
    let config = load_config(config_path);
    let pricing = load_pricing(&config);
    let tariff = pricing.tariff();

    let limit = match config.limits.spend_limit() {
        Ok(limit) => limit,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    println!("Configuration OK");
    println!("  proxy:     {}:{}", config.server.host, config.server.port);
    if config.admin.enabled {
        println!("  admin:     {}:{}", config.admin.host, config.admin.port);
    } else {
        println!("  admin:     disabled");
    }
    println!("  upstream:  {}", config.upstream.base_url);
    if limit.is_negative() {
        println!("  limit:     disabled");
    } else {
        println!("  limit:     {} per hour", limit);
    }
    match &config.database {
        config::DatabaseConfig::None => println!("  database:  none (in-memory only)"),
        config::DatabaseConfig::Sqlite(sqlite) => println!("  database:  sqlite {}", sqlite.path),
    }
    println!(
        "  tariff:    {} models, version {}{}",
        tariff.len(),
        tariff.version().unwrap_or("unversioned"),
        if tariff.default_rate().is_some() {
            ", default rate set"
        } else {
            ""
        }
    );
}

fn run_price(config_path: Option<&str>, model: &str, usage: Usage, tier: Option<&str>) {
    let config = load_config(config_path);
    let pricing = load_pricing(&config);
    let cost = pricing.compute_cost(model, &usage, tier);

    println!("{}", cost);
    if cost.tier_fallback() {
        println!(
            "note: no '{}' rates for {}, standard rates applied",
            cost.requested_tier, cost.model
        );
    }
}

async fn run_server(config_path: Option<&str>, overrides: ServeOverrides) {
    let mut config = load_config(config_path);
    overrides.apply(&mut config);
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = observability::init_tracing(&config.observability) {
        eprintln!("Failed to initialize tracing: {}", e);
        std::process::exit(1);
    }

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting tollgate");

    let pricing = Arc::new(load_pricing(&config));
    {
        let tariff = pricing.tariff();
        tracing::info!(
            models = tariff.len(),
            version = tariff.version().unwrap_or("unversioned"),
            "Tariff loaded"
        );
    }

    let limit = match config.limits.spend_limit() {
        Ok(limit) => limit,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let db = if config.database.is_none() {
        tracing::warn!("No database configured, spend windows will not survive a restart");
        None
    } else {
        match DbPool::from_config(&config.database).await {
            Ok(db) => Some(Arc::new(db)),
            Err(e) => {
                eprintln!("Failed to open database: {}", e);
                std::process::exit(1);
            }
        }
    };

    let limiter = Arc::new(PersistentLimiter::open(limit, db, config.limits.retention()).await);
    if limit.is_negative() {
        tracing::info!("Spend limiting disabled");
    } else {
        tracing::info!(limit = %limit, "Spend limit per key per hour");
    }

    let cleanup_interval = config.limits.cleanup_interval_secs;
    let state = match AppState::new(config, limiter.clone(), pricing) {
        Ok(state) => state,
        Err(e) => {
            eprintln!("Failed to build HTTP client: {}", e);
            std::process::exit(1);
        }
    };

    let cleanup_worker = tokio::spawn(jobs::start_spend_cleanup_worker(
        limiter.clone(),
        cleanup_interval,
    ));

    let proxy_addr = format!("{}:{}", state.config.server.host, state.config.server.port);
    let proxy_listener = match tokio::net::TcpListener::bind(&proxy_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("Failed to bind proxy listener to {}: {}", proxy_addr, e);
            std::process::exit(1);
        }
    };

    let admin_listener = if state.config.admin.enabled {
        let admin_addr = format!("{}:{}", state.config.admin.host, state.config.admin.port);
        match tokio::net::TcpListener::bind(&admin_addr).await {
            Ok(listener) => {
                tracing::info!("Admin API listening on http://{}", admin_addr);
                Some(listener)
            }
            Err(e) => {
                eprintln!("Failed to bind admin listener to {}: {}", admin_addr, e);
                std::process::exit(1);
            }
        }
    } else {
        None
    };

    tracing::info!(
        upstream = %state.config.upstream.base_url,
        "Proxy listening on http://{}",
        proxy_addr
    );

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    let admin_server = admin_listener.map(|listener| {
        let app = routes::build_admin_router(state.clone());
        let mut shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown.recv().await;
                })
                .await
        })
    });

    let proxy_app = routes::build_proxy_router(state);
    let mut proxy_shutdown = shutdown_tx.subscribe();
    let proxy_server = tokio::spawn(async move {
        axum::serve(proxy_listener, proxy_app)
            .with_graceful_shutdown(async move {
                let _ = proxy_shutdown.recv().await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match proxy_server.await {
        Ok(Err(e)) => tracing::error!(error = %e, "Proxy server failed"),
        Err(e) => tracing::error!(error = %e, "Proxy server task panicked"),
        Ok(Ok(())) => {}
    }
    if let Some(admin_server) = admin_server {
        match admin_server.await {
            Ok(Err(e)) => tracing::error!(error = %e, "Admin server failed"),
            Err(e) => tracing::error!(error = %e, "Admin server task panicked"),
            Ok(Ok(())) => {}
        }
    }

    cleanup_worker.abort();
    if let Err(e) = limiter.close().await {
        tracing::error!(error = %e, "Final spend cleanup failed");
    }

    tracing::info!("Shutdown complete");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, draining connections...");
}
