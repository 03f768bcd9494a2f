use std::sync::Arc;

use log::{info, warn};
use tokio::runtime::Builder;

use culvert::auth::{AuthStore, FileKvStore, UuidProvider};
use culvert::config::Config;
use culvert::dns::DohClient;
use culvert::http_client::{build_https_client, init_crypto_provider};
use culvert::http_server::start_server;
use culvert::stats::{ServerStats, StatsReporter};
use culvert::tunnel::TunnelContext;

fn build_providers(config: &Config) -> Vec<UuidProvider> {
    let mut providers = Vec::new();

    if config.dev_mode {
        if let Some(ref uuid) = config.dev_uuid {
            providers.push(UuidProvider::Static {
                name: "dev".to_string(),
                priority: 0,
                uuids: vec![uuid.clone()],
            });
        }
    }

    if let (Some(api_url), Some(api_key)) = (&config.rw_api_url, &config.rw_api_key) {
        providers.push(UuidProvider::Remote {
            name: "remnawave".to_string(),
            api_url: api_url.clone(),
            api_key: api_key.clone(),
        });
    }

    if let Some(ref url) = config.uuid_api_url {
        providers.push(UuidProvider::GenericHttp {
            name: "http".to_string(),
            url: url.clone(),
        });
    }

    providers
}

fn main() {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    // LOG_LEVEL sets the default; RUST_LOG still wins for per-module
    // filtering.
    let mut log_builder = env_logger::Builder::new();
    log_builder.filter_level(config.log_level);
    if let Ok(rust_log) = std::env::var("RUST_LOG") {
        log_builder.parse_filters(&rust_log);
    }
    log_builder.init();

    init_crypto_provider();

    let num_threads = std::cmp::max(
        2,
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1),
    );
    let runtime = Builder::new_multi_thread()
        .worker_threads(num_threads)
        .enable_io()
        .enable_time()
        .build()
        .expect("Could not build tokio runtime");

    runtime.block_on(async move {
        let client = build_https_client();

        let doh = match DohClient::new(client.clone(), &config.dns_server) {
            Ok(doh) => doh,
            Err(e) => {
                eprintln!("Invalid DNS_SERVER: {}", e);
                std::process::exit(1);
            }
        };

        let reporter = match config.stats_report_url {
            Some(ref url) => {
                match StatsReporter::new(client.clone(), url, config.stats_report_token.clone()) {
                    Ok(reporter) => Some(Arc::new(reporter)),
                    Err(e) => {
                        eprintln!("Invalid STATS_REPORT_URL: {}", e);
                        std::process::exit(1);
                    }
                }
            }
            None => None,
        };

        let providers = build_providers(&config);
        if providers.is_empty() {
            warn!("no uuid providers configured; every tunnel will be rejected");
        }

        let l2 = match config.uuid_cache_file {
            Some(ref path) => Some(FileKvStore::open(path.clone()).await),
            None => None,
        };
        let auth = AuthStore::new(providers, client.clone(), config.uuid_cache_ttl, l2);

        // Warm the cache so the first tunnel doesn't pay for the fetch.
        let warmed = auth.get_merged().await;
        info!("{} authorized uuids loaded", warmed.len());

        let ctx = Arc::new(TunnelContext {
            config: Arc::new(config),
            auth,
            doh,
            reporter,
            server_stats: ServerStats::new(),
        });

        if let Err(e) = start_server(ctx).await {
            eprintln!("Server failed: {}", e);
            std::process::exit(1);
        }
    });
}
