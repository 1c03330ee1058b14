use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use askpipe_core::{GenerationBackend, SearchSource};
use askpipe_local::cache::SimilarityCache;
use askpipe_local::fetch::Fetcher;
use askpipe_local::ollama::OllamaClient;
use askpipe_local::search::BraveSearch;
use askpipe_local::weather::OpenWeather;
use askpipe_server::config::{self, Settings};
use askpipe_server::orchestrate::Orchestrator;
use askpipe_server::routes::{build_router, AppState};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "askpipe")]
#[command(about = "Chat server with live search over a local Ollama", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP server
    Serve(ServeArgs),
    /// Probe the environment the server depends on
    Check(CheckArgs),
    /// Print version information
    Version(VersionArgs),
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
    /// Bind address
    #[arg(long, default_value = "0.0.0.0", env = "ASKPIPE_HOST")]
    host: String,
    /// Bind port
    #[arg(long, default_value_t = 8000, env = "ASKPIPE_PORT")]
    port: u16,
}

#[derive(clap::Args, Debug)]
struct CheckArgs {
    /// Output mode: json or text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
    /// Probe the Ollama endpoint (set false for offline checks)
    #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
    check_ollama: bool,
    /// Per-probe timeout in milliseconds
    #[arg(long, default_value_t = 3000)]
    timeout_ms: u64,
}

#[derive(clap::Args, Debug)]
struct VersionArgs {
    /// Output mode: json or text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve(args) => run_serve(args).await,
        Commands::Check(args) => run_check(args).await,
        Commands::Version(args) => run_version(args),
    }
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::from_env();
    let client = askpipe_local::default_client()?;

    let cache = Arc::new(SimilarityCache::with_config(
        Some(settings.cache_dir.clone()),
        settings.cache_max_entries,
        settings.similarity(),
    ));

    let search: Option<Arc<dyn SearchSource>> = match BraveSearch::from_env(client.clone()) {
        Ok(brave) => Some(Arc::new(brave)),
        Err(e) => {
            warn!(error = %e, "web search disabled");
            None
        }
    };
    let weather = match OpenWeather::from_env(client.clone()) {
        Ok(provider) => Some(provider),
        Err(e) => {
            warn!(error = %e, "weather disabled");
            None
        }
    };

    let backend: Arc<dyn GenerationBackend> = Arc::new(OllamaClient::from_env(client.clone()));
    let fetcher = Fetcher::new(
        client,
        cache.clone(),
        search,
        weather,
        settings.fetch_concurrency,
    );
    let orchestrator = Arc::new(Orchestrator::new(
        backend.clone(),
        fetcher,
        cache,
        settings.budgets(),
        settings.history_cap,
        settings.generation_timeout_ms,
    ));

    let state = AppState {
        orchestrator,
        backend,
        api_key: settings.api_key.clone(),
    };
    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, auth = settings.api_key.is_some(), "serving askpipe");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn run_check(args: CheckArgs) -> Result<()> {
    fn has_env(k: &str) -> bool {
        std::env::var(k).ok().is_some_and(|v| !v.trim().is_empty())
    }

    let t0 = std::time::Instant::now();

    let brave = has_env("ASKPIPE_BRAVE_API_KEY") || has_env("BRAVE_SEARCH_API_KEY");
    let openweather = has_env("ASKPIPE_OPENWEATHER_API_KEY") || has_env("OPENWEATHER_API_KEY");
    let api_key = has_env("ASKPIPE_API_KEY");

    let cache_dir = std::env::var("ASKPIPE_CACHE_DIR")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(config::default_cache_dir);

    let millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let cache_ok = (|| -> anyhow::Result<()> {
        std::fs::create_dir_all(&cache_dir)?;
        let probe = cache_dir.join(format!("askpipe-check-{millis}.probe"));
        std::fs::write(&probe, b"ok")?;
        let _ = std::fs::remove_file(&probe);
        Ok(())
    })()
    .is_ok();

    let mut checks: Vec<serde_json::Value> = vec![
        json!({
            "name": "cache_dir_writable",
            "ok": cache_ok,
            "message": format!("cache dir {}", cache_dir.display()),
            "hint": if cache_ok { "" } else { "set ASKPIPE_CACHE_DIR to a writable directory" },
        }),
        json!({
            "name": "web_search_key",
            "ok": brave,
            "optional": true,
            "message": if brave { "Brave Search key present" } else { "no Brave Search key" },
            "hint": if brave { "" } else { "set ASKPIPE_BRAVE_API_KEY to enable web, reddit and wikipedia search" },
        }),
        json!({
            "name": "weather_key",
            "ok": openweather,
            "optional": true,
            "message": if openweather { "OpenWeather key present" } else { "no OpenWeather key" },
            "hint": if openweather { "" } else { "set ASKPIPE_OPENWEATHER_API_KEY to enable weather lookups" },
        }),
    ];

    if args.check_ollama {
        let client = askpipe_local::default_client()?;
        let ollama = OllamaClient::from_env(client);
        let base_url = ollama.base_url().to_string();
        let started = std::time::Instant::now();
        let outcome =
            tokio::time::timeout(Duration::from_millis(args.timeout_ms), ollama.models()).await;
        let elapsed = started.elapsed().as_millis();
        checks.push(match outcome {
            Ok(Ok(models)) => json!({
                "name": "ollama_reachable",
                "ok": true,
                "message": format!("{} models at {base_url}", models.len()),
                "hint": "",
                "elapsed_ms": elapsed,
            }),
            Ok(Err(e)) => json!({
                "name": "ollama_reachable",
                "ok": false,
                "message": format!("unreachable at {base_url}"),
                "hint": "start it with `ollama serve` or point ASKPIPE_OLLAMA_BASE_URL at a running instance",
                "elapsed_ms": elapsed,
                "error": e.to_string(),
            }),
            Err(_) => json!({
                "name": "ollama_reachable",
                "ok": false,
                "message": format!("timed out after {}ms at {base_url}", args.timeout_ms),
                "hint": "start it with `ollama serve` or point ASKPIPE_OLLAMA_BASE_URL at a running instance",
                "elapsed_ms": elapsed,
            }),
        });
    } else {
        checks.push(json!({
            "name": "ollama_reachable",
            "ok": true,
            "skipped": true,
            "message": "skipped (--check-ollama false)",
            "hint": "",
        }));
    }

    // Optional checks report state without failing the probe.
    let ok = checks
        .iter()
        .filter(|c| !c["optional"].as_bool().unwrap_or(false))
        .all(|c| c["ok"].as_bool().unwrap_or(false));

    let payload = json!({
        "schema_version": 1,
        "kind": "check",
        "ok": ok,
        "name": "askpipe",
        "version": env!("CARGO_PKG_VERSION"),
        "platform": {"os": std::env::consts::OS, "arch": std::env::consts::ARCH},
        "elapsed_ms": t0.elapsed().as_millis(),
        "configured": {
            "providers": {"brave": brave, "openweather": openweather},
            "auth": {"api_key": api_key},
            "cache_dir": cache_dir.display().to_string(),
        },
        "checks": checks,
    });

    match args.output.to_ascii_lowercase().as_str() {
        "text" => {
            println!("askpipe check: {}", if ok { "ok" } else { "failing" });
            for c in payload["checks"].as_array().into_iter().flatten() {
                let mark = if c["ok"].as_bool().unwrap_or(false) {
                    "ok"
                } else {
                    "FAIL"
                };
                println!(
                    "  [{mark}] {}: {}",
                    c["name"].as_str().unwrap_or(""),
                    c["message"].as_str().unwrap_or("")
                );
                if let Some(hint) = c["hint"].as_str() {
                    if !hint.is_empty() {
                        println!("        hint: {hint}");
                    }
                }
            }
        }
        _ => println!("{payload}"),
    }

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

fn run_version(args: VersionArgs) -> Result<()> {
    let payload = json!({
        "schema_version": 1,
        "kind": "version",
        "ok": true,
        "name": "askpipe",
        "version": env!("CARGO_PKG_VERSION"),
    });
    match args.output.to_ascii_lowercase().as_str() {
        "text" => println!("askpipe {}", env!("CARGO_PKG_VERSION")),
        _ => println!("{payload}"),
    }
    Ok(())
}
