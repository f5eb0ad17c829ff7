mod api;
mod bootstrap;
mod cli;
mod platform;
mod runtime;
mod state;

use std::sync::Arc;

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use clap::Parser;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing_subscriber::EnvFilter;

use agentrt_domain::config::{Config, LogFormat, ObservabilityConfig};

use cli::{Cli, Command, ConfigCommand};
use platform::http::HttpAdapter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let parsed = Cli::parse();

    match parsed.command {
        None | Some(Command::Serve) => {
            let (config, _config_path) = cli::load_config()?;
            init_tracing(&config.observability);
            serve(config).await
        }
        Some(Command::Chat) => {
            let (config, _config_path) = cli::load_config()?;
            cli::chat::chat(config, None).await
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let (config, config_path) = cli::load_config()?;
            if !cli::config::validate(&config, &config_path) {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let (config, _config_path) = cli::load_config()?;
            cli::config::show(&config);
            Ok(())
        }
        Some(Command::Run {
            message,
            session,
            model,
            json,
        }) => {
            let (config, _config_path) = cli::load_config()?;
            cli::run::run(config, message, session, model, json).await
        }
        Some(Command::Version) => {
            println!("agentrt {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Structured logging per `config.observability`: JSON by default (matching
/// what a process manager or log aggregator expects), `pretty` for local
/// development.
fn init_tracing(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Pretty => subscriber.pretty().init(),
    }
}

/// Bring up every shared service, assemble the HTTP router, and serve until
/// the process is killed.
async fn serve(config: Config) -> anyhow::Result<()> {
    tracing::info!("agentrt starting");

    let config_dir = std::env::current_dir()?;
    let state = bootstrap::build_app_state(config, &config_dir).await?;
    bootstrap::spawn_background_tasks(&state);

    let (provider, default_model) = bootstrap::resolve_default_model(&state)?;
    let deps = Arc::new(state.dispatcher_deps(provider, default_model));

    let adapter = Arc::new(HttpAdapter::new(
        state.stream_registry.clone(),
        state.clarifications.clone(),
        state.api_secret.clone(),
        state.sessions.clone(),
        state.identity.clone(),
        state.lifecycle.clone(),
        state.config.sessions.clone(),
    ));

    let max_concurrent = state.config.server.max_concurrent_requests;
    let cors_layer = build_cors_layer(&state.config.server.cors);
    let addr = format!("{}:{}", state.config.server.host, state.config.server.port);

    let api_state = api::ApiState {
        app: state,
        adapter,
        deps,
    };
    let app = api::router(api_state)
        .layer(cors_layer)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_concurrent));

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    tracing::info!(addr = %addr, "agentrt listening");

    axum::serve(listener, app).await.context("axum server error")?;
    Ok(())
}

/// Build a [`CorsLayer`] from the configured allowed origins.
///
/// Origins may contain a trailing `*` wildcard for the port segment (e.g.
/// `http://localhost:*`). These are expanded into a predicate that matches
/// any port on that host. A literal `"*"` allows all origins.
fn build_cors_layer(cors: &agentrt_domain::config::CorsConfig) -> CorsLayer {
    use axum::http::header;

    if cors.allowed_origins.len() == 1 && cors.allowed_origins[0] == "*" {
        tracing::warn!("CORS configured with wildcard \"*\" — all origins allowed");
        return CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods([
                Method::GET,
                Method::POST,
                Method::PUT,
                Method::DELETE,
                Method::OPTIONS,
            ])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);
    }

    let mut exact: Vec<HeaderValue> = Vec::new();
    let mut wildcard_prefixes: Vec<String> = Vec::new();

    for origin in &cors.allowed_origins {
        if origin.ends_with(":*") {
            let prefix = origin.trim_end_matches('*').to_owned();
            wildcard_prefixes.push(prefix);
        } else if let Ok(hv) = origin.parse::<HeaderValue>() {
            exact.push(hv);
        } else {
            tracing::warn!(origin = %origin, "invalid CORS origin, skipping");
        }
    }

    let allow_origin = if wildcard_prefixes.is_empty() {
        AllowOrigin::list(exact)
    } else {
        AllowOrigin::predicate(move |origin, _| {
            let origin_str = origin.to_str().unwrap_or("");
            if exact.iter().any(|e| e.as_bytes() == origin.as_bytes()) {
                return true;
            }
            wildcard_prefixes.iter().any(|prefix| {
                origin_str
                    .strip_prefix(prefix.as_str())
                    .map(|port| !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()))
                    .unwrap_or(false)
            })
        })
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(true)
}
