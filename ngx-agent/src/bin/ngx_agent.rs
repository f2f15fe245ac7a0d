//! ngx-agent - nginx access log ingestion agent.
//!
//! Follows a JSON-formatted access log, parses every new line and bulk-loads the entries into a
//! PostgreSQL table, resuming after restarts without storing an entry twice.

use anyhow::{Context, Result};
use ngx_agent::config::{self, Config};
use ngx_agent::{metrics, runner};
use std::net::SocketAddr;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const CONFIG_ENV: &str = "NGX_AGENT_CONFIG";

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    match run().await {
        Ok(()) => {
            info!("ngx-agent stopped");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = format!("{err:#}"), "ngx-agent stopped with a fatal error");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    match config::load_dotenv() {
        Ok(Some(path)) => info!(path = %path.display(), "loaded environment file"),
        Ok(None) => {}
        Err(err) => warn!(error = format!("{err:#}"), "ignoring environment file"),
    }

    let config_path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| "config.toml".to_string());
    let config = Config::load_or_env(&config_path)
        .with_context(|| format!("loading configuration (file {config_path})"))?;

    let cancel_token = CancellationToken::new();
    tokio::spawn({
        let cancel_token = cancel_token.clone();
        async move {
            runner::shutdown_signal().await;
            cancel_token.cancel();
        }
    });

    if config.metrics.enabled {
        let addr = config.metrics_addr()?;
        tokio::spawn(start_metrics_server(addr, cancel_token.clone()));
    }

    runner::run(&config, cancel_token).await
}

fn init_tracing() {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_target(false)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Serves the Prometheus metrics at GET /metrics until `cancel_token` fires.
async fn start_metrics_server(addr: SocketAddr, cancel_token: CancellationToken) {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::header::HeaderValue;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use tokio::net::TcpListener;

    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(%addr, error = %err, "failed to bind metrics server");
            return;
        }
    };

    info!(%addr, "Prometheus metrics server listening on /metrics");

    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                info!("metrics server shutting down");
                break;
            }
            accept_result = listener.accept() => {
                let (stream, _) = match accept_result {
                    Ok(conn) => conn,
                    Err(err) => {
                        warn!(error = %err, "failed to accept metrics connection");
                        continue;
                    }
                };

                tokio::spawn(async move {
                    let io = TokioIo::new(stream);

                    let service = service_fn(|req: Request<hyper::body::Incoming>| async move {
                        let response = if req.uri().path() != "/metrics" {
                            let mut response = Response::new(Full::new(Bytes::from("Not Found")));
                            *response.status_mut() = StatusCode::NOT_FOUND;
                            response
                        } else {
                            match metrics::encode_text() {
                                Ok((body, content_type)) => {
                                    let mut response = Response::new(Full::new(Bytes::from(body)));
                                    if let Ok(value) = HeaderValue::from_str(&content_type) {
                                        response
                                            .headers_mut()
                                            .insert(hyper::header::CONTENT_TYPE, value);
                                    }
                                    response
                                }
                                Err(err) => {
                                    let mut response =
                                        Response::new(Full::new(Bytes::from(err.to_string())));
                                    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                                    response
                                }
                            }
                        };
                        Ok::<_, hyper::Error>(response)
                    });

                    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                        tracing::debug!(error = %err, "error serving metrics connection");
                    }
                });
            }
        }
    }
}
