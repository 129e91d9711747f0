use invoice_job_coordinator::app::{AppState, build_router};
use invoice_job_coordinator::config::environment::AppConfig;
use invoice_job_coordinator::infra::init_infra;
use invoice_job_coordinator::service::retention_service;
use tokio::net::TcpListener;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    init_logging();

    let config = match AppConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "config error");
            std::process::exit(1);
        }
    };

    let infra = match init_infra(&config) {
        Ok(i) => i,
        Err(e) => {
            error!(error = %e, "infra init failed");
            std::process::exit(1);
        }
    };

    let bind_addr = format!("{}:{}", config.api_host, config.api_port);
    let listener = match TcpListener::bind(&bind_addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, bind_addr = %bind_addr, "server bind error");
            std::process::exit(1);
        }
    };

    info!(
        env = %config.rust_env,
        host = %config.api_host,
        port = config.api_port,
        emulate = config.tasks_emulate,
        "invoice-job-coordinator started"
    );

    let state = AppState::new(config, infra);
    if state.config.retention_loop_enable {
        let retention_state = state.clone();
        tokio::spawn(async move {
            retention_service::run_retention_loop(retention_state).await;
        });
    }

    let app = build_router(state);
    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "server runtime error");
        std::process::exit(1);
    }
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
