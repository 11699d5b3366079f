use tracing::error;
use tracing_subscriber::filter;

use basalt_server::metrics;

fn squawk(log_level: &str, config: &basalt_server::Config) {
    let version = env!("CARGO_PKG_VERSION");
    let commit = option_env!("BUILD_COMMIT").unwrap_or("unknown");
    let build_time = env!("BUILD_TIME");
    let run_time = chrono::Utc::now().to_rfc2822();
    let pid = std::process::id();
    let server_id = &config.server_id;
    let port = config.http.bind.port();

    eprintln!(
        r#"
/*
** basalt v{version}
**
** server id:     {server_id}
** commit:        {commit}
** build time:    {build_time}
** startup time:  {run_time}
** port:          {port}
** pid:           {pid}
** log level:     {log_level}
\*
"#
    );
}

#[tokio::main]
async fn main() {
    let filter = filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::WARN.into())
        .from_env_lossy();
    let log_level = filter.to_string();

    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = basalt_server::config::binary_config().expect("error getting configuration");
    squawk(&log_level, &config);

    metrics::start_metrics(config.metrics.clone());

    if let Err(e) = basalt_server::task_from_config(config, basalt_server::exit_signal()).await {
        error!("basalt exited with error: {e:#}");
        std::process::exit(1);
    }
}
