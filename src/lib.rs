pub mod auth;
pub mod backends;
pub mod canonical;
pub mod dispatch;
pub mod error;
pub mod mappers;
pub mod models;
pub mod pool;
pub mod server;
#[cfg(test)]
mod test_utils;

use tracing::{error, info};

fn init_logger() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("switchyard=info,warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

pub fn run() {
    init_logger();

    let mut config = match models::config::load_app_config() {
        Ok(config) => config,
        Err(e) => {
            error!("[E-CONFIG-LOAD] {}", e);
            std::process::exit(1);
        }
    };
    models::config::apply_env_overrides(&mut config);

    if config.dev_mode {
        info!("Dev mode enabled");
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("[E-RUNTIME-INIT] failed_to_create_tokio_runtime: {}", e);
            std::process::exit(1);
        }
    };

    runtime.block_on(async {
        let pools = dispatch::Pools::new(&config);
        pools.initialize_all().await;

        info!(
            "Starting switchyard on {}:{} (state dir {:?})",
            config.host, config.port, config.state_dir
        );
        if let Err(e) = server::serve(config, pools).await {
            error!("[E-RUNTIME-SERVE] {}", e);
            std::process::exit(1);
        }
        info!("Shut down cleanly");
    });
}
