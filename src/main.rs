use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{error, info};

use forum_chat::config::Config;
use forum_chat::hub::Hub;
use forum_chat::router::EventRouter;
use forum_chat::routes::{self, AppState};
use forum_chat::store::{ChatStore, SqliteStore};
use forum_chat::throttle::Throttle;

const THROTTLE_CLEANUP_EVERY: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::parse();

    let store: Arc<dyn ChatStore> = match SqliteStore::connect(&config.database_url).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Failed to open database {}: {}", config.database_url, e);
            std::process::exit(1);
        }
    };

    let (hub, handle) = Hub::new(store.clone(), !config.no_force_refresh);
    tokio::spawn(hub.run());

    let history_throttle = Throttle::new(config.history_throttle());
    let users_throttle = Throttle::new(config.users_throttle());
    history_throttle.spawn_cleanup(THROTTLE_CLEANUP_EVERY);
    users_throttle.spawn_cleanup(THROTTLE_CLEANUP_EVERY);

    let router = Arc::new(EventRouter::new(handle.clone(), store.clone()));
    let state = AppState {
        hub: handle,
        router,
        store,
        outbound_capacity: config.outbound_buffer,
        history_throttle,
        users_throttle,
    };
    let routes = routes::routes(state, config.static_dir.clone());

    match config.tls() {
        Some((cert, key)) => {
            info!("Starting secure server (HTTPS/WSS) on {}", config.bind);
            warp::serve(routes)
                .tls()
                .cert_path(cert)
                .key_path(key)
                .run(config.bind)
                .await;
        }
        None => {
            info!("Starting server (HTTP/WS) on {}", config.bind);
            warp::serve(routes).run(config.bind).await;
        }
    }
}
