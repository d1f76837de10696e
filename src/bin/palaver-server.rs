//! palaver-server: chat backend binary serving the REST API and the
//! realtime WebSocket endpoint.

use std::path::PathBuf;

use palaver::auth::AuthKeys;
use palaver::server::{app, AppState};
use palaver::storage::Storage;
use palaver::{logging, plog};

struct Config {
    bind_addr: String,
    data_dir: PathBuf,
    auth_secret: String,
}

impl Config {
    fn from_env() -> Self {
        let data_dir = std::env::var("PALAVER_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                std::env::var("HOME")
                    .map(|h| PathBuf::from(h).join(".palaver"))
                    .unwrap_or_else(|_| PathBuf::from(".palaver"))
            });

        Self {
            bind_addr: std::env::var("PALAVER_BIND")
                .unwrap_or_else(|_| "127.0.0.1:3000".to_string()),
            data_dir,
            auth_secret: std::env::var("PALAVER_AUTH_SECRET")
                .unwrap_or_else(|_| "palaver-dev-secret".to_string()),
        }
    }
}

#[tokio::main]
async fn main() {
    logging::init();
    let config = Config::from_env();

    std::fs::create_dir_all(&config.data_dir).expect("failed to create data directory");
    let db = config.data_dir.join("palaver.db");
    let storage = Storage::open(&db).expect("failed to open database");

    let keys = AuthKeys::new(config.auth_secret.as_bytes());
    let state = AppState::new(storage, keys);
    let router = app(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("failed to bind");
    plog!("palaver-server listening on {}", config.bind_addr);

    axum::serve(listener, router).await.expect("server error");
}
