use std::fs;
use std::sync::Arc;

use clap::Parser;
use log::{error, info, warn};

use study_room::config::{Args, Config, TlsPaths};
use study_room::coordinator::RoomCoordinator;
use study_room::error::ServerError;
use study_room::server::{self, Server};
use study_room::store::MemoryStore;

/// Both files must be readable PEM before warp is handed their paths.
fn check_tls(paths: &TlsPaths) -> Result<(), ServerError> {
    for path in [&paths.cert, &paths.key] {
        let pem = fs::read_to_string(path).map_err(|e| ServerError::Tls(format!("{}: {e}", path.display())))?;
        if !pem.contains("-----BEGIN") {
            return Err(ServerError::Tls(format!("{} is not PEM encoded", path.display())));
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match Config::try_from(Args::parse()) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let store = Arc::new(MemoryStore::new());
    let coordinator = Arc::new(RoomCoordinator::new(config.room.clone(), store.clone(), store));
    let server = Arc::new(Server::new(coordinator, config.disconnect_grace));
    let routes = server::routes(server, config.static_dir.clone());

    match config.tls.as_ref().map(|tls| (tls, check_tls(tls))) {
        Some((tls, Ok(()))) => {
            info!("Starting secure server (HTTPS/WSS) on {}", config.bind);
            warp::serve(routes)
                .tls()
                .cert_path(&tls.cert)
                .key_path(&tls.key)
                .run(config.bind)
                .await;
        }
        Some((_, Err(e))) => {
            warn!("{}, falling back to HTTP/WS on {}", e, config.bind);
            warp::serve(routes).run(config.bind).await;
        }
        None => {
            info!("Starting server (HTTP/WS) on {}", config.bind);
            warp::serve(routes).run(config.bind).await;
        }
    }
}
