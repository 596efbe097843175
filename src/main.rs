//! Shard Server
//!
//! Runs one game instance behind a WebSocket front end.
//! Usage: `shard-server [config.json]`

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use shard_core::{
    config::ServerConfig,
    core::ids::GameId,
    game::{instance::Game, prototype::PrototypeTable},
    network::server::GameServer,
    persistence::{InMemoryStore, PlayerStore},
    VERSION,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Shard Server v{}", VERSION);

    let config = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => ServerConfig::load(&path).with_context(|| format!("loading {}", path.display()))?,
        None => ServerConfig::default(),
    };
    info!("Frame rate: {} Hz", config.game.frame_rate);

    let table = Arc::new(PrototypeTable::builtin());
    let store = open_store(InMemoryStore::new())?;
    let game = Game::new(GameId(1), config.game.clone(), table, store);
    let handle = game.run().context("starting game instance")?;

    let server = Arc::new(GameServer::new(config, handle.transport().clone()));
    let serving = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("waiting for ctrl-c")?;
            info!("Interrupted");
        }
        _ = wait_for_exit(&handle) => {
            error!("Game {} stopped on its own", handle.id());
        }
    }

    server.shutdown();
    handle.request_shutdown();
    let reason = tokio::task::spawn_blocking(move || handle.join())
        .await
        .context("joining game thread")??;
    info!("Game stopped: {}", reason.message());

    match serving.await {
        Ok(Err(e)) => error!("Server error: {}", e),
        Err(e) => error!("Server task failed: {}", e),
        Ok(Ok(())) => {}
    }
    Ok(())
}

/// Initialize the player store. Startup stops if the backend is unusable.
fn open_store<S: PlayerStore>(store: S) -> anyhow::Result<Arc<S>> {
    if !store.initialize() {
        anyhow::bail!("player store failed to initialize");
    }
    info!("Player store ready");
    Ok(Arc::new(store))
}

async fn wait_for_exit(handle: &shard_core::GameHandle) {
    while !handle.is_finished() {
        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shard_core::persistence::Account;

    struct BrokenStore;

    impl PlayerStore for BrokenStore {
        fn initialize(&self) -> bool {
            false
        }
        fn try_query_account_by_key(&self, _key: &str) -> Option<Account> {
            None
        }
        fn insert_account(&self, _account: &Account) -> bool {
            false
        }
        fn update_account(&self, _account: &Account) -> bool {
            false
        }
        fn load_player_data(&self, _account: &mut Account) -> bool {
            false
        }
        fn try_save_player_data(&self, _account: &Account) -> bool {
            false
        }
    }

    #[test]
    fn test_open_store() {
        assert!(open_store(InMemoryStore::new()).is_ok());
        assert!(open_store(BrokenStore).is_err());
    }
}
