use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::tokens::TokenService;

/// Background task that prunes expired deny-list entries until `shutdown`
/// is cancelled.
pub async fn run_revocation_sweeper(
    tokens: Arc<TokenService>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        match tokens.prune_revocations().await {
            Ok(count) => {
                if count > 0 {
                    info!("Sweeper: pruned {} expired revocations", count);
                }
            }
            Err(e) => {
                warn!("Sweeper error: {}", e);
            }
        }
    }

    info!("Revocation sweeper stopped");
}
