//! Listener lifecycle shared by the Server, the Agent, and SDK instances.
//!
//! A `CancellationToken` is the single shutdown switch: the signal listener
//! cancels it, background loops watch it, and `serve_until` stops accepting
//! when it fires and then drains in-flight requests for at most `grace`.

use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use pitboss_contracts::error::{PitbossError, PitbossResult};

/// Cancel `token` on ctrl-c, or on SIGTERM where there is one.
pub fn spawn_signal_listener(token: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "ctrl-c handler unavailable");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(e) => {
                    warn!(error = %e, "SIGTERM handler unavailable");
                    std::future::pending::<()>().await;
                }
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("interrupt received"),
            _ = terminate => info!("terminate received"),
            _ = token.cancelled() => return,
        }
        token.cancel();
    });
}

/// Serve `app` until `shutdown` fires, then drain for up to `grace`.
pub async fn serve_until(
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
    grace: Duration,
) -> PitbossResult<()> {
    let addr = listener.local_addr().map(|a| a.to_string()).unwrap_or_default();
    let stop = shutdown.clone();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { stop.cancelled().await })
            .await
    });

    let joined = tokio::select! {
        joined = &mut server => joined,
        _ = shutdown.cancelled() => {
            info!(addr = %addr, grace_secs = grace.as_secs(), "draining in-flight requests");
            match tokio::time::timeout(grace, &mut server).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(addr = %addr, "drain deadline passed, closing remaining connections");
                    server.abort();
                    return Ok(());
                }
            }
        }
    };

    match joined {
        Ok(Ok(())) => {
            info!(addr = %addr, "listener stopped");
            Ok(())
        }
        Ok(Err(e)) => Err(PitbossError::internal(format!("listener {addr} failed: {e}"))),
        Err(e) => Err(PitbossError::internal(format!("listener task {addr} failed: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::{routing::get, Router};
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;

    use super::serve_until;

    #[tokio::test]
    async fn stops_when_the_token_fires() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route("/healthz", get(|| async { "ok" }));
        let token = CancellationToken::new();
        let task = tokio::spawn(serve_until(listener, app, token.clone(), Duration::from_secs(1)));

        let body = reqwest::get(format!("http://{addr}/healthz")).await.unwrap().text().await.unwrap();
        assert_eq!(body, "ok");

        token.cancel();
        let result = tokio::time::timeout(Duration::from_secs(3), task).await.unwrap().unwrap();
        assert!(result.is_ok());
    }
}
