//! Shutdown signals.

/// Returns a `Future` that completes when the process should start to shut down.
pub async fn shutdown() {
    imp::shutdown().await
}

#[cfg(unix)]
mod imp {
    use tokio::signal::unix::{signal, SignalKind};
    use tracing::{error, info};

    pub(super) async fn shutdown() {
        tokio::select! {
            // SIGINT, for Ctrl-C while developing
            () = sig(SignalKind::interrupt(), "SIGINT") => {}
            () = sig(SignalKind::terminate(), "SIGTERM") => {}
        };
    }

    async fn sig(kind: SignalKind, name: &'static str) {
        match signal(kind) {
            Ok(mut stream) => {
                stream.recv().await;
                info!(
                    target: "flboard_server::signal",
                    "received {}, starting shutdown",
                    name,
                );
            }
            Err(e) => {
                error!("failed to register the {} handler: {}", name, e);
                futures::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use tracing::{error, info};

    pub(super) async fn shutdown() {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!(
                target: "flboard_server::signal",
                "received Ctrl-C, starting shutdown",
            ),
            Err(e) => {
                error!("failed to register the Ctrl-C handler: {}", e);
                futures::future::pending::<()>().await;
            }
        }
    }
}
