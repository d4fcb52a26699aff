use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use qbridge_core::BoundedQueue;
use qbridge_onebot::CqCodec;
use qbridge_qq::{
    run_delivery_loop, run_refresh_loop, run_translator_loop, serve_webhook, CredentialManager,
    Delivery, GuildDirectory, QqApiClient, QqApiConfig, Translator, WebhookSigner, WebhookState,
};
use qbridge_reverse_ws::{run_broadcast_loop, ReverseWsManager, TungsteniteConnector};
use qbridge_store::{CorrelationStore, SqliteCorrelationStore};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::EnvFilter;

use crate::config::BridgeSettings;

const TASK_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing(default_directive: &str) {
    let default_directive: Directive = default_directive
        .parse()
        .unwrap_or_else(|_| LevelFilter::INFO.into());
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_directive)
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

/// Builds every component, runs until ctrl-c, then shuts down in order.
pub async fn run_bridge(settings: BridgeSettings) -> Result<()> {
    let store: Arc<dyn CorrelationStore> = Arc::new(
        SqliteCorrelationStore::new(&settings.database_path).with_context(|| {
            format!(
                "failed to open correlation store {}",
                settings.database_path.display()
            )
        })?,
    );
    let signer =
        WebhookSigner::from_secret(&settings.app_secret).context("invalid qq app secret")?;

    let mut api_config = QqApiConfig::new(&settings.app_id, &settings.app_secret, settings.sandbox);
    api_config.request_timeout_ms = settings.http_timeout_ms;
    let api = Arc::new(QqApiClient::new(api_config)?);
    let credential = CredentialManager::init(api.clone()).await?;

    let listener = TcpListener::bind(&settings.webhook_bind)
        .await
        .with_context(|| format!("failed to bind webhook listener {}", settings.webhook_bind))?;

    let inbound = Arc::new(BoundedQueue::new("inbound", settings.queue_capacity));
    let outbound = Arc::new(BoundedQueue::new("outbound", settings.queue_capacity));
    let broadcast = Arc::new(BoundedQueue::new("broadcast", settings.queue_capacity));

    let delivery = Arc::new(Delivery::new(api.clone(), credential.clone(), store.clone()));
    let directory: Arc<dyn GuildDirectory> = delivery.clone();
    let translator = Arc::new(Translator::new(store, Some(directory))?);
    let manager = Arc::new(ReverseWsManager::new(
        Arc::new(TungsteniteConnector),
        outbound.clone(),
        Arc::new(CqCodec::new().context("failed to build cq code parser")?),
    ));
    for endpoint in settings.endpoints {
        manager.add(endpoint)?;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers: Vec<(&str, JoinHandle<()>)> = vec![
        (
            "token refresh",
            tokio::spawn(run_refresh_loop(
                credential.clone(),
                credential.next_refresh_delay(),
                shutdown_rx.clone(),
            )),
        ),
        (
            "translator",
            tokio::spawn(run_translator_loop(
                translator,
                inbound.clone(),
                broadcast.clone(),
            )),
        ),
        (
            "delivery",
            tokio::spawn(run_delivery_loop(delivery, outbound.clone())),
        ),
        (
            "broadcast",
            tokio::spawn(run_broadcast_loop(manager.clone(), broadcast.clone())),
        ),
    ];
    manager.start_all();

    let state = Arc::new(WebhookState {
        app_id: settings.app_id.clone(),
        signer,
        inbound: inbound.clone(),
    });
    let webhook_path = settings.webhook_path.clone();
    let mut webhook = tokio::spawn(async move {
        serve_webhook(listener, &webhook_path, state, shutdown_rx).await
    });
    tracing::info!(
        app_id = %settings.app_id,
        sandbox = settings.sandbox,
        endpoints = manager.endpoints().len(),
        "qbridge started"
    );

    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested");
            signal.context("failed to listen for shutdown signal")
        }
        served = &mut webhook => match served {
            Ok(result) => result,
            Err(error) => Err(error).context("webhook task panicked"),
        },
    };

    signal_shutdown(&shutdown_tx);
    manager.close_all().await;
    inbound.close();
    outbound.close();
    broadcast.close();
    if !webhook.is_finished() {
        drain_webhook(&mut webhook, TASK_DRAIN_TIMEOUT).await;
    }
    for (name, worker) in workers {
        if tokio::time::timeout(TASK_DRAIN_TIMEOUT, worker).await.is_err() {
            tracing::warn!(task = name, "task did not stop in time");
        }
    }
    tracing::info!("qbridge stopped");
    outcome
}

/// Flips the shutdown watch; false when every receiver is already gone.
fn signal_shutdown(shutdown_tx: &watch::Sender<bool>) -> bool {
    match shutdown_tx.send(true) {
        Ok(()) => true,
        Err(error) => {
            tracing::warn!(error = %error, "shutdown signal had no listeners");
            false
        }
    }
}

/// Waits for the webhook listener to wind down; false when it overran `limit`.
async fn drain_webhook(webhook: &mut JoinHandle<Result<()>>, limit: Duration) -> bool {
    match tokio::time::timeout(limit, webhook).await {
        Ok(Ok(Ok(()))) => true,
        Ok(Ok(Err(error))) => {
            tracing::warn!(error = %format!("{error:#}"), "webhook listener stopped with error");
            true
        }
        Ok(Err(error)) => {
            tracing::warn!(error = %error, "webhook task failed");
            true
        }
        Err(_) => {
            tracing::warn!(
                timeout_ms = limit.as_millis() as u64,
                "webhook listener did not stop in time"
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::anyhow;
    use tokio::sync::watch;

    use super::{drain_webhook, signal_shutdown};

    #[test]
    fn unit_signal_shutdown_reports_missing_listeners() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        assert!(signal_shutdown(&shutdown_tx));
        assert!(*shutdown_rx.borrow());

        drop(shutdown_rx);
        assert!(!signal_shutdown(&shutdown_tx));
    }

    #[tokio::test]
    async fn regression_drain_webhook_reports_overrun_and_failures() {
        let mut stuck = tokio::spawn(async {
            std::future::pending::<()>().await;
            Ok(())
        });
        assert!(!drain_webhook(&mut stuck, Duration::from_millis(20)).await);
        stuck.abort();

        let mut failed = tokio::spawn(async { Err(anyhow!("listener closed")) });
        assert!(drain_webhook(&mut failed, Duration::from_secs(1)).await);

        let mut clean = tokio::spawn(async { Ok(()) });
        assert!(drain_webhook(&mut clean, Duration::from_secs(1)).await);
    }
}
