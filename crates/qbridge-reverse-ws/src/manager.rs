//! Registry of reverse endpoints and the broadcast fan-out.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use qbridge_core::BoundedQueue;
use qbridge_onebot::{CqCodec, MessageEvent};
use qbridge_qq::OutboundMessage;
use tokio::task::JoinHandle;

use crate::config::EndpointConfig;
use crate::connector::WsConnector;
use crate::endpoint::{Endpoint, EndpointContext};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct Registry {
    endpoints: BTreeMap<String, Arc<Endpoint>>,
    tasks: BTreeMap<String, JoinHandle<()>>,
}

#[derive(Debug)]
pub struct ReverseWsManager {
    context: EndpointContext,
    registry: Mutex<Registry>,
}

impl ReverseWsManager {
    pub fn new(
        connector: Arc<dyn WsConnector>,
        outbound: Arc<BoundedQueue<OutboundMessage>>,
        codec: Arc<CqCodec>,
    ) -> Self {
        Self {
            context: EndpointContext {
                connector,
                outbound,
                codec,
            },
            registry: Mutex::new(Registry::default()),
        }
    }

    /// Registers an endpoint; it is dialed on the next `start_all`.
    pub fn add(&self, config: EndpointConfig) -> Result<Arc<Endpoint>> {
        config.validate()?;
        let mut registry = self.lock_registry();
        if registry.endpoints.contains_key(&config.id) {
            bail!("reverse websocket endpoint '{}' already exists", config.id);
        }
        let endpoint = Arc::new(Endpoint::new(config));
        registry
            .endpoints
            .insert(endpoint.id().to_string(), endpoint.clone());
        Ok(endpoint)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Endpoint>> {
        self.lock_registry().endpoints.get(id).cloned()
    }

    /// Unregisters and stops an endpoint.
    pub fn remove(&self, id: &str) -> Option<Arc<Endpoint>> {
        let mut registry = self.lock_registry();
        let endpoint = registry.endpoints.remove(id)?;
        registry.tasks.remove(id);
        endpoint.stop();
        tracing::info!(endpoint = id, "reverse websocket endpoint removed");
        Some(endpoint)
    }

    pub fn endpoints(&self) -> Vec<Arc<Endpoint>> {
        self.lock_registry().endpoints.values().cloned().collect()
    }

    /// Spawns a lifecycle task for every registered endpoint that has none running.
    pub fn start_all(&self) -> usize {
        let mut registry = self.lock_registry();
        let Registry { endpoints, tasks } = &mut *registry;
        let mut started = 0;
        for (id, endpoint) in endpoints.iter() {
            let running = tasks.get(id).is_some_and(|task| !task.is_finished());
            if running || endpoint.is_stop_requested() {
                continue;
            }
            let task = tokio::spawn(endpoint.clone().run(self.context.clone()));
            tasks.insert(id.clone(), task);
            started += 1;
        }
        tracing::info!(started, "reverse websocket endpoints started");
        started
    }

    /// Stops every endpoint and waits for their tasks to wind down.
    pub async fn close_all(&self) {
        let tasks = {
            let mut registry = self.lock_registry();
            for endpoint in registry.endpoints.values() {
                endpoint.stop();
            }
            std::mem::take(&mut registry.tasks)
        };
        for (id, task) in tasks {
            match tokio::time::timeout(CLOSE_TIMEOUT, task).await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    tracing::warn!(endpoint = %id, error = %error, "endpoint task failed")
                }
                Err(_) => tracing::warn!(endpoint = %id, "endpoint task did not stop in time"),
            }
        }
    }

    /// Writes `event` to every connected endpoint, stamped with that endpoint's self id.
    pub fn broadcast(&self, event: &MessageEvent) -> usize {
        let mut delivered = 0;
        for endpoint in self.endpoints() {
            if !endpoint.is_connected() {
                tracing::debug!(endpoint = %endpoint.id(), "skipping disconnected endpoint");
                continue;
            }
            let frame = match serde_json::to_string(&event.with_self_id(endpoint.self_id())) {
                Ok(frame) => frame,
                Err(error) => {
                    tracing::error!(error = %error, "failed to encode message event");
                    return delivered;
                }
            };
            if endpoint.send_frame(frame) {
                delivered += 1;
            }
        }
        delivered
    }

    fn lock_registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Fans broadcast-queue events out until the queue closes.
pub async fn run_broadcast_loop(
    manager: Arc<ReverseWsManager>,
    broadcast: Arc<BoundedQueue<MessageEvent>>,
) {
    while let Some(event) = broadcast.pop().await {
        let delivered = manager.broadcast(&event);
        tracing::debug!(
            message_id = event.message_id,
            delivered,
            "message event broadcast"
        );
    }
    tracing::debug!("broadcast loop stopped");
}
