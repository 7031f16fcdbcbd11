use super::{CoordinationStore, LeaseId, StoreError, WatchEvent, WatchStream};
use crate::infrastructure::config::StoreSettings;
use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use etcd_client::{Client, ConnectOptions, EventType, GetOptions, PutOptions, WatchOptions};
use futures_util::stream::{self, StreamExt};
use secrecy::ExposeSecret;
use std::time::Duration;
use tracing::{debug, warn};

/// Coordination store backed by an etcd cluster.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

fn backend(err: etcd_client::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

impl EtcdStore {
    /// Connects to etcd with exponential backoff.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] once the backoff budget is spent.
    pub async fn connect(settings: &StoreSettings) -> Result<Self, StoreError> {
        let backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(200),
            max_interval: Duration::from_secs(5),
            max_elapsed_time: Some(Duration::from_millis(settings.connect_timeout_ms)),
            ..Default::default()
        };

        let mut options = ConnectOptions::new().with_connect_timeout(Duration::from_secs(5));
        if let (Some(user), Some(password)) = (&settings.user, &settings.password) {
            options = options.with_user(user.clone(), password.expose_secret().to_string());
        }

        let endpoints = &settings.endpoints;
        let options = &options;
        let client = retry(backoff, || async move {
            match Client::connect(endpoints, Some(options.clone())).await {
                Ok(client) => {
                    debug!(?endpoints, "Connected to etcd");
                    Ok(client)
                }
                Err(e) => {
                    warn!(error = %e, "etcd connection failed, retrying");
                    Err(backoff::Error::transient(e))
                }
            }
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("etcd unreachable: {e}")))?;

        Ok(Self { client })
    }

    /// Wraps an already connected client.
    #[must_use]
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn grant(&self, ttl_secs: i64) -> Result<LeaseId, StoreError> {
        let resp = self
            .client
            .clone()
            .lease_grant(ttl_secs, None)
            .await
            .map_err(backend)?;
        Ok(resp.id())
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<(), StoreError> {
        let (mut keeper, mut stream) = self
            .client
            .clone()
            .lease_keep_alive(lease)
            .await
            .map_err(backend)?;
        keeper.keep_alive().await.map_err(backend)?;
        match stream.message().await.map_err(backend)? {
            Some(resp) if resp.ttl() > 0 => Ok(()),
            _ => Err(StoreError::LeaseNotFound(lease)),
        }
    }

    async fn revoke(&self, lease: LeaseId) -> Result<(), StoreError> {
        match self.client.clone().lease_revoke(lease).await {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("lease not found") => {
                Err(StoreError::LeaseNotFound(lease))
            }
            Err(e) => Err(backend(e)),
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<(), StoreError> {
        let options = lease.map(|id| PutOptions::new().with_lease(id));
        match self.client.clone().put(key, value, options).await {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("lease not found") => {
                Err(StoreError::LeaseNotFound(lease.unwrap_or_default()))
            }
            Err(e) => Err(backend(e)),
        }
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let resp = self
            .client
            .clone()
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(backend)?;
        resp.kvs()
            .iter()
            .map(|kv| Ok((kv.key_str().map_err(backend)?.to_string(), kv.value().to_vec())))
            .collect()
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.client
            .clone()
            .delete(key, None)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream, StoreError> {
        let watch = self
            .client
            .clone()
            .watch(prefix, Some(WatchOptions::new().with_prefix()))
            .await
            .map_err(backend)?;
        let prefix = prefix.to_string();

        // One etcd response may carry several events; flatten them in order.
        let responses = stream::unfold(Some(watch), move |state| {
            let prefix = prefix.clone();
            async move {
                let mut watch = state?;
                match watch.1.message().await {
                    Ok(Some(resp)) if resp.canceled() => Some((
                        vec![Err(StoreError::WatchCancelled(prefix))],
                        None,
                    )),
                    Ok(Some(resp)) => {
                        let events: Vec<Result<WatchEvent, StoreError>> = resp
                            .events()
                            .iter()
                            .filter_map(|event| {
                                let kv = event.kv()?;
                                let key = match kv.key_str() {
                                    Ok(key) => key.to_string(),
                                    Err(e) => return Some(Err(backend(e))),
                                };
                                Some(Ok(match event.event_type() {
                                    EventType::Put => WatchEvent::Put {
                                        key,
                                        value: kv.value().to_vec(),
                                    },
                                    EventType::Delete => WatchEvent::Delete { key },
                                }))
                            })
                            .collect();
                        Some((events, Some(watch)))
                    }
                    Ok(None) => None,
                    Err(e) => Some((vec![Err(backend(e))], None)),
                }
            }
        });

        Ok(responses.flat_map(stream::iter).boxed())
    }
}
