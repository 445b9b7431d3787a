use futures::Stream;
use prost::Message;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::{
    error::OracleError,
    protos::oracle::v1::{DataMessage, Report, Request},
    types::{EpochKey, RequestKey},
};

/// Key-value store the engine persists its records in.
///
/// Implementations must make `set` visible to subsequent `get`/`scan_prefix` calls from
/// the same process.
#[async_trait::async_trait]
pub trait DurableStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, OracleError>;

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), OracleError>;

    /// All live entries whose key starts with `prefix`, in key order.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, OracleError>;
}

struct StoredValue {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

/// In-memory implementation of [`DurableStore`].
#[derive(Default)]
pub struct InMemoryDurableStore {
    entries: Arc<RwLock<BTreeMap<String, StoredValue>>>,
}

impl InMemoryDurableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes expired entries.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, stored| stored.is_live(now));
        before - entries.len()
    }
}

#[async_trait::async_trait]
impl DurableStore for InMemoryDurableStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, OracleError> {
        let entries = self.entries.read().await;
        let now = Instant::now();
        Ok(entries
            .get(key)
            .filter(|stored| stored.is_live(now))
            .map(|stored| stored.value.clone()))
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), OracleError> {
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            StoredValue {
                value,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, OracleError> {
        let entries = self.entries.read().await;
        let now = Instant::now();
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .filter(|(_, stored)| stored.is_live(now))
            .map(|(key, stored)| (key.clone(), stored.value.clone()))
            .collect())
    }
}

pub fn request_key(key: &RequestKey) -> String {
    format!("request/{}/{}", key.chain_id, key.request_id)
}

pub fn request_prefix(chain_id: &str) -> String {
    format!("request/{chain_id}/")
}

pub fn report_key(key: &EpochKey) -> String {
    format!(
        "report/{}/{}/{}",
        key.request.chain_id, key.request.request_id, key.epoch
    )
}

pub fn data_message_key(key: &EpochKey) -> String {
    format!(
        "data/{}/{}/{}",
        key.request.chain_id, key.request.request_id, key.epoch
    )
}

/// Typed access to the records the engine persists.
///
/// Read-modify-write of a [`Request`] goes through [`RecordStore::update_request`] or runs
/// under [`RecordStore::lock_request`], so concurrent steps of one request never lose each
/// other's updates.
pub struct RecordStore<S: DurableStore> {
    store: Arc<S>,
    record_ttl: Option<Duration>,
    locks: Arc<parking_lot::Mutex<HashMap<RequestKey, Arc<Mutex<()>>>>>,
}

impl<S: DurableStore> Clone for RecordStore<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            record_ttl: self.record_ttl,
            locks: Arc::clone(&self.locks),
        }
    }
}

impl<S: DurableStore> RecordStore<S> {
    pub fn new(store: Arc<S>, record_ttl: Option<Duration>) -> Self {
        Self {
            store,
            record_ttl,
            locks: Arc::new(parking_lot::Mutex::new(HashMap::new())),
        }
    }

    /// Exclusive access to one request record until the guard is dropped.
    pub async fn lock_request(&self, key: &RequestKey) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(self.locks.lock().entry(key.clone()).or_default());
        lock.lock_owned().await
    }

    /// Loads, mutates and saves a request under its lock.
    pub async fn update_request<R, F>(&self, key: &RequestKey, mutator: F) -> Result<R, OracleError>
    where
        R: Send,
        F: FnOnce(&mut Request) -> R + Send,
    {
        let _guard = self.lock_request(key).await;
        let mut request = self
            .get_request(key)
            .await?
            .ok_or(OracleError::RequestNotFound)?;
        let result = mutator(&mut request);
        self.save_request(&request).await?;
        Ok(result)
    }

    pub fn inner(&self) -> &Arc<S> {
        &self.store
    }

    async fn load<M: Message + Default>(&self, key: &str) -> Result<Option<M>, OracleError> {
        match self.store.get(key).await? {
            Some(bytes) => Ok(Some(M::decode(bytes.as_slice())?)),
            None => Ok(None),
        }
    }

    pub async fn get_request(&self, key: &RequestKey) -> Result<Option<Request>, OracleError> {
        self.load(&request_key(key)).await
    }

    pub async fn save_request(&self, request: &Request) -> Result<(), OracleError> {
        self.store
            .set(&request_key(&request.key()), request.encode_to_vec(), None)
            .await
    }

    pub async fn get_report(&self, key: &EpochKey) -> Result<Option<Report>, OracleError> {
        self.load(&report_key(key)).await
    }

    pub async fn save_report(&self, report: &Report) -> Result<(), OracleError> {
        let key = RequestKey::new(report.chain_id.clone(), report.request_id.clone())
            .at_epoch(report.epoch);
        self.store
            .set(&report_key(&key), report.encode_to_vec(), self.record_ttl)
            .await
    }

    pub async fn get_data_message(
        &self,
        key: &EpochKey,
    ) -> Result<Option<DataMessage>, OracleError> {
        self.load(&data_message_key(key)).await
    }

    pub async fn save_data_message(&self, message: &DataMessage) -> Result<(), OracleError> {
        let key = RequestKey::new(message.chain_id.clone(), message.request_id.clone())
            .at_epoch(message.epoch);
        self.store
            .set(
                &data_message_key(&key),
                message.encode_to_vec(),
                self.record_ttl,
            )
            .await
    }

    /// Requests of a chain matching `predicate`.
    pub async fn filter_requests<F>(
        &self,
        chain_id: &str,
        predicate: F,
    ) -> Result<Vec<Request>, OracleError>
    where
        F: Fn(&Request) -> bool,
    {
        let mut requests = Vec::new();
        for (_, bytes) in self.store.scan_prefix(&request_prefix(chain_id)).await? {
            let request = Request::decode(bytes.as_slice())?;
            if predicate(&request) {
                requests.push(request);
            }
        }
        Ok(requests)
    }

    pub async fn list_requests(&self, chain_id: &str) -> Result<Vec<Request>, OracleError> {
        self.filter_requests(chain_id, |_| true).await
    }

    /// Streams a chain's requests one by one, decoding lazily.
    pub fn stream_requests(
        &self,
        chain_id: &str,
    ) -> impl Stream<Item = Result<Request, OracleError>> + Send + use<S> {
        let store = Arc::clone(&self.store);
        let prefix = request_prefix(chain_id);
        async_stream::try_stream! {
            let entries = store.scan_prefix(&prefix).await?;
            for (_, bytes) in entries {
                yield Request::decode(bytes.as_slice()).map_err(OracleError::from)?;
            }
        }
    }
}
