//! Remote list + watch capability, and an in-memory fake for tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use archivist_core::WatchEvent;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::mpsc;

/// Full snapshot of a collection plus the version to resume watching from.
#[derive(Debug, Clone)]
pub struct Listing<K> {
    pub items: Vec<K>,
    pub resource_version: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The requested resource version is no longer served; a full relist is required.
    #[error("resource version expired: {0}")]
    Expired(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// One item of a watch stream: a change, or a bookmark that only advances the version.
#[derive(Debug, Clone)]
pub enum WatchItem<K> {
    Event(WatchEvent<K>),
    Bookmark(String),
}

pub type EventStream<K> = BoxStream<'static, Result<WatchItem<K>, SourceError>>;

/// List + incremental watch over one remote resource kind.
#[async_trait]
pub trait ResourceSource<K>: Send + Sync {
    async fn list(&self) -> Result<Listing<K>, SourceError>;

    /// Stream changes that happened after `resource_version`.
    async fn subscribe(&self, resource_version: &str) -> Result<EventStream<K>, SourceError>;
}

type Queued<K> = Result<WatchItem<K>, SourceError>;

/// In-memory source: `list` returns the seeded items, `subscribe` streams whatever
/// the test pushes with [`FakeSource::push`].
///
/// Failures can be scripted at three points: the stream ([`FakeSource::fail`]), the
/// next `list` call ([`FakeSource::fail_list`]) and the next `subscribe` call
/// ([`FakeSource::fail_subscribe`]).
pub struct FakeSource<K> {
    items: Mutex<Vec<K>>,
    tx: mpsc::UnboundedSender<Queued<K>>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Queued<K>>>>,
    list_errors: Mutex<VecDeque<SourceError>>,
    subscribe_errors: Mutex<VecDeque<SourceError>>,
    lists: Mutex<u32>,
    subscribed: Mutex<Vec<String>>,
}

impl<K: Clone + Send + 'static> FakeSource<K> {
    pub fn new(items: Vec<K>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            items: Mutex::new(items),
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            list_errors: Mutex::new(VecDeque::new()),
            subscribe_errors: Mutex::new(VecDeque::new()),
            lists: Mutex::new(0),
            subscribed: Mutex::new(Vec::new()),
        }
    }

    /// Queue an event for the watch stream.
    pub fn push(&self, ev: WatchEvent<K>) {
        let _ = self.tx.send(Ok(WatchItem::Event(ev)));
    }

    /// Queue a bookmark carrying `resource_version`.
    pub fn bookmark(&self, resource_version: impl Into<String>) {
        let _ = self.tx.send(Ok(WatchItem::Bookmark(resource_version.into())));
    }

    /// Queue a stream failure.
    pub fn fail(&self, err: SourceError) {
        let _ = self.tx.send(Err(err));
    }

    /// Fail one upcoming `list` call with `err`. Calls queue up in order.
    pub fn fail_list(&self, err: SourceError) {
        if let Ok(mut q) = self.list_errors.lock() {
            q.push_back(err);
        }
    }

    /// Fail one upcoming `subscribe` call with `err`. Calls queue up in order.
    pub fn fail_subscribe(&self, err: SourceError) {
        if let Ok(mut q) = self.subscribe_errors.lock() {
            q.push_back(err);
        }
    }

    /// Resource versions passed to `subscribe`, in call order.
    pub fn subscribed_versions(&self) -> Vec<String> {
        self.subscribed.lock().map(|g| g.clone()).unwrap_or_default()
    }

    /// Change what the next `list` call returns.
    pub fn set_items(&self, items: Vec<K>) {
        if let Ok(mut g) = self.items.lock() {
            *g = items;
        }
    }

    /// Number of `list` calls served so far.
    pub fn list_calls(&self) -> u32 {
        self.lists.lock().map(|g| *g).unwrap_or(0)
    }
}

#[async_trait]
impl<K: Clone + Send + Sync + 'static> ResourceSource<K> for FakeSource<K> {
    async fn list(&self) -> Result<Listing<K>, SourceError> {
        let n = {
            let mut g = self.lists.lock().map_err(|_| anyhow::anyhow!("fake source poisoned"))?;
            *g += 1;
            *g
        };
        if let Some(err) = self.list_errors.lock().map_err(|_| anyhow::anyhow!("fake source poisoned"))?.pop_front() {
            return Err(err);
        }
        let items = self.items.lock().map_err(|_| anyhow::anyhow!("fake source poisoned"))?.clone();
        Ok(Listing { items, resource_version: n.to_string() })
    }

    async fn subscribe(&self, resource_version: &str) -> Result<EventStream<K>, SourceError> {
        self.subscribed
            .lock()
            .map_err(|_| anyhow::anyhow!("fake source poisoned"))?
            .push(resource_version.to_string());
        if let Some(err) =
            self.subscribe_errors.lock().map_err(|_| anyhow::anyhow!("fake source poisoned"))?.pop_front()
        {
            return Err(err);
        }
        // Streams share one queue; a dropped stream leaves pending events for the next one.
        let rx = Arc::clone(&self.rx);
        Ok(stream::unfold(rx, |rx| async move {
            let ev = rx.lock().await.recv().await;
            ev.map(|ev| (ev, rx))
        })
        .boxed())
    }
}
