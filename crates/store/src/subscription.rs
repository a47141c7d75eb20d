//! List-then-watch driver that keeps one [`Mirror`] current.

use std::sync::Arc;
use std::time::Duration;

use archivist_core::{WatchAction, WatchEvent};
use futures::StreamExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::{Mirror, ResourceSource, SourceError, WatchItem};

#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    /// Periodic full relist; `None` relies on the watch stream alone.
    pub relist_interval: Option<Duration>,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            relist_interval: None,
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
        }
    }
}

struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max, next: initial }
    }

    fn next_delay(&mut self) -> Duration {
        let d = self.next;
        self.next = (self.next * 2).min(self.max);
        d
    }

    fn reset(&mut self) {
        self.next = self.initial;
    }
}

enum Step<K> {
    Stop,
    Relist,
    Item(Option<Result<WatchItem<K>, SourceError>>),
}

/// Sole writer of a mirror: performs a full list, then applies watch events until stopped.
///
/// Stream failures are handled here and never reach readers of the mirror.
/// An expired resource version forces a relist and other errors re-subscribe from the
/// last seen version; both wait out the backoff first. A stream that simply ends is
/// re-opened at once. The backoff resets only once a watch event has been applied.
/// Bookmarks advance the resume version without touching the mirror.
pub struct Subscription<K> {
    source: Arc<dyn ResourceSource<K>>,
    mirror: Arc<Mirror<K>>,
    config: SubscriptionConfig,
    span: Span,
}

impl<K: Send + Sync + 'static> Subscription<K> {
    pub fn new(source: Arc<dyn ResourceSource<K>>, mirror: Arc<Mirror<K>>, config: SubscriptionConfig) -> Self {
        let span = info_span!("subscription", kind = mirror.kind());
        Self { source, mirror, config, span }
    }

    /// Use `parent` as the parent of this subscription's log span.
    pub fn with_parent_span(mut self, parent: &Span) -> Self {
        self.span = info_span!(parent: parent, "subscription", kind = self.mirror.kind());
        self
    }

    pub fn mirror(&self) -> Arc<Mirror<K>> {
        Arc::clone(&self.mirror)
    }

    pub async fn run(self, stop: CancellationToken) {
        let span = self.span.clone();
        self.run_inner(stop).instrument(span).await
    }

    async fn run_inner(self, stop: CancellationToken) {
        let mut backoff = Backoff::new(self.config.backoff_initial, self.config.backoff_max);
        'relist: loop {
            let listed = tokio::select! {
                _ = stop.cancelled() => break 'relist,
                res = self.source.list() => res,
            };
            let mut rv = match listed {
                Ok(listing) => {
                    let count = listing.items.len();
                    if let Err(e) = self.mirror.replace(listing.items) {
                        error!(error = %e, "applying listing failed");
                    }
                    info!(objects = count, resource_version = %listing.resource_version, "initial list applied");
                    listing.resource_version
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(error = %e, delay_ms = delay.as_millis() as u64, "list failed; backing off");
                    if !sleep_or_stop(&stop, delay).await {
                        break 'relist;
                    }
                    continue 'relist;
                }
            };
            let relist_at = self.config.relist_interval.map(|d| Instant::now() + d);

            loop {
                let opened = tokio::select! {
                    _ = stop.cancelled() => break 'relist,
                    res = self.source.subscribe(&rv) => res,
                };
                let mut stream = match opened {
                    Ok(s) => s,
                    Err(SourceError::Expired(msg)) => {
                        let delay = backoff.next_delay();
                        info!(reason = %msg, delay_ms = delay.as_millis() as u64, "watch version expired; relisting");
                        if !sleep_or_stop(&stop, delay).await {
                            break 'relist;
                        }
                        continue 'relist;
                    }
                    Err(e) => {
                        let delay = backoff.next_delay();
                        warn!(error = %e, delay_ms = delay.as_millis() as u64, "watch failed; backing off");
                        if !sleep_or_stop(&stop, delay).await {
                            break 'relist;
                        }
                        continue;
                    }
                };
                debug!(resource_version = %rv, "watch started");

                loop {
                    let step = tokio::select! {
                        _ = stop.cancelled() => Step::Stop,
                        _ = relist_due(relist_at) => Step::Relist,
                        next = stream.next() => Step::Item(next),
                    };
                    match step {
                        Step::Stop => break 'relist,
                        Step::Relist => {
                            debug!("periodic relist");
                            continue 'relist;
                        }
                        Step::Item(Some(Ok(WatchItem::Event(ev)))) => {
                            if let Some(v) = ev.resource_version.as_ref() {
                                rv = v.clone();
                            }
                            self.apply(ev);
                            backoff.reset();
                        }
                        Step::Item(Some(Ok(WatchItem::Bookmark(v)))) => {
                            debug!(resource_version = %v, "bookmark");
                            rv = v;
                        }
                        Step::Item(Some(Err(SourceError::Expired(msg)))) => {
                            let delay = backoff.next_delay();
                            info!(reason = %msg, delay_ms = delay.as_millis() as u64, "watch version expired; relisting");
                            if !sleep_or_stop(&stop, delay).await {
                                break 'relist;
                            }
                            continue 'relist;
                        }
                        Step::Item(Some(Err(e))) => {
                            let delay = backoff.next_delay();
                            warn!(error = %e, delay_ms = delay.as_millis() as u64, "watch stream error; backing off");
                            if !sleep_or_stop(&stop, delay).await {
                                break 'relist;
                            }
                            break;
                        }
                        Step::Item(None) => {
                            debug!("watch stream ended; resubscribing");
                            break;
                        }
                    }
                }
            }
        }
        info!("subscription stopped");
    }

    fn apply(&self, ev: WatchEvent<K>) {
        let action = ev.action;
        let res = match action {
            WatchAction::Added | WatchAction::Modified => self.mirror.upsert(ev.object),
            WatchAction::Deleted => self.mirror.remove_object(&ev.object).map(|_| ()),
        };
        metrics::counter!("mirror_events_total", 1u64, "kind" => self.mirror.kind(), "action" => action.as_str());
        if let Err(e) = res {
            error!(error = %e, action = action.as_str(), "applying watch event failed");
        }
    }
}

async fn relist_due(at: Option<Instant>) {
    match at {
        Some(t) => tokio::time::sleep_until(t).await,
        None => futures::future::pending::<()>().await,
    }
}

/// Sleep for `d`; false if stopped first.
async fn sleep_or_stop(stop: &CancellationToken, d: Duration) -> bool {
    tokio::select! {
        _ = stop.cancelled() => false,
        _ = tokio::time::sleep(d) => true,
    }
}
