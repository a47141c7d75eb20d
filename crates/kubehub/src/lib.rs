//! Archivist kubehub: list/watch wiring against the cluster API.

#![forbid(unsafe_code)]

use std::fmt::Debug;

use anyhow::{anyhow, Context, Result};
use archivist_core::{BuildRecord, NamespaceRecord, ReplicaSetRecord, WatchAction, WatchEvent};
use archivist_store::{EventStream, Listing, ResourceSource, SourceError, WatchItem};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Namespace, ReplicationController};
use kube::{
    api::{Api, ListParams, WatchEvent as KubeEvent, WatchParams},
    core::{ApiResource, DynamicObject, ErrorResponse, GroupVersionKind},
    Client, Resource, ResourceExt,
};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

/// Create a client from the default kubeconfig / in-cluster environment.
pub async fn connect() -> Result<Client> {
    let client = Client::try_default().await.context("creating kube client")?;
    info!(default_namespace = %client.default_namespace(), "kube client ready");
    Ok(client)
}

/// OpenShift builds are not part of k8s-openapi; they are read as dynamic objects.
pub fn build_api_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk("build.openshift.io", "v1", "Build"), "builds")
}

pub fn namespace_record(ns: &Namespace) -> Option<NamespaceRecord> {
    let name = ns.metadata.name.clone()?;
    Some(NamespaceRecord { name, created: ns.metadata.creation_timestamp.as_ref().map(|t| t.0) })
}

pub fn build_record(obj: &DynamicObject) -> Option<BuildRecord> {
    let namespace = obj.metadata.namespace.clone()?;
    let name = obj.metadata.name.clone()?;
    let started = obj
        .data
        .pointer("/status/startTimestamp")
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));
    Some(BuildRecord { namespace, name, started })
}

pub fn replica_set_record(rc: &ReplicationController) -> Option<ReplicaSetRecord> {
    let namespace = rc.metadata.namespace.clone()?;
    let name = rc.metadata.name.clone()?;
    Some(ReplicaSetRecord { namespace, name, created: rc.metadata.creation_timestamp.as_ref().map(|t| t.0) })
}

/// [`ResourceSource`] over a kube `Api`, converting each object into a mirrored record.
pub struct KubeSource<R, K> {
    kind: &'static str,
    api: Api<R>,
    convert: fn(&R) -> Option<K>,
}

impl<R, K> KubeSource<R, K> {
    pub fn new(kind: &'static str, api: Api<R>, convert: fn(&R) -> Option<K>) -> Self {
        Self { kind, api, convert }
    }
}

pub fn namespace_source(client: Client) -> KubeSource<Namespace, NamespaceRecord> {
    KubeSource::new("namespaces", Api::all(client), namespace_record)
}

pub fn build_source(client: Client) -> KubeSource<DynamicObject, BuildRecord> {
    KubeSource::new("builds", Api::all_with(client, &build_api_resource()), build_record)
}

pub fn replication_controller_source(client: Client) -> KubeSource<ReplicationController, ReplicaSetRecord> {
    KubeSource::new("replicationcontrollers", Api::all(client), replica_set_record)
}

fn is_gone(resp: &ErrorResponse) -> bool {
    resp.code == 410
}

fn map_kube_err(e: kube::Error) -> SourceError {
    match e {
        kube::Error::Api(resp) if is_gone(&resp) => SourceError::Expired(resp.message),
        other => SourceError::Other(anyhow::Error::new(other)),
    }
}

fn translate<R, K>(
    kind: &'static str,
    convert: fn(&R) -> Option<K>,
    ev: kube::Result<KubeEvent<R>>,
) -> Option<Result<WatchItem<K>, SourceError>>
where
    R: Resource,
{
    let (action, obj) = match ev {
        Err(e) => return Some(Err(map_kube_err(e))),
        Ok(KubeEvent::Added(o)) => (WatchAction::Added, o),
        Ok(KubeEvent::Modified(o)) => (WatchAction::Modified, o),
        Ok(KubeEvent::Deleted(o)) => (WatchAction::Deleted, o),
        Ok(KubeEvent::Bookmark(b)) => return Some(Ok(WatchItem::Bookmark(b.metadata.resource_version))),
        Ok(KubeEvent::Error(resp)) if is_gone(&resp) => return Some(Err(SourceError::Expired(resp.message))),
        Ok(KubeEvent::Error(resp)) => {
            return Some(Err(SourceError::Other(anyhow!("watch error {}: {}", resp.code, resp.message))))
        }
    };
    match convert(&obj) {
        Some(object) => Some(Ok(WatchItem::Event(WatchEvent { action, object, resource_version: obj.resource_version() }))),
        None => {
            debug!(kind, name = %obj.name_any(), "skipping object without name/namespace");
            None
        }
    }
}

#[async_trait]
impl<R, K> ResourceSource<K> for KubeSource<R, K>
where
    R: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K: Send + Sync + 'static,
{
    async fn list(&self) -> Result<Listing<K>, SourceError> {
        let list = self.api.list(&ListParams::default()).await.map_err(map_kube_err)?;
        metrics::counter!("kube_list_total", 1u64, "kind" => self.kind);
        let resource_version = list.metadata.resource_version.clone().unwrap_or_default();
        let items: Vec<K> = list.items.iter().filter_map(|o| (self.convert)(o)).collect();
        debug!(kind = self.kind, listed = list.items.len(), kept = items.len(), %resource_version, "listed");
        Ok(Listing { items, resource_version })
    }

    async fn subscribe(&self, resource_version: &str) -> Result<EventStream<K>, SourceError> {
        let stream = self.api.watch(&WatchParams::default(), resource_version).await.map_err(map_kube_err)?;
        let (kind, convert) = (self.kind, self.convert);
        Ok(stream
            .filter_map(move |ev| futures::future::ready(translate(kind, convert, ev)))
            .boxed())
    }
}
