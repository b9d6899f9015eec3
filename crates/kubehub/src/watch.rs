//! List+watch wiring that turns watch events into [`Change`]s on a channel.

use std::fmt::Debug;

use anyhow::{Context, Result};
use futures::StreamExt;
use kube::{
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Api, Client, Resource,
};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Applied,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct Change<K> {
    pub kind: ChangeKind,
    pub object: K,
}

impl<K> Change<K> {
    pub fn applied(object: K) -> Self {
        Self { kind: ChangeKind::Applied, object }
    }

    pub fn deleted(object: K) -> Self {
        Self { kind: ChangeKind::Deleted, object }
    }
}

pub async fn client() -> Result<Client> {
    Client::try_default().await.context("building kube client from default config")
}

/// Run list+watch on `api` and forward every observed change. Watch errors are retried
/// with kube's default backoff; returns when the receiver is dropped.
pub async fn start_watcher<K>(api: Api<K>, label: &str, tx: mpsc::Sender<Change<K>>) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    info!(kind = %label, "watcher started");
    while let Some(ev) = stream.next().await {
        let changes = match ev {
            Ok(Event::Applied(o)) => vec![Change::applied(o)],
            Ok(Event::Deleted(o)) => vec![Change::deleted(o)],
            Ok(Event::Restarted(list)) => {
                debug!(kind = %label, count = list.len(), "watch restart");
                list.into_iter().map(Change::applied).collect()
            }
            Err(e) => {
                warn!(kind = %label, error = %e, "watch error; backing off");
                continue;
            }
        };
        for c in changes {
            if tx.send(c).await.is_err() {
                debug!(kind = %label, "change receiver dropped; stopping watcher");
                return Ok(());
            }
        }
    }
    warn!(kind = %label, "watcher stream ended");
    Ok(())
}
