use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use notify::{Config, Event, EventKind, PollWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::deploy::{DeployManager, DeploymentType};
use crate::flow::FlowConfig;
use crate::storage::{FILE_POLL_INTERVAL, FLOWS_FILE, FileStorage};

/// Redeploys the running graph when the flows file changes on disk, so an
/// external edit behaves like a reload deploy through the admin api.
///
/// The runtime's own saves also trip the watcher; those are filtered out by
/// comparing the stored revision against the deployed one before acting.
pub struct StorageWatcher {
    handles: Vec<JoinHandle<()>>,
}

impl StorageWatcher {
    pub fn spawn(storage: Arc<FileStorage>, deploys: Arc<DeployManager>) -> Result<Self> {
        Self::spawn_with_interval(storage, deploys, FILE_POLL_INTERVAL)
    }

    pub fn spawn_with_interval(
        storage: Arc<FileStorage>,
        deploys: Arc<DeployManager>,
        poll_interval: Duration,
    ) -> Result<Self> {
        let root = storage.root().to_path_buf();
        anyhow::ensure!(root.exists(), "storage root {} does not exist", root.display());

        let (tx, mut rx): (_, UnboundedReceiver<notify::Result<Event>>) =
            tokio::sync::mpsc::unbounded_channel();

        let watch_root = root.clone();
        let handle_watcher = tokio::spawn(async move {
            let mut watcher = match PollWatcher::new(
                move |res| {
                    let _ = tx.send(res);
                },
                Config::default().with_poll_interval(poll_interval),
            ) {
                Ok(watcher) => watcher,
                Err(e) => {
                    warn!(?e, "could not create storage watcher");
                    return;
                }
            };
            if let Err(e) = watcher.watch(&watch_root, RecursiveMode::NonRecursive) {
                warn!(?e, root = %watch_root.display(), "could not watch storage root");
                return;
            }
            // keep the watcher alive; events flow through the channel
            futures::future::pending::<()>().await;
        });

        let handle_dispatch = tokio::spawn(async move {
            while let Some(res) = rx.recv().await {
                match res {
                    Ok(Event {
                        kind: EventKind::Create(_) | EventKind::Modify(_),
                        paths,
                        ..
                    }) => {
                        if paths.iter().any(|p| is_flows_file(p)) {
                            reload_if_changed(&storage, &deploys).await;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!(?e, "storage watcher error"),
                }
            }
        });

        Ok(Self {
            handles: vec![handle_watcher, handle_dispatch],
        })
    }

    pub fn shutdown(self) {
        for handle in self.handles {
            handle.abort();
        }
    }
}

fn is_flows_file(path: &Path) -> bool {
    path.file_name().is_some_and(|n| n == FLOWS_FILE)
}

async fn reload_if_changed(storage: &Arc<FileStorage>, deploys: &Arc<DeployManager>) {
    let stored_rev = match storage
        .load_flows()
        .await
        .context("reading changed flows file")
    {
        Ok((config, _)) => config.rev(),
        Err(e) => {
            warn!(?e, "ignoring unreadable flows file change");
            return;
        }
    };

    if stored_rev == deploys.current_rev() {
        debug!("flows file change matches deployed revision; skipping reload");
        return;
    }

    info!("flows file changed on disk; reloading");
    if let Err(e) = deploys
        .deploy(FlowConfig::default(), DeploymentType::Reload)
        .await
    {
        warn!(%e, "reload after external flows change failed");
    }
}
