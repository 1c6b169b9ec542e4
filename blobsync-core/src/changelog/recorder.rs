use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use blobsync_model::{ChangeEvent, FileSystemEvent};

use super::ChangeLog;

/// Spawns the glue task that drains watcher events into the change log.
///
/// Keys are event paths relative to `root`, `/`-separated; events outside
/// `root` fall back to the full path. Recording failures are logged and the
/// event is dropped (the watcher channel is not the durable layer). The task
/// exits when the watcher closes its channel.
pub fn spawn_change_recorder(
    events: Arc<Mutex<mpsc::Receiver<FileSystemEvent>>>,
    changelog: Arc<dyn ChangeLog>,
    root: PathBuf,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = { events.lock().await.recv().await };
            let Some(event) = event else { break };

            let key = match event.path.strip_prefix(&root) {
                Ok(relative) => {
                    relative.to_string_lossy().replace('\\', "/")
                }
                Err(_) => event.path.to_string_lossy().into_owned(),
            };
            if key.is_empty() {
                continue;
            }

            let mut change = ChangeEvent::new(key, event.operation);
            change.timestamp = Some(event.timestamp);
            if let Err(err) = changelog.record_change(change) {
                warn!(
                    "failed to record change for {}: {err}",
                    event.path.display()
                );
            }
        }
        debug!("change recorder stopped; watcher channel closed");
    })
}
