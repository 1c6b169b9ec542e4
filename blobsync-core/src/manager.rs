//! Persisted policy registry, per-policy metrics, and the scheduler loop.

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize};
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use blobsync_model::{ReplicationPolicy, ReplicationStatus, SyncResult};

use crate::audit::AuditLogger;
use crate::encryption::{EncrypterFactory, NoopEncrypterFactory};
use crate::error::{ReplicationError, Result};
use crate::metrics::ReplicationMetrics;
use crate::storage::BackendFactory;
use crate::syncer::Syncer;

/// Default on-disk location of the policy registry.
pub const DEFAULT_POLICY_FILE: &str = ".replication-policies.json";

/// Tunables for the manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub policy_file: PathBuf,
    /// Scheduler period for [`ReplicationManager::run`].
    pub interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            policy_file: PathBuf::from(DEFAULT_POLICY_FILE),
            interval: Duration::from_secs(60),
        }
    }
}

/// On-disk shape of the policy registry.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PolicyDocument {
    #[serde(default, deserialize_with = "null_as_empty")]
    policies: HashMap<String, ReplicationPolicy>,
}

/// A `"policies": null` field loads as an empty registry.
fn null_as_empty<'de, D>(
    deserializer: D,
) -> std::result::Result<HashMap<String, ReplicationPolicy>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<HashMap<String, ReplicationPolicy>> =
        Option::deserialize(deserializer)?;
    Ok(value.unwrap_or_default())
}

#[derive(Default)]
struct ManagerState {
    policies: HashMap<String, ReplicationPolicy>,
    metrics: HashMap<String, Arc<ReplicationMetrics>>,
    backend_factories: HashMap<String, Arc<dyn EncrypterFactory>>,
    source_factories: HashMap<String, Arc<dyn EncrypterFactory>>,
    destination_factories: HashMap<String, Arc<dyn EncrypterFactory>>,
}

impl ManagerState {
    fn metrics_for(&mut self, policy_id: &str) -> Arc<ReplicationMetrics> {
        self.metrics
            .entry(policy_id.to_string())
            .or_insert_with(|| Arc::new(ReplicationMetrics::new()))
            .clone()
    }

    /// Installed factory per layer, or a fresh noop.
    fn factories_for(
        &self,
        policy_id: &str,
    ) -> (
        Arc<dyn EncrypterFactory>,
        Arc<dyn EncrypterFactory>,
        Arc<dyn EncrypterFactory>,
    ) {
        let pick = |map: &HashMap<String, Arc<dyn EncrypterFactory>>| {
            map.get(policy_id).cloned().unwrap_or_else(|| {
                Arc::new(NoopEncrypterFactory::new())
                    as Arc<dyn EncrypterFactory>
            })
        };
        (
            pick(&self.backend_factories),
            pick(&self.source_factories),
            pick(&self.destination_factories),
        )
    }
}

/// Owns the persisted policy registry and drives sync passes, one syncer
/// per call. All map state sits behind one RwLock; read-heavy accessors
/// take the read guard.
pub struct ReplicationManager {
    config: ManagerConfig,
    state: RwLock<ManagerState>,
    backends: Arc<dyn BackendFactory>,
    audit: Arc<dyn AuditLogger>,
    stop: CancellationToken,
}

impl fmt::Debug for ReplicationManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicationManager")
            .field("policy_file", &self.config.policy_file)
            .field("interval", &self.config.interval)
            .finish()
    }
}

impl ReplicationManager {
    /// Loads the registry from `config.policy_file`. A missing file is an
    /// empty registry; malformed JSON is fatal.
    pub fn new(
        config: ManagerConfig,
        backends: Arc<dyn BackendFactory>,
        audit: Arc<dyn AuditLogger>,
    ) -> Result<Self> {
        let mut state = ManagerState::default();
        if config.policy_file.exists() {
            let raw = fs::read_to_string(&config.policy_file)?;
            let document: PolicyDocument = serde_json::from_str(&raw)?;
            state.policies = document.policies;
            for id in state.policies.keys() {
                state
                    .metrics
                    .insert(id.clone(), Arc::new(ReplicationMetrics::new()));
            }
            info!(
                "loaded {} replication policies from {}",
                state.policies.len(),
                config.policy_file.display()
            );
        }

        Ok(ReplicationManager {
            config,
            state: RwLock::new(state),
            backends,
            audit,
            stop: CancellationToken::new(),
        })
    }

    /// Writes the registry document. Callers hold the state lock.
    fn save_locked(
        &self,
        policies: &HashMap<String, ReplicationPolicy>,
    ) -> Result<()> {
        let document = PolicyDocument {
            policies: policies.clone(),
        };
        let json = serde_json::to_vec_pretty(&document)?;

        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&self.config.policy_file)?;
        file.write_all(&json)?;
        file.sync_all()?;
        Ok(())
    }

    /// Adds or overwrites a policy and persists the registry.
    pub async fn add_policy(&self, policy: ReplicationPolicy) -> Result<()> {
        policy.validate()?;

        let mut state = self.state.write().await;
        let id = policy.id.clone();
        state.policies.insert(id.clone(), policy);
        state.metrics_for(&id);
        self.save_locked(&state.policies)?;
        info!("added replication policy {id}");
        Ok(())
    }

    /// Removes a policy along with its metrics and encrypter factories.
    pub async fn remove_policy(&self, policy_id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if state.policies.remove(policy_id).is_none() {
            return Err(ReplicationError::PolicyNotFound(
                policy_id.to_string(),
            ));
        }
        state.metrics.remove(policy_id);
        state.backend_factories.remove(policy_id);
        state.source_factories.remove(policy_id);
        state.destination_factories.remove(policy_id);
        self.save_locked(&state.policies)?;
        info!("removed replication policy {policy_id}");
        Ok(())
    }

    pub async fn get_policy(
        &self,
        policy_id: &str,
    ) -> Result<ReplicationPolicy> {
        let state = self.state.read().await;
        state.policies.get(policy_id).cloned().ok_or_else(|| {
            ReplicationError::PolicyNotFound(policy_id.to_string())
        })
    }

    pub async fn get_policies(&self) -> Vec<ReplicationPolicy> {
        let state = self.state.read().await;
        state.policies.values().cloned().collect()
    }

    /// Flips a policy's enabled flag and persists the registry.
    pub async fn set_policy_enabled(
        &self,
        policy_id: &str,
        enabled: bool,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let policy = state.policies.get_mut(policy_id).ok_or_else(|| {
            ReplicationError::PolicyNotFound(policy_id.to_string())
        })?;
        policy.enabled = enabled;
        self.save_locked(&state.policies)?;
        Ok(())
    }

    pub async fn get_replication_status(
        &self,
        policy_id: &str,
    ) -> Result<ReplicationStatus> {
        let state = self.state.read().await;
        let policy = state.policies.get(policy_id).ok_or_else(|| {
            ReplicationError::PolicyNotFound(policy_id.to_string())
        })?;
        let metrics = state
            .metrics
            .get(policy_id)
            .map(|metrics| metrics.snapshot())
            .unwrap_or_default();
        Ok(status_of(policy, metrics))
    }

    pub async fn get_replication_status_all(&self) -> Vec<ReplicationStatus> {
        let state = self.state.read().await;
        state
            .policies
            .values()
            .map(|policy| {
                let metrics = state
                    .metrics
                    .get(&policy.id)
                    .map(|metrics| metrics.snapshot())
                    .unwrap_or_default();
                status_of(policy, metrics)
            })
            .collect()
    }

    /// Zeroes a policy's counters. Operator tooling, not the hot path.
    pub async fn reset_metrics(&self, policy_id: &str) -> Result<()> {
        let state = self.state.read().await;
        let metrics = state.metrics.get(policy_id).ok_or_else(|| {
            ReplicationError::PolicyNotFound(policy_id.to_string())
        })?;
        metrics.reset();
        Ok(())
    }

    pub async fn set_backend_encrypter_factory(
        &self,
        policy_id: &str,
        factory: Arc<dyn EncrypterFactory>,
    ) -> Result<()> {
        self.install_factory(policy_id, factory, Layer::Backend).await
    }

    pub async fn set_source_encrypter_factory(
        &self,
        policy_id: &str,
        factory: Arc<dyn EncrypterFactory>,
    ) -> Result<()> {
        self.install_factory(policy_id, factory, Layer::Source).await
    }

    pub async fn set_destination_encrypter_factory(
        &self,
        policy_id: &str,
        factory: Arc<dyn EncrypterFactory>,
    ) -> Result<()> {
        self.install_factory(policy_id, factory, Layer::Destination)
            .await
    }

    async fn install_factory(
        &self,
        policy_id: &str,
        factory: Arc<dyn EncrypterFactory>,
        layer: Layer,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.policies.contains_key(policy_id) {
            return Err(ReplicationError::PolicyNotFound(
                policy_id.to_string(),
            ));
        }
        let map = match layer {
            Layer::Backend => &mut state.backend_factories,
            Layer::Source => &mut state.source_factories,
            Layer::Destination => &mut state.destination_factories,
        };
        map.insert(policy_id.to_string(), factory);
        Ok(())
    }

    /// One full sync pass for a policy.
    pub async fn sync_policy(&self, policy_id: &str) -> Result<SyncResult> {
        self.run_sync(policy_id, None).await
    }

    /// One full sync pass fanned out over `workers` parallel workers.
    pub async fn sync_policy_parallel(
        &self,
        policy_id: &str,
        workers: usize,
    ) -> Result<SyncResult> {
        self.run_sync(policy_id, Some(workers)).await
    }

    async fn run_sync(
        &self,
        policy_id: &str,
        workers: Option<usize>,
    ) -> Result<SyncResult> {
        let (policy, backend_f, source_f, dest_f, metrics) = {
            let mut state = self.state.write().await;
            let policy =
                state.policies.get(policy_id).cloned().ok_or_else(|| {
                    ReplicationError::PolicyNotFound(policy_id.to_string())
                })?;
            let metrics = state.metrics_for(policy_id);
            let (backend_f, source_f, dest_f) =
                state.factories_for(policy_id);
            (policy, backend_f, source_f, dest_f, metrics)
        };

        let syncer = Syncer::new(
            policy,
            self.backends.clone(),
            backend_f,
            source_f,
            dest_f,
            self.audit.clone(),
        )
        .await?;

        let result = match workers {
            None => syncer.sync_all().await?,
            Some(workers) => syncer.sync_all_parallel(workers).await?,
        };
        metrics.record_result(&result);

        // Post-sync bookkeeping: stamp the policy and persist best-effort.
        {
            let mut state = self.state.write().await;
            if let Some(policy) = state.policies.get_mut(policy_id) {
                policy.last_sync_time = Some(Utc::now());
                if let Err(err) = self.save_locked(&state.policies) {
                    warn!(
                        "failed to persist last sync time for \
                         {policy_id}: {err}"
                    );
                }
            }
        }

        Ok(result)
    }

    /// Syncs every enabled policy, folding the outcomes into one aggregate
    /// result (`policy_id = "all"`). Individual policy failures are tallied
    /// and never abort the pass.
    pub async fn sync_all(&self) -> Result<SyncResult> {
        let started = Instant::now();
        let policies = self.get_policies().await;

        let mut aggregate = SyncResult::new("all");
        for policy in policies {
            if !policy.enabled {
                debug!("skipping disabled policy {}", policy.id);
                continue;
            }
            match self.sync_policy(&policy.id).await {
                Ok(result) => {
                    aggregate.synced += result.synced;
                    aggregate.deleted += result.deleted;
                    aggregate.failed += result.failed;
                    aggregate.bytes_total += result.bytes_total;
                    aggregate.errors.extend(result.errors);
                }
                Err(err) => {
                    error!("sync failed for policy {}: {err}", policy.id);
                    aggregate.failed += 1;
                    aggregate.errors.push(format!("{}: {err}", policy.id));
                }
            }
        }

        aggregate.duration = started.elapsed();
        Ok(aggregate)
    }

    /// Scheduler loop: one [`ReplicationManager::sync_all`] per interval
    /// tick, until `cancel` fires or [`ReplicationManager::stop`] is
    /// called.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of a tokio interval is immediate; consume it so
        // passes start one full interval after startup.
        ticker.tick().await;

        info!(
            "replication scheduler started (interval {:?})",
            self.config.interval
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.stop.cancelled() => break,
                _ = ticker.tick() => {
                    match self.sync_all().await {
                        Ok(result) => info!(
                            "scheduled sync pass: {} synced, {} failed in \
                             {:?}",
                            result.synced, result.failed, result.duration
                        ),
                        Err(err) => {
                            error!("scheduled sync pass failed: {err}");
                        }
                    }
                }
            }
        }
        info!("replication scheduler stopped");
    }

    /// Stops a running scheduler loop. Idempotent.
    pub fn stop(&self) {
        self.stop.cancel();
    }
}

enum Layer {
    Backend,
    Source,
    Destination,
}

fn status_of(
    policy: &ReplicationPolicy,
    metrics: blobsync_model::MetricsSnapshot,
) -> ReplicationStatus {
    ReplicationStatus {
        policy_id: policy.id.clone(),
        source_backend: policy.source_backend.clone(),
        destination_backend: policy.destination_backend.clone(),
        enabled: policy.enabled,
        replication_mode: policy.replication_mode,
        last_sync_time: policy.last_sync_time,
        metrics,
    }
}
