//! # Service
//!
//! Wires everything together: loads the declarative config into the store,
//! spins up one [`BundleWorker`] per bundle on the deadline pool, and keeps
//! the worker set in sync with the store. Workers whose in-store view
//! changed retire themselves and are replaced on the next reconcile pass.

pub mod api;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::{parse_duration, Bundle, Config, Source, Stack};
use crate::observability::metrics;
use crate::pool::Pool;
use crate::store::{Caller, Principal, Store};
use crate::sync::{DatabaseSynchronizer, GitSynchronizer, HttpSynchronizer, Synchronizer};
use crate::worker::{BundleWorker, WorkerConfig, WorkerShared};

pub struct Service {
    store: Arc<Store>,
    pool: Arc<Pool>,
    data_dir: PathBuf,
    reload_interval: Duration,
    error_interval: Duration,
    single_shot: bool,
    workers: Mutex<HashMap<String, Arc<WorkerShared>>>,
    reload_notify: Notify,
}

impl Service {
    pub fn new(
        store: Arc<Store>,
        service_config: &crate::config::Service,
        single_shot: bool,
    ) -> Result<Arc<Self>> {
        let reload_interval = parse_duration(&service_config.reload_interval)
            .map_err(|e| anyhow::anyhow!(e))?;
        let error_interval =
            parse_duration(&service_config.error_interval).map_err(|e| anyhow::anyhow!(e))?;
        Ok(Arc::new(Self {
            store,
            pool: Arc::new(Pool::new(service_config.workers)),
            data_dir: service_config.data_dir.clone(),
            reload_interval,
            error_interval,
            single_shot,
            workers: Mutex::new(HashMap::new()),
            reload_notify: Notify::new(),
        }))
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Load the declarative config into the store as the internal
    /// principal: tenants first, then principals/tokens and secrets, then
    /// sources, stacks and bundles (requirement rows resolve source ids).
    pub async fn load_config(&self, config: &Config) -> Result<()> {
        for tenant in config.tenants() {
            self.store
                .upsert_tenant(&Caller::internal(&tenant), &tenant)
                .await
                .with_context(|| format!("create tenant {tenant:?}"))?;
        }
        for token in config.tokens.values() {
            let caller = Caller::internal(&token.tenant);
            self.store
                .upsert_principal(
                    &caller,
                    &Principal {
                        id: token.name.clone(),
                        role: token.role.clone(),
                        tenant: token.tenant.clone(),
                    },
                )
                .await
                .with_context(|| format!("create principal {:?}", token.name))?;
            self.store
                .upsert_token(&caller, token)
                .await
                .with_context(|| format!("create token {:?}", token.name))?;
        }
        for secret in config.secrets.values() {
            self.store
                .upsert_secret(&Caller::internal(&secret.tenant), secret)
                .await
                .with_context(|| format!("create secret {:?}", secret.name))?;
        }
        for source in config.sources.values() {
            self.store
                .upsert_source(&Caller::internal(&source.tenant), source)
                .await
                .with_context(|| format!("create source {:?}", source.name))?;
        }
        for stack in config.stacks.values() {
            self.store
                .upsert_stack(&Caller::internal(&stack.tenant), stack)
                .await
                .with_context(|| format!("create stack {:?}", stack.name))?;
        }
        for bundle in config.bundles.values() {
            self.store
                .upsert_bundle(&Caller::internal(&bundle.tenant), bundle)
                .await
                .with_context(|| format!("create bundle {:?}", bundle.name))?;
        }
        Ok(())
    }

    /// Ask the reconcile loop to re-read the store soon.
    pub fn notify_reload(&self) {
        self.reload_notify.notify_one();
    }

    /// Schedule an immediate pass for every worker that consumes `source`.
    pub fn trigger_source(&self, tenant: &str, source: &str) {
        let workers = self.workers.lock().expect("workers mutex poisoned");
        for (name, shared) in workers.iter() {
            if shared.uses_source(tenant, source) {
                if let Err(e) = self.pool.trigger(name) {
                    warn!(worker = %name, error = %e, "trigger failed");
                }
            }
        }
    }

    /// Run the reconcile loop until `shutdown` fires (or, in single-shot
    /// mode, until every worker finished one pass).
    pub async fn run(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let handles = self.pool.run();

        loop {
            if let Err(e) = self.sync_workers().await {
                error!(error = %e, "worker reconciliation failed");
            }

            if self.single_shot {
                while !self.pool.is_idle() {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.reload_interval) => {}
                _ = self.reload_notify.notified() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("shutting down worker pool");
        self.pool.shutdown();
        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }

    /// Bring the worker set in line with the store: mark changed/removed
    /// workers for retirement, replace retired ones, add workers for new
    /// bundles.
    async fn sync_workers(&self) -> Result<()> {
        let root = Caller::internal("default");
        let tenants = self.store.list_tenants(&root).await?;

        let mut desired: HashMap<String, (Caller, WorkerConfig)> = HashMap::new();
        for tenant in tenants {
            let caller = Caller::internal(&tenant);
            for bundle in all_bundles(&self.store, &caller).await? {
                let (sources, stacks) = self.resolve_closure(&caller, &bundle).await?;
                let name = format!("{tenant}/{}", bundle.name);
                desired.insert(
                    name,
                    (
                        caller.clone(),
                        WorkerConfig {
                            bundle,
                            sources,
                            stacks,
                        },
                    ),
                );
            }
        }

        // Reconcile the existing worker set under the lock, then create new
        // workers without it (worker construction awaits on the store).
        let to_create: Vec<(String, Caller, WorkerConfig)> = {
            let mut workers = self.workers.lock().expect("workers mutex poisoned");
            for (name, shared) in workers.iter() {
                match desired.get(name) {
                    Some((_, config)) => {
                        shared.update_config(&config.bundle, &config.sources, &config.stacks);
                    }
                    None => shared.mark_changed(),
                }
                // Wake changed workers so retirement does not wait out a
                // long rebuild interval.
                if shared.is_changed() && !shared.is_retired() {
                    let _ = self.pool.trigger(name);
                }
            }
            workers.retain(|_, shared| !shared.is_retired());

            desired
                .into_iter()
                .filter(|(name, _)| !workers.contains_key(name) && !self.pool.contains(name))
                .map(|(name, (caller, config))| (name, caller, config))
                .collect()
        };

        for (name, caller, config) in to_create {
            match self.make_worker(&caller, config).await {
                Ok((shared, worker)) => {
                    info!(worker = %name, "starting bundle worker");
                    self.pool.add(name.clone(), Box::new(worker), Instant::now());
                    self.workers
                        .lock()
                        .expect("workers mutex poisoned")
                        .insert(name, shared);
                }
                Err(e) => {
                    warn!(worker = %name, error = %e, "cannot start bundle worker");
                    let bundle_name = name.split_once('/').map(|(_, b)| b).unwrap_or(&name);
                    let status = crate::store::BundleStatus {
                        state: "InternalError".to_string(),
                        message: Some(e.to_string()),
                        revision: None,
                        sha256: None,
                        last_updated: Some(chrono::Utc::now()),
                    };
                    if let Err(e) = self.store.set_bundle_status(&caller, bundle_name, &status).await
                    {
                        error!(worker = %name, error = %e, "cannot record worker startup failure");
                    }
                }
            }
        }

        let count = self.workers.lock().expect("workers mutex poisoned").len();
        metrics::set_worker_count(count as i64);
        Ok(())
    }

    /// A bundle's transitive source closure plus the stacks that match its
    /// labels.
    async fn resolve_closure(
        &self,
        caller: &Caller,
        bundle: &Bundle,
    ) -> Result<(Vec<Source>, Vec<Stack>)> {
        let all_sources = all_sources(&self.store, caller).await?;
        let all_stacks = all_stacks(&self.store, caller).await?;

        let stacks: Vec<Stack> = all_stacks
            .into_iter()
            .filter(|s| s.matches(&bundle.labels))
            .collect();

        let mut wanted: Vec<String> = bundle
            .requirements
            .iter()
            .filter_map(|r| r.source.clone())
            .collect();
        for stack in &stacks {
            wanted.extend(stack.requirements.iter().filter_map(|r| r.source.clone()));
        }

        let by_name: HashMap<&str, &Source> =
            all_sources.iter().map(|s| (s.name.as_str(), s)).collect();
        let mut closure: Vec<Source> = Vec::new();
        let mut seen = std::collections::BTreeSet::new();
        while let Some(name) = wanted.pop() {
            if !seen.insert(name.clone()) {
                continue;
            }
            // Requirements on unknown sources surface at build time.
            if let Some(source) = by_name.get(name.as_str()) {
                closure.push((*source).clone());
                wanted.extend(source.requirement_names());
            }
        }
        closure.sort_by(|a, b| a.name.cmp(&b.name));
        Ok((closure, stacks))
    }

    async fn make_worker(
        &self,
        caller: &Caller,
        config: WorkerConfig,
    ) -> Result<(Arc<WorkerShared>, BundleWorker)> {
        let storage = crate::storage::from_config(&config.bundle.object_storage)
            .with_context(|| format!("bundle {:?}", config.bundle.name))?;

        let bundle_dir = self
            .data_dir
            .join(&caller.tenant)
            .join(&config.bundle.name);

        let mut synchronizers: Vec<Box<dyn Synchronizer>> = Vec::new();
        for source in &config.sources {
            if let Some(git) = &source.git {
                let credentials = match &git.credentials {
                    Some(secret) => Some(
                        self.store
                            .get_secret(caller, secret)
                            .await
                            .with_context(|| format!("source {:?}", source.name))?
                            .resolve()?,
                    ),
                    None => None,
                };
                synchronizers.push(Box::new(GitSynchronizer::new(
                    source.name.clone(),
                    git.repo.clone(),
                    git.reference.clone(),
                    git.commit.clone(),
                    BundleWorker::source_staging(&bundle_dir, &source.name, "repo"),
                    credentials,
                )));
            }
            if !source.datasources.is_empty() {
                let mut datasources = Vec::new();
                for ds in &source.datasources {
                    let credentials = match &ds.credentials {
                        Some(secret) => Some(
                            self.store
                                .get_secret(caller, secret)
                                .await
                                .with_context(|| format!("datasource {:?}", ds.name))?
                                .resolve()?,
                        ),
                        None => None,
                    };
                    datasources.push((ds.clone(), credentials));
                }
                synchronizers.push(Box::new(HttpSynchronizer::new(
                    source.name.clone(),
                    datasources,
                    BundleWorker::source_staging(&bundle_dir, &source.name, "http"),
                )?));
            }
            synchronizers.push(Box::new(DatabaseSynchronizer::new(
                source.name.clone(),
                self.store.clone(),
                caller.clone(),
                BundleWorker::source_staging(&bundle_dir, &source.name, "db"),
            )));
        }

        let rebuild_interval = match &config.bundle.rebuild_interval {
            Some(interval) => parse_duration(interval).map_err(|e| anyhow::anyhow!(e))?,
            None => Duration::from_secs(30),
        };

        let shared = WorkerShared::new(config);
        let worker = BundleWorker::new(
            shared.clone(),
            self.store.clone(),
            storage,
            synchronizers,
            caller.clone(),
            bundle_dir,
            rebuild_interval,
            self.error_interval,
            self.single_shot,
        );
        Ok((shared, worker))
    }
}

async fn all_bundles(store: &Store, caller: &Caller) -> Result<Vec<Bundle>> {
    let mut out = Vec::new();
    let mut cursor = None;
    loop {
        let page = store
            .list_bundles(
                caller,
                &crate::store::ListOptions {
                    limit: Some(200),
                    cursor,
                },
            )
            .await?;
        out.extend(page.items);
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => return Ok(out),
        }
    }
}

async fn all_sources(store: &Store, caller: &Caller) -> Result<Vec<Source>> {
    let mut out = Vec::new();
    let mut cursor = None;
    loop {
        let page = store
            .list_sources(
                caller,
                &crate::store::ListOptions {
                    limit: Some(200),
                    cursor,
                },
            )
            .await?;
        out.extend(page.items);
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => return Ok(out),
        }
    }
}

async fn all_stacks(store: &Store, caller: &Caller) -> Result<Vec<Stack>> {
    let mut out = Vec::new();
    let mut cursor = None;
    loop {
        let page = store
            .list_stacks(
                caller,
                &crate::store::ListOptions {
                    limit: Some(200),
                    cursor,
                },
            )
            .await?;
        out.extend(page.items);
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => return Ok(out),
        }
    }
}
