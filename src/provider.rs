//! Provider Core (§4, §9): the stateful object that owns one subscription's
//! fetch/parse/compose/cache lifecycle, grounded on the path-dependency
//! crate's `ProxyProvider` (`proxyprovider.go`).
//!
//! Lifecycle is an explicit state machine: `Constructed` -> `Bootstrapped`
//! (after `start_get_outbounds`) -> `Running` (after `start`) -> `Closed`.
//! The cache is a `RwLock<Arc<Cache>>` snapshot, following the same
//! read-mostly reload pattern as `ReloadableProxySelector`; a refresh swaps
//! in a whole new `Arc` rather than mutating through the read lock.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache;
use crate::core::config::{GroupSpecConfig, ProviderConfig};
use crate::core::error::{ProviderError, Result};
use crate::core::model::{Cache, GroupKind, GroupOptions, OutboundRecord, ScriptTestOptions, TagSideMap};
use crate::filter::Filter;
use crate::parsers;
use crate::request::RequestPipeline;
use crate::request::dialer::Dialer;
use crate::request::dns::BootstrapDns;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderState {
    Constructed,
    Bootstrapped,
    Running,
    Closed,
}

struct CompiledGroup {
    spec: GroupSpecConfig,
    filter: Option<Filter>,
}

/// One provider's full runtime state: configuration, compiled filters, the
/// request pipeline, and the cache snapshot.
pub struct Provider {
    config: ProviderConfig,
    cache_path: Option<std::path::PathBuf>,
    update_interval: Duration,
    global_filter: Option<Filter>,
    groups: Vec<CompiledGroup>,
    lookup_dns: Option<Arc<BootstrapDns>>,
    pipeline: RequestPipeline,
    detour: RwLock<Option<Arc<dyn Dialer>>>,
    state: RwLock<ProviderState>,
    cache: RwLock<Arc<Cache>>,
    update_lock: Mutex<()>,
    auto_update: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl Provider {
    /// Construction-time work only: validates config, compiles filters,
    /// builds the request pipeline. No I/O happens here (§4.6 step 0).
    pub fn new(config: ProviderConfig) -> Result<Self> {
        config.validate()?;

        // `request_dialer.detour` would mean "bootstrap the subscription
        // fetch itself through a named outbound", which the original
        // rejects outright (only `running_detour`, applied post-bootstrap,
        // is supported). `bind_interface`/`connect_timeout_secs` are kept
        // in the config shape for compatibility but aren't wired into the
        // direct dialer: binding to an interface is a forwarding-data-plane
        // concern and out of scope (§1).
        if let Some(request_dialer) = &config.request_dialer {
            if request_dialer.detour.is_some() {
                return Err(ProviderError::Configuration(format!(
                    "provider '{}': request_dialer.detour is not supported, only running_detour",
                    config.tag
                )));
            }
        }

        let global_filter = config.global_filter.as_ref().map(Filter::compile).transpose()?;

        let mut groups = Vec::with_capacity(config.groups.len());
        for spec in &config.groups {
            let filter = spec.filter.as_ref().map(Filter::compile).transpose()?;
            groups.push(CompiledGroup { spec: spec.clone(), filter });
        }

        let lookup_dns = if config.lookup_ip {
            match &config.dns {
                Some(addr) => Some(Arc::new(BootstrapDns::parse(addr)?)),
                None => None,
            }
        } else {
            None
        };

        let timeout = config.request_timeout_secs.map(Duration::from_secs);
        let pipeline = RequestPipeline::build(config.use_h3, Some(&config.download_ua), timeout, config.dns.as_deref())?;

        let cache_path = config.cache_file.as_ref().map(std::path::PathBuf::from);
        let update_interval = Duration::from_secs(config.update_interval_secs.unwrap_or(0));

        Ok(Provider {
            config,
            cache_path,
            update_interval,
            global_filter,
            groups,
            lookup_dns,
            pipeline,
            detour: RwLock::new(None),
            state: RwLock::new(ProviderState::Constructed),
            cache: RwLock::new(Arc::new(Cache::empty())),
            update_lock: Mutex::new(()),
            auto_update: Mutex::new(None),
        })
    }

    pub fn tag(&self) -> &str {
        &self.config.tag
    }

    pub fn state(&self) -> ProviderState {
        *self.state.read()
    }

    /// Registers the in-process outbound named by `running-detour` once it
    /// is actually dialable. Must only be called once `start()` has
    /// returned; calling it earlier would let a bootstrap fetch use a
    /// detour that §4.4 forbids.
    pub fn register_detour(&self, dialer: Arc<dyn Dialer>) {
        *self.detour.write() = Some(dialer);
    }

    /// Bootstrap (§4.3, §9): loads the on-disk cache if configured, and
    /// performs a first fetch if that cache is missing or stale. Returns
    /// the fully composed outbound list. Idempotent only in the sense that
    /// calling it twice re-runs the staleness check; callers normally call
    /// it exactly once before `start()`.
    pub async fn start_get_outbounds(&self) -> Result<Vec<OutboundRecord>> {
        if let Some(path) = &self.cache_path {
            if let Some(loaded) = cache::load(path).await {
                debug!(tag = %self.config.tag, "loaded cache file");
                *self.cache.write() = Arc::new(loaded);
            }
        }

        let stale = {
            let cache = self.cache.read();
            cache.is_nil() || cache::is_stale(&cache, self.update_interval)
        };

        if stale {
            if let Err(err) = self.refresh(true).await {
                if self.cache.read().is_nil() {
                    return Err(err.context(format!("provider '{}' bootstrap", self.config.tag)));
                }
                warn!(tag = %self.config.tag, %err, "bootstrap refresh failed, continuing with stale cache");
            }
        }

        *self.state.write() = ProviderState::Bootstrapped;
        self.get_full_outbounds().await
    }

    /// Spins up the periodic refresh loop (§4.3) when both an update
    /// interval and a cache file are configured, matching the original's
    /// "only loop if persistence makes the work durable" rule. Requires an
    /// `Arc` so the spawned task can hold its own owning handle.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.update_interval.is_zero() || self.cache_path.is_none() {
            *self.state.write() = ProviderState::Running;
            return Ok(());
        }

        let token = CancellationToken::new();
        let child = token.clone();
        let tag = self.config.tag.clone();
        let interval = self.update_interval;
        let this = self.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = this.refresh(false).await {
                            warn!(tag = %tag, %err, "scheduled refresh failed, keeping previous cache");
                        }
                    }
                }
            }
        });

        *self.auto_update.lock() = Some((token, handle));
        *self.state.write() = ProviderState::Running;
        Ok(())
    }

    /// Cancels the refresh loop and waits for it to exit (§9 state
    /// machine: `Running -> Closed`). A no-op if the loop was never
    /// started.
    pub async fn close(&self) {
        let handle = self.auto_update.lock().take();
        if let Some((token, handle)) = handle {
            token.cancel();
            let _ = handle.await;
        }
        *self.state.write() = ProviderState::Closed;
    }

    /// Raw cached outbounds, uncomposed (§4 `GetOutboundOptions`).
    pub fn get_outbounds(&self) -> Vec<OutboundRecord> {
        self.cache.read().outbounds.clone()
    }

    /// The last successful fetch's metrics, if any parsed (§4 `GetClashInfo`).
    pub fn get_metrics(&self) -> Option<crate::core::model::SubscriptionMetrics> {
        self.cache.read().metrics.clone()
    }

    pub fn last_update_time(&self) -> chrono::DateTime<chrono::Utc> {
        self.cache.read().last_update
    }

    /// Triggers an out-of-band refresh (§4 `Update`). Gated on persistence
    /// only: `update_interval == 0` disables the periodic loop (`start`'s
    /// gate), but a manual trigger still works as long as a cache file is
    /// configured to persist the result to (§8 boundary: "update_interval=0
    /// with cache_file set -> no refresh loop, manual update still works").
    pub async fn update(&self) -> Result<()> {
        if self.cache_path.is_none() {
            return Ok(());
        }
        self.refresh(false).await
    }

    /// Composition (§4.6): dialer injection, optional server rewrite,
    /// tag-format rewrite, per-group filtering, umbrella selector.
    pub async fn get_full_outbounds(&self) -> Result<Vec<OutboundRecord>> {
        let mut records = self.cache.read().outbounds.clone();

        if let Some(dialer_options) = &self.config.dialer {
            for record in &mut records {
                record.set_dialer_options(dialer_options.clone());
            }
        }

        if let (true, Some(dns)) = (self.config.lookup_ip, &self.lookup_dns) {
            for record in &mut records {
                let host = record.server().to_string();
                if host.is_empty() {
                    continue;
                }
                let resolved = dns
                    .lookup(&host, true, true)
                    .await
                    .map_err(|e| e.context(format!("resolving '{host}' for lookup-ip rewrite")))?;
                let ip = resolved
                    .into_iter()
                    .next()
                    .ok_or_else(|| ProviderError::Dns(format!("no address found for {host}")))?;
                record.set_server(ip.to_string());
            }
        }

        let side_map: Option<TagSideMap> = self.config.tag_format.as_ref().map(|template| {
            let mut map = TagSideMap::new();
            for record in &mut records {
                let original = record.tag().to_string();
                let rewritten = template.replacen("%s", &original, 1);
                map.insert(rewritten.clone(), original);
                record.set_tag(rewritten);
            }
            map
        });

        let all_outbound_tags: Vec<String> = records.iter().map(|r| r.tag().to_string()).collect();

        let mut group_records = Vec::with_capacity(self.groups.len());
        let mut group_tags = Vec::with_capacity(self.groups.len());

        for group in &self.groups {
            let mut members: Vec<String> = group.spec.base_options.outbounds.iter().cloned().collect();

            let matched_tags: Vec<String> = match &group.filter {
                Some(filter) => filter.apply(&records, side_map.as_ref()).iter().map(|r| r.tag().to_string()).collect(),
                None => all_outbound_tags.clone(),
            };
            members.extend(matched_tags);

            if members.is_empty() {
                return Err(ProviderError::GroupEmpty(group.spec.tag.clone()));
            }

            let record = match group.spec.kind {
                GroupKind::Selector => OutboundRecord::Selector(GroupOptions {
                    tag: group.spec.tag.clone(),
                    outbounds: members,
                    default: group.spec.base_options.default.clone(),
                    interrupt_exist_connections: group.spec.base_options.interrupt_exist_connections,
                }),
                GroupKind::UrlTest => OutboundRecord::UrlTest(GroupOptions {
                    tag: group.spec.tag.clone(),
                    outbounds: members,
                    default: group.spec.base_options.default.clone(),
                    interrupt_exist_connections: group.spec.base_options.interrupt_exist_connections,
                }),
                GroupKind::ScriptTest => OutboundRecord::ScriptTest(ScriptTestOptions {
                    tag: group.spec.tag.clone(),
                    outbounds: members,
                    js_path: group.spec.base_options.js_path.clone(),
                    js_base64: group.spec.base_options.js_base64.clone(),
                    interval_secs: group.spec.base_options.interval_secs,
                    interrupt_exist_connections: group.spec.base_options.interrupt_exist_connections,
                    global_vars: group.spec.base_options.global_vars.clone(),
                }),
            };

            group_tags.push(group.spec.tag.clone());
            group_records.push(record);
        }

        let mut umbrella_members = all_outbound_tags;
        umbrella_members.extend(group_tags);

        let umbrella = OutboundRecord::Selector(GroupOptions {
            tag: self.config.tag.clone(),
            outbounds: umbrella_members,
            default: None,
            interrupt_exist_connections: false,
        });

        records.extend(group_records);
        records.push(umbrella);
        Ok(records)
    }

    /// Single-writer refresh guard (§4.3): a contending call is a silent
    /// no-op, matching the original's `TryLock` behavior rather than
    /// queueing or erroring.
    async fn refresh(&self, is_first: bool) -> Result<()> {
        let _guard = match self.update_lock.try_lock() {
            Some(guard) => guard,
            None => {
                debug!(tag = %self.config.tag, "refresh already in progress, skipping");
                return Ok(());
            }
        };

        let new_cache = self.fetch_and_parse(is_first).await?;
        *self.cache.write() = Arc::new(new_cache);

        if let Some(path) = &self.cache_path {
            let snapshot = self.cache.read().clone();
            if let Err(err) = cache::save(path, &snapshot).await {
                warn!(tag = %self.config.tag, %err, "failed to persist cache file");
            }
        }

        info!(tag = %self.config.tag, is_first, "refresh complete");
        Ok(())
    }

    async fn fetch_and_parse(&self, is_first: bool) -> Result<Cache> {
        let detour = if is_first { None } else { self.detour.read().clone() };
        let detour_ref: Option<&dyn Dialer> = detour.as_deref();

        let (body, metrics) = self
            .pipeline
            .fetch(&self.config.url, detour_ref)
            .await
            .map_err(|e| e.context(format!("provider '{}' fetch", self.config.tag)))?;

        let mut outbounds = parsers::parse_document(&body)
            .map_err(|e| e.context(format!("provider '{}' parse", self.config.tag)))?;

        if let Some(filter) = &self.global_filter {
            outbounds = filter.apply(&outbounds, None);
            if outbounds.is_empty() {
                return Err(ProviderError::FilterEmpty);
            }
        }

        Ok(Cache {
            last_update: chrono::Utc::now(),
            outbounds,
            metrics,
        })
    }
}
