//! Script-Test Outbound (§4.7, §9 supplemental): periodically calls a
//! user-supplied `Test(outbounds, current_selected) -> {value}|{error}`
//! function to pick a group member, grounded on `outbound/jstest.go` and
//! `jstest/golang/http_request.go`.
//!
//! `rhai` is a synchronous VM, so unlike the original's `otto` embedding
//! (which reenters the async router directly from a host function called
//! mid-evaluation), every `Test` call here runs inside
//! `tokio::task::spawn_blocking`: a dedicated blocking thread, not the async
//! reactor, so the `log_*`/`http_requests`/`urltests` host functions it
//! exposes can drive real (if narrowed) I/O through `Handle::block_on`
//! without starving other tasks. This is the "execute natively, re-enter"
//! alternative §9 offers instead of giving the VM a coroutine bridge.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rhai::{AST, Dynamic, Engine, Scope};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::error::{ProviderError, Result};
use crate::core::model::ScriptTestOptions;
use crate::request::dialer::{Dialer, DirectDialer};

const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Compiled script plus the mutable selection state it drives.
pub struct ScriptTestRunner {
    tag: String,
    outbounds: Vec<String>,
    engine: Engine,
    ast: AST,
    global_vars: HashMap<String, serde_json::Value>,
    selected: RwLock<String>,
    selection_path: Option<PathBuf>,
    interval: Duration,
}

impl ScriptTestRunner {
    /// Loads and compiles the script (from `js_path` or `js_base64`),
    /// registers the evaluation context (`log_*`, `http_requests`,
    /// `urltests`), restores any previously persisted selection, and
    /// defaults to the first candidate otherwise (§9: `SelectOutbound` /
    /// `LoadSelected`). Dials through a direct `Dialer`; use
    /// `new_with_dialer` to back the probe functions with a real detour.
    pub async fn new(tag: &str, options: &ScriptTestOptions, state_dir: &Path) -> Result<Self> {
        Self::new_with_dialer(tag, options, state_dir, Arc::new(DirectDialer)).await
    }

    /// Like `new`, backing `urltests`/`http_requests` with `dialer`.
    /// Per-request `detour` naming a specific composed outbound is accepted
    /// for shape parity but not honored: the concrete forwarding data plane
    /// is out of scope (§1), the same narrowing
    /// `management::run_healthcheck` documents, so every probe dials
    /// directly through `dialer` regardless of which outbound it names.
    pub async fn new_with_dialer(tag: &str, options: &ScriptTestOptions, state_dir: &Path, dialer: Arc<dyn Dialer>) -> Result<Self> {
        if options.outbounds.is_empty() {
            return Err(ProviderError::Configuration(format!("script-test '{tag}': missing outbounds")));
        }

        let source = load_source(options).await?;
        if source.trim().is_empty() {
            return Err(ProviderError::Configuration(format!("script-test '{tag}': empty script")));
        }

        let mut engine = Engine::new();
        let http_client = reqwest::Client::builder()
            .build()
            .map_err(|e| ProviderError::Configuration(format!("script-test '{tag}': building http client: {e}")))?;
        register_host_functions(&mut engine, tag.to_string(), dialer, http_client);

        let ast = engine
            .compile(&source)
            .map_err(|e| ProviderError::Script(format!("script-test '{tag}': compile failed: {e}")))?;

        let selection_path = if tag.is_empty() { None } else { Some(state_dir.join("selected").join(format!("{tag}.txt"))) };

        let restored = match &selection_path {
            Some(path) => load_selection(path).await,
            None => None,
        };
        let selected = match restored {
            Some(tag) if options.outbounds.contains(&tag) => tag,
            _ => options.outbounds[0].clone(),
        };

        Ok(ScriptTestRunner {
            tag: tag.to_string(),
            outbounds: options.outbounds.clone(),
            engine,
            ast,
            global_vars: options.global_vars.clone(),
            selected: RwLock::new(selected),
            selection_path,
            interval: options.interval_secs.map(Duration::from_secs).unwrap_or(DEFAULT_INTERVAL),
        })
    }

    pub fn selected(&self) -> String {
        self.selected.read().clone()
    }

    /// Runs `Test` once, on a blocking thread since the registered
    /// `http_requests`/`urltests` functions each drive their own
    /// `Handle::block_on`. A script error, a malformed return value, or a
    /// selection naming an unknown tag all leave the previous selection in
    /// place (§9: the group keeps routing through the last-known-good
    /// member rather than failing open).
    pub async fn run_once(&self) -> Result<String> {
        let engine = self.engine.clone();
        let ast = self.ast.clone();
        let global_vars = self.global_vars.clone();
        let outbounds = self.outbounds.clone();
        let tag = self.tag.clone();
        let current = self.selected();

        let call_result = tokio::task::spawn_blocking(move || run_test_fn(&engine, &ast, &tag, &global_vars, &outbounds, &current))
            .await
            .map_err(|e| ProviderError::Script(format!("script-test '{}': evaluator task panicked: {e}", self.tag)))?;

        let value = match call_result {
            Ok(value) => value,
            Err(err) => {
                warn!(tag = %self.tag, %err, "script-test run failed, keeping previous selection");
                return Ok(current);
            }
        };

        match parse_response(value) {
            ScriptResponse::Value(new_tag) if self.outbounds.contains(&new_tag) => {
                if new_tag != current {
                    info!(tag = %self.tag, selected = %new_tag, "script-test selected new outbound");
                    *self.selected.write() = new_tag.clone();
                    if let Some(path) = &self.selection_path {
                        if let Err(err) = save_selection(path, &new_tag).await {
                            warn!(tag = %self.tag, %err, "failed to persist script-test selection");
                        }
                    }
                }
                Ok(new_tag)
            }
            ScriptResponse::Value(unknown) => {
                warn!(tag = %self.tag, selected = %unknown, "script-test selected unknown outbound, ignoring");
                Ok(current)
            }
            ScriptResponse::Error(message) => {
                warn!(tag = %self.tag, error = %message, "script-test reported an error, keeping previous selection");
                Ok(current)
            }
            ScriptResponse::Malformed => {
                warn!(tag = %self.tag, "script-test returned a value with neither 'value' nor 'error'");
                Ok(current)
            }
        }
    }

    /// Runs `Test` immediately, then on `interval` until cancelled.
    pub async fn run_loop(&self, cancel: CancellationToken) {
        if let Err(err) = self.run_once().await {
            error!(tag = %self.tag, %err, "initial script-test run failed");
        }
        let mut ticker = tokio::time::interval(self.interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.run_once().await {
                        error!(tag = %self.tag, %err, "scheduled script-test run failed");
                    }
                }
            }
        }
        debug!(tag = %self.tag, "script-test loop exited");
    }
}

/// Calls `Test(outbounds, current_selected)` with the global vars pushed
/// into scope. Must run on a blocking thread: the registered
/// `http_requests`/`urltests` functions call `Handle::block_on` and would
/// deadlock an async reactor thread.
fn run_test_fn(
    engine: &Engine,
    ast: &AST,
    tag: &str,
    global_vars: &HashMap<String, serde_json::Value>,
    outbounds: &[String],
    current: &str,
) -> std::result::Result<Dynamic, Box<rhai::EvalAltResult>> {
    let mut scope = Scope::new();
    for (key, value) in global_vars {
        let dynamic = rhai::serde::to_dynamic(value).map_err(|e| format!("script-test '{tag}': bad global var '{key}': {e}"))?;
        scope.push_dynamic(key.clone(), dynamic);
    }
    let outbounds: rhai::Array = outbounds.iter().map(|t| Dynamic::from(t.clone())).collect();
    engine.call_fn(&mut scope, ast, "Test", (outbounds, current.to_string()))
}

/// Registers the evaluation context §4.7 mandates: scoped logging that
/// needs no data plane, plus the two probe entry points narrowed to the
/// crate's own `Dialer` seam (see `new_with_dialer`'s doc comment).
fn register_host_functions(engine: &mut Engine, tag: String, dialer: Arc<dyn Dialer>, http_client: reqwest::Client) {
    macro_rules! register_log {
        ($name:literal, $level:ident) => {
            let log_tag = tag.clone();
            engine.register_fn($name, move |msg: &str| {
                tracing::$level!(tag = %log_tag, "{msg}");
            });
        };
    }
    register_log!("log_trace", trace);
    register_log!("log_debug", debug);
    register_log!("log_info", info);
    register_log!("log_warn", warn);
    register_log!("log_error", error);
    // The original's `log.Fatal` terminates the process; this crate never
    // exits a script's host process on its behalf, so `log_fatal` logs at
    // error level like `log_error` instead.
    register_log!("log_fatal", error);

    let urltest_dialer = dialer.clone();
    let urltest_tag = tag.clone();
    engine.register_fn("urltests", move |requests: rhai::Array| -> rhai::Array {
        run_urltests(&urltest_tag, &urltest_dialer, requests, DEFAULT_PROBE_TIMEOUT)
    });
    let urltest_dialer = dialer.clone();
    let urltest_tag = tag.clone();
    engine.register_fn("urltests", move |requests: rhai::Array, timeout_ms: i64| -> rhai::Array {
        run_urltests(&urltest_tag, &urltest_dialer, requests, duration_from_millis(timeout_ms))
    });

    let http_tag = tag.clone();
    let client = http_client.clone();
    engine.register_fn("http_requests", move |requests: rhai::Array| -> rhai::Array {
        run_http_requests(&http_tag, &client, requests, DEFAULT_PROBE_TIMEOUT)
    });
    let http_tag = tag.clone();
    let client = http_client.clone();
    engine.register_fn("http_requests", move |requests: rhai::Array, timeout_ms: i64| -> rhai::Array {
        run_http_requests(&http_tag, &client, requests, duration_from_millis(timeout_ms))
    });
}

fn duration_from_millis(timeout_ms: i64) -> Duration {
    if timeout_ms <= 0 { DEFAULT_PROBE_TIMEOUT } else { Duration::from_millis(timeout_ms as u64) }
}

/// `urltests(requests, timeout_ms?) -> [{delay}|{error}]` (§4.7): each
/// entry names `{url, detour}`; `detour` is accepted for shape parity but
/// every probe dials directly through `dialer` rather than the named
/// outbound's own transport.
fn run_urltests(tag: &str, dialer: &Arc<dyn Dialer>, requests: rhai::Array, timeout: Duration) -> rhai::Array {
    let handle = tokio::runtime::Handle::current();
    requests
        .into_iter()
        .map(|entry| {
            let Some(map) = entry.try_cast::<rhai::Map>() else {
                return error_result("malformed urltest request");
            };
            let Some(url) = map.get("url").and_then(|v| v.clone().into_string().ok()) else {
                return error_result("urltest request missing 'url'");
            };
            match handle.block_on(probe_url_latency(dialer, &url, timeout)) {
                Ok(delay_ms) => {
                    let mut result = rhai::Map::new();
                    result.insert("delay".into(), Dynamic::from(delay_ms as i64));
                    Dynamic::from_map(result)
                }
                Err(err) => {
                    debug!(tag = %tag, %url, %err, "urltest probe failed");
                    error_result(&err)
                }
            }
        })
        .collect()
}

async fn probe_url_latency(dialer: &Arc<dyn Dialer>, url: &str, timeout: Duration) -> std::result::Result<u64, String> {
    let parsed = url::Url::parse(url).map_err(|e| e.to_string())?;
    let host = parsed.host_str().ok_or("url has no host")?;
    let port = parsed.port_or_known_default().ok_or("url has no known port")?;
    let resolved = tokio::net::lookup_host((host, port)).await.map_err(|e| e.to_string())?.next().ok_or("no address resolved")?;

    let started = Instant::now();
    tokio::time::timeout(timeout, dialer.connect_tcp(resolved))
        .await
        .map_err(|_| "timed out".to_string())?
        .map_err(|e| e.to_string())?;
    Ok(started.elapsed().as_millis() as u64)
}

/// `http_requests(requests, timeout_ms?) -> [{status,body,cost_ms}|{error}]`
/// (§4.7): each entry names `{method, url, body, detour}`. `detour` is
/// accepted but not honored, same narrowing as `urltests`; every request
/// goes out directly through the shared client.
fn run_http_requests(tag: &str, client: &reqwest::Client, requests: rhai::Array, timeout: Duration) -> rhai::Array {
    let handle = tokio::runtime::Handle::current();
    requests
        .into_iter()
        .map(|entry| {
            let Some(map) = entry.try_cast::<rhai::Map>() else {
                return error_result("malformed http request");
            };
            match handle.block_on(perform_http_request(client, &map, timeout)) {
                Ok((status, body, cost_ms)) => {
                    let mut result = rhai::Map::new();
                    result.insert("status".into(), Dynamic::from(status as i64));
                    result.insert("body".into(), Dynamic::from(body));
                    result.insert("cost_ms".into(), Dynamic::from(cost_ms as i64));
                    Dynamic::from_map(result)
                }
                Err(err) => {
                    debug!(tag = %tag, %err, "http_requests probe failed");
                    error_result(&err)
                }
            }
        })
        .collect()
}

async fn perform_http_request(client: &reqwest::Client, map: &rhai::Map, timeout: Duration) -> std::result::Result<(u16, String, u64), String> {
    let url = map.get("url").and_then(|v| v.clone().into_string().ok()).ok_or("http request missing 'url'")?;
    let method = map.get("method").and_then(|v| v.clone().into_string().ok()).unwrap_or_else(|| "GET".to_string());
    let method = reqwest::Method::from_bytes(method.as_bytes()).map_err(|e| e.to_string())?;

    let mut builder = client.request(method, &url);
    if let Some(body) = map.get("body").and_then(|v| v.clone().into_string().ok()) {
        builder = builder.body(body);
    }

    let started = Instant::now();
    let response = tokio::time::timeout(timeout, builder.send())
        .await
        .map_err(|_| "timed out".to_string())?
        .map_err(|e| e.to_string())?;
    let status = response.status().as_u16();
    let body = response.text().await.map_err(|e| e.to_string())?;
    Ok((status, body, started.elapsed().as_millis() as u64))
}

fn error_result(message: &str) -> Dynamic {
    let mut result = rhai::Map::new();
    result.insert("error".into(), Dynamic::from(message.to_string()));
    Dynamic::from_map(result)
}

enum ScriptResponse {
    Value(String),
    Error(String),
    Malformed,
}

fn parse_response(value: Dynamic) -> ScriptResponse {
    let Some(map) = value.try_cast::<rhai::Map>() else {
        return ScriptResponse::Malformed;
    };
    if let Some(error) = map.get("error").and_then(|v| v.clone().into_string().ok()) {
        if !error.is_empty() {
            return ScriptResponse::Error(error);
        }
    }
    if let Some(value) = map.get("value").and_then(|v| v.clone().into_string().ok()) {
        if !value.is_empty() {
            return ScriptResponse::Value(value);
        }
    }
    ScriptResponse::Malformed
}

async fn load_source(options: &ScriptTestOptions) -> Result<String> {
    if let Some(path) = &options.js_path {
        return tokio::fs::read_to_string(path).await.map_err(ProviderError::Io);
    }
    if let Some(raw) = &options.js_base64 {
        let bytes = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, raw.trim())
            .or_else(|_| base64::Engine::decode(&base64::engine::general_purpose::STANDARD_NO_PAD, raw.trim()))
            .map_err(|e| ProviderError::Configuration(format!("invalid js_base64: {e}")))?;
        return String::from_utf8(bytes).map_err(|e| ProviderError::Configuration(format!("js_base64 is not utf-8: {e}")));
    }
    Err(ProviderError::Configuration("script-test requires js_path or js_base64".into()))
}

async fn load_selection(path: &Path) -> Option<String> {
    let raw = tokio::fs::read_to_string(path).await.ok()?;
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

async fn save_selection(path: &Path, tag: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let tmp_path = path.with_extension("tmp");
    let mut file = tokio::fs::File::create(&tmp_path).await?;
    file.write_all(tag.as_bytes()).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(script: &str, outbounds: &[&str]) -> ScriptTestOptions {
        ScriptTestOptions {
            tag: "auto".to_string(),
            outbounds: outbounds.iter().map(|s| s.to_string()).collect(),
            js_path: None,
            js_base64: Some(base64::Engine::encode(&base64::engine::general_purpose::STANDARD, script)),
            interval_secs: Some(1),
            interrupt_exist_connections: false,
            global_vars: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn selects_value_returned_by_script() {
        let opts = options("function Test(outbounds, current) { return #{value: outbounds[1]}; }", &["a", "b"]);
        let dir = std::env::temp_dir().join(format!("scripttest-test-{:?}", std::thread::current().id()));
        let runner = ScriptTestRunner::new("auto", &opts, &dir).await.unwrap();
        let selected = runner.run_once().await.unwrap();
        assert_eq!(selected, "b");
        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn keeps_previous_selection_on_script_error() {
        let opts = options("function Test(outbounds, current) { return #{error: \"down\"}; }", &["a", "b"]);
        let dir = std::env::temp_dir().join(format!("scripttest-test-err-{:?}", std::thread::current().id()));
        let runner = ScriptTestRunner::new("auto", &opts, &dir).await.unwrap();
        let selected = runner.run_once().await.unwrap();
        assert_eq!(selected, "a");
        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn rejects_empty_outbounds() {
        let opts = options("function Test(outbounds, current) { return #{value: current}; }", &[]);
        let dir = std::env::temp_dir().join(format!("scripttest-test-empty-{:?}", std::thread::current().id()));
        assert!(ScriptTestRunner::new("auto", &opts, &dir).await.is_err());
    }

    #[tokio::test]
    async fn log_primitives_are_callable_from_script() {
        let opts = options(
            "function Test(outbounds, current) { log_info(\"probing\"); log_debug(\"detail\"); return #{value: current}; }",
            &["a"],
        );
        let dir = std::env::temp_dir().join(format!("scripttest-test-log-{:?}", std::thread::current().id()));
        let runner = ScriptTestRunner::new("auto", &opts, &dir).await.unwrap();
        let selected = runner.run_once().await.unwrap();
        assert_eq!(selected, "a");
        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn urltests_reports_error_for_unreachable_host() {
        let opts = options(
            "function Test(outbounds, current) { \
                let results = urltests([#{url: \"http://127.0.0.1:1\"}], 200); \
                if results[0].error != () { return #{value: current}; } \
                return #{error: \"expected failure\"}; \
            }",
            &["a"],
        );
        let dir = std::env::temp_dir().join(format!("scripttest-test-urltest-{:?}", std::thread::current().id()));
        let runner = ScriptTestRunner::new("auto", &opts, &dir).await.unwrap();
        let selected = runner.run_once().await.unwrap();
        assert_eq!(selected, "a");
        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
