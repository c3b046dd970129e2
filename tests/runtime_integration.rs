//! Runtime Integration Tests
//!
//! Drives the plugin manager through its public API with an in-memory
//! sandbox, fetcher and document store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::Notify;

use plugrun::plugin::store::Document;
use plugrun::plugin::{
    parse_plugin_source, DocumentStore, Fetcher, HostApi, InstanceState, MemoryStoreProvider, PluginConfig,
    PluginConnection, PluginError, PluginManager, PluginResult, RepositoryResolver, RuntimeEvent, Sandbox,
    SandboxSpec, SourceContext, StoreProvider, WorkflowCall,
};

// ============================================================================
// Fakes
// ============================================================================

const MANIFEST_URL: &str = "https://raw.githubusercontent.com/oeway/ImJoy-Plugins/master/manifest.imjoy.json";
const SOURCE_ROOT: &str = "https://raw.githubusercontent.com/oeway/ImJoy-Plugins/master/repository";

#[derive(Default)]
struct FakeFetcher {
    responses: Mutex<HashMap<String, String>>,
    requests: Mutex<Vec<String>>,
}

impl FakeFetcher {
    fn serve(&self, url: &str, body: &str) {
        self.responses.lock().insert(url.to_string(), body.to_string());
    }

    fn requests_for(&self, url: &str) -> usize {
        self.requests.lock().iter().filter(|u| *u == url).count()
    }
}

#[async_trait]
impl Fetcher for FakeFetcher {
    async fn fetch_text(&self, url: &str) -> PluginResult<String> {
        self.requests.lock().push(url.to_string());
        self.responses
            .lock()
            .get(url)
            .cloned()
            .ok_or_else(|| PluginError::Network(format!("Failed to fetch {url}: HTTP 404")))
    }
}

struct FakeConnection {
    name: String,
    seq: usize,
    host: HostApi,
    gate: Option<Arc<Notify>>,
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl PluginConnection for FakeConnection {
    fn api_names(&self) -> Vec<String> {
        ["setup", "run", "echo", "update"].map(String::from).to_vec()
    }

    async fn call(&self, function: &str, args: Vec<Value>) -> PluginResult<Value> {
        match function {
            "setup" => {
                if let Some(ref gate) = self.gate {
                    gate.notified().await;
                }
                match self.name.as_str() {
                    "Registrar" => {
                        self.host.dispatch("register", vec![json!({"name": "Extra", "ui": "extra op"})]).await?;
                    }
                    "Broken" => return Err(PluginError::Validation("setup exploded".into())),
                    _ => {}
                }
                Ok(Value::Null)
            }
            "echo" => Ok(Value::Array(args)),
            _ => Ok(args.into_iter().next().unwrap_or(Value::Null)),
        }
    }

    fn terminate(&self) -> PluginResult<()> {
        self.log.lock().push(format!("terminate {}#{}", self.name, self.seq));
        Ok(())
    }
}

#[derive(Default)]
struct FakeSandbox {
    seq: AtomicUsize,
    /// Held in `setup` until notified.
    gates: Mutex<HashMap<String, Arc<Notify>>>,
    /// Held in `connect` until notified.
    connect_gates: Mutex<HashMap<String, Arc<Notify>>>,
    log: Arc<Mutex<Vec<String>>>,
}

impl FakeSandbox {
    fn gate(&self, plugin: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.gates.lock().insert(plugin.to_string(), Arc::clone(&gate));
        gate
    }

    fn connect_gate(&self, plugin: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.connect_gates.lock().insert(plugin.to_string(), Arc::clone(&gate));
        gate
    }

    fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

#[async_trait]
impl Sandbox for FakeSandbox {
    async fn connect(&self, spec: SandboxSpec, host: HostApi) -> PluginResult<Arc<dyn PluginConnection>> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let name = spec.name().to_string();
        self.log.lock().push(format!("connect {name}#{seq}"));
        let connect_gate = self.connect_gates.lock().remove(&name);
        if let Some(gate) = connect_gate {
            gate.notified().await;
        }
        Ok(Arc::new(FakeConnection {
            gate: self.gates.lock().remove(&name),
            name,
            seq,
            host,
            log: Arc::clone(&self.log),
        }))
    }
}

/// Memory stores that record the `name` of every plugin record written.
#[derive(Default)]
struct RecordingStoreProvider {
    inner: MemoryStoreProvider,
    writes: Arc<Mutex<Vec<String>>>,
}

impl RecordingStoreProvider {
    fn writes(&self) -> Vec<String> {
        self.writes.lock().clone()
    }
}

impl StoreProvider for RecordingStoreProvider {
    fn open(&self, name: &str) -> PluginResult<Arc<dyn DocumentStore>> {
        let inner = self.inner.open(name)?;
        if name == "config" {
            return Ok(inner);
        }
        Ok(Arc::new(RecordingStore { inner, writes: Arc::clone(&self.writes) }))
    }
}

struct RecordingStore {
    inner: Arc<dyn DocumentStore>,
    writes: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl DocumentStore for RecordingStore {
    async fn get(&self, id: &str) -> PluginResult<Option<Document>> {
        self.inner.get(id).await
    }

    async fn put(&self, id: &str, body: Value, rev: Option<u64>) -> PluginResult<u64> {
        if let Some(name) = body.get("name").and_then(Value::as_str) {
            self.writes.lock().push(name.to_string());
        }
        self.inner.put(id, body, rev).await
    }

    async fn remove(&self, id: &str) -> PluginResult<bool> {
        self.inner.remove(id).await
    }

    async fn all(&self) -> PluginResult<Vec<Document>> {
        self.inner.all().await
    }
}

fn worker_source(name: &str, dependencies: &[&str]) -> String {
    format!(
        r#"<config lang="json">{{"name": "{name}", "type": "web-worker", "version": "0.1.0",
  "dependencies": {deps}, "inputs": {{"type": "object", "properties": {{"src": {{"type": "string"}}}}, "required": ["src"]}}}}</config>
<script lang="javascript">api.export({{setup() {{}}, run(ctx) {{ return ctx }}}})</script>"#,
        deps = serde_json::to_string(dependencies).unwrap()
    )
}

fn worker(name: &str) -> PluginConfig {
    parse_plugin_source(&worker_source(name, &[]), &SourceContext::default()).unwrap()
}

fn window_plugin(name: &str) -> PluginConfig {
    let source = format!(
        r#"<config lang="json">{{"name": "{name}", "type": "window", "defaults": {{"w": 20, "h": 10}}}}</config>
<window><div id="viewer"></div></window>
<script lang="javascript">api.export({{setup() {{}}, run(ctx) {{}}}})</script>"#
    );
    parse_plugin_source(&source, &SourceContext::default()).unwrap()
}

fn manager(sandbox: Arc<FakeSandbox>, fetcher: Arc<FakeFetcher>) -> Arc<PluginManager> {
    PluginManager::builder(sandbox, fetcher, Arc::new(MemoryStoreProvider::new())).build().unwrap()
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ============================================================================
// Lifecycle Tests
// ============================================================================

#[tokio::test]
async fn test_calls_before_setup_are_not_running() {
    let sandbox = Arc::new(FakeSandbox::default());
    let manager = manager(Arc::clone(&sandbox), Arc::new(FakeFetcher::default()));
    let gate = sandbox.gate("Slow");

    let loader = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.load_plugin(worker("Slow")).await })
    };
    wait_for(|| manager.instance_state("Slow") == Some(InstanceState::Ready)).await;

    // Registered on connect, callable only after setup.
    assert!(manager.operation("Slow/Slow").is_some());
    let err = manager.call_plugin("Slow", "echo", vec![json!(1)]).await.unwrap_err();
    assert!(matches!(err, PluginError::NotRunning(_)));
    assert!(matches!(manager.get_plugin("Slow"), Err(PluginError::NotRunning(_))));
    let err = manager.run_operation("Slow/Slow", WorkflowCall::default()).await.unwrap_err();
    assert!(matches!(err, PluginError::NotRunning(_)));

    gate.notify_one();
    loader.await.unwrap().unwrap();

    assert_eq!(manager.instance_state("Slow"), Some(InstanceState::Running));
    let echoed = manager.call_plugin("Slow", "echo", vec![json!(1), json!(2)]).await.unwrap();
    assert_eq!(echoed, json!([1, 2]));
}

#[tokio::test]
async fn test_old_instance_terminated_before_new_connect() {
    let sandbox = Arc::new(FakeSandbox::default());
    let manager = manager(Arc::clone(&sandbox), Arc::new(FakeFetcher::default()));

    manager.load_plugin(worker("Twice")).await.unwrap();
    manager.load_plugin(worker("Twice")).await.unwrap();

    assert_eq!(sandbox.log(), vec!["connect Twice#1", "terminate Twice#1", "connect Twice#2"]);
    assert_eq!(manager.plugin_names(), vec!["Twice"]);
}

#[tokio::test]
async fn test_unload_while_connecting_releases_connection() {
    let sandbox = Arc::new(FakeSandbox::default());
    let manager = manager(Arc::clone(&sandbox), Arc::new(FakeFetcher::default()));
    let gate = sandbox.connect_gate("Late");

    let loader = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.load_plugin(worker("Late")).await })
    };
    wait_for(|| sandbox.log().contains(&"connect Late#1".to_string())).await;

    assert!(manager.unload_plugin("Late", false));
    gate.notify_one();

    let err = loader.await.unwrap().unwrap_err();
    assert!(matches!(err, PluginError::Connection { .. }));
    assert_eq!(manager.instance_state("Late"), Some(InstanceState::Terminated));
    assert!(manager.operations().is_empty());
    assert_eq!(sandbox.log(), vec!["connect Late#1", "terminate Late#1"]);
}

#[tokio::test]
async fn test_unload_during_setup_terminates_once() {
    let sandbox = Arc::new(FakeSandbox::default());
    let manager = manager(Arc::clone(&sandbox), Arc::new(FakeFetcher::default()));
    let gate = sandbox.gate("Mid");

    let loader = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.load_plugin(worker("Mid")).await })
    };
    wait_for(|| manager.instance_state("Mid") == Some(InstanceState::Ready)).await;

    assert!(manager.unload_plugin("Mid", false));
    gate.notify_one();

    assert!(loader.await.unwrap().is_err());
    assert_eq!(manager.instance_state("Mid"), Some(InstanceState::Terminated));
    assert!(manager.operations().is_empty());
    assert_eq!(sandbox.log(), vec!["connect Mid#1", "terminate Mid#1"]);
}

#[tokio::test]
async fn test_setup_failure_names_plugin() {
    let sandbox = Arc::new(FakeSandbox::default());
    let manager = manager(Arc::clone(&sandbox), Arc::new(FakeFetcher::default()));
    let mut events = manager.subscribe();

    let err = manager.load_plugin(worker("Broken")).await.unwrap_err();
    assert!(err.to_string().contains("<Broken>"));
    assert_eq!(manager.instance_state("Broken"), Some(InstanceState::Failed));
    assert!(sandbox.log().contains(&"terminate Broken#1".to_string()));
    assert!(manager.operations().is_empty());

    let mut saw_message = false;
    while let Ok(event) = events.try_recv() {
        if let RuntimeEvent::Message { text } = event {
            saw_message |= text.contains("Broken");
        }
    }
    assert!(saw_message);
}

#[tokio::test]
async fn test_plugin_registers_through_host_api() {
    let manager = manager(Arc::new(FakeSandbox::default()), Arc::new(FakeFetcher::default()));
    manager.load_plugin(worker("Registrar")).await.unwrap();

    let extra = manager.operation("Registrar/Extra").expect("registered during setup");
    assert_eq!(extra.ui, "extra op");

    manager.unload_plugin("Registrar", true);
    assert!(manager.operation("Registrar/Extra").is_none());
}

#[tokio::test]
async fn test_run_operation_uses_workflow_shape() {
    let manager = manager(Arc::new(FakeSandbox::default()), Arc::new(FakeFetcher::default()));
    manager.load_plugin(worker("Threshold")).await.unwrap();

    let call = WorkflowCall {
        op: json!({"name": "Threshold"}),
        target: json!({"type": "image", "name": "cells", "src": "cells.png", "_op": "Loader"}),
        data: json!({"level": 3}),
    };
    let result = manager.run_operation("Threshold/Threshold", call).await.unwrap().expect("non-empty result");

    assert_eq!(result.data, json!({"level": 3}));
    assert_eq!(result.target["src"], "cells.png");
    assert_eq!(result.target["type"], "image");
    assert_eq!(result.target["_op"], "Loader");
}

#[tokio::test(start_paused = true)]
async fn test_rapid_updates_are_coalesced() {
    let manager = manager(Arc::new(FakeSandbox::default()), Arc::new(FakeFetcher::default()));
    manager.load_plugin(worker("Live")).await.unwrap();

    let call = |level: u64| WorkflowCall {
        op: Value::Null,
        target: json!({"type": "image", "name": "x", "level": level}),
        data: json!({"level": level}),
    };
    let (first, second) =
        tokio::join!(manager.update_operation("Live/Live", call(1)), manager.update_operation("Live/Live", call(2)));

    assert!(first.unwrap().is_none());
    assert_eq!(second.unwrap().unwrap().data, json!({"level": 2}));
}

#[tokio::test]
async fn test_input_loaders_match_data() {
    let manager = manager(Arc::new(FakeSandbox::default()), Arc::new(FakeFetcher::default()));
    manager.load_plugin(worker("Reader")).await.unwrap();

    assert_eq!(manager.match_loaders(&json!({"src": "a.tif"})).len(), 1);
    assert!(manager.match_loaders(&json!({"other": 1})).is_empty());
}

// ============================================================================
// Window Tests
// ============================================================================

#[tokio::test]
async fn test_window_plugin_creates_windows() {
    let manager = manager(Arc::new(FakeSandbox::default()), Arc::new(FakeFetcher::default()));
    manager.load_plugin(worker("Caller")).await.unwrap();
    manager.load_plugin(window_plugin("Viewer")).await.unwrap();
    assert!(manager.window_types().contains(&"Viewer".to_string()));

    let handle = manager.create_window(Some("Caller"), json!({"type": "Viewer", "data": {"src": "a.png"}})).await.unwrap();
    assert_eq!(handle.plugin.as_deref(), Some("Viewer"));
    assert_eq!(handle.name, "Viewer");
    assert_eq!(manager.window_count("Viewer"), 1);

    let builtin = manager.create_window(Some("Caller"), json!({"type": "imjoy/image"})).await.unwrap();
    assert!(builtin.id.starts_with("imjoy_"));

    let err = manager.create_window(None, json!({"type": "Nope"})).await.unwrap_err();
    assert!(matches!(err, PluginError::NotFound { .. }));

    manager.unload_plugin("Viewer", true);
    assert_eq!(manager.window_count("Viewer"), 0);
}

#[tokio::test]
async fn test_run_between_plugins() {
    let manager = manager(Arc::new(FakeSandbox::default()), Arc::new(FakeFetcher::default()));
    manager.load_plugin(worker("Caller")).await.unwrap();
    manager.load_plugin(worker("Target")).await.unwrap();

    let received = manager.run_plugin("Caller", "Target", json!({"data": {"x": 1}})).await.unwrap();
    assert_eq!(received["data"]["x"], 1);
    assert_eq!(received["data"]["_source_op"], "Caller");
    assert_eq!(received["data"]["_op"], "Target");
    assert_eq!(received["config"], json!({}));

    let err = manager.run_plugin("Caller", "Ghost", json!({})).await.unwrap_err();
    assert!(matches!(err, PluginError::NotFound { .. }));
}

// ============================================================================
// Install Tests
// ============================================================================

fn repository(fetcher: &FakeFetcher, plugins: &[(&str, String)]) {
    let entries: Vec<Value> = plugins.iter().map(|(name, _)| json!({"name": name})).collect();
    fetcher.serve(MANIFEST_URL, &json!({"name": "Demo Repo", "uri_root": "repository", "plugins": entries}).to_string());
    for (name, source) in plugins {
        fetcher.serve(&format!("{SOURCE_ROOT}/{name}.imjoy.html"), source);
    }
}

async fn workspace_manager(sandbox: Arc<FakeSandbox>, fetcher: Arc<FakeFetcher>) -> Arc<PluginManager> {
    let manager = manager(sandbox, fetcher);
    manager.load_workspace_list().await.unwrap();
    manager.load_workspace(None).await.unwrap();
    manager
}

#[tokio::test]
async fn test_install_with_dependencies() {
    let fetcher = Arc::new(FakeFetcher::default());
    repository(
        &fetcher,
        &[
            ("Main", worker_source("Main", &["oeway/ImJoy-Plugins:Helper"])),
            ("Helper", worker_source("Helper", &[])),
        ],
    );
    let manager = workspace_manager(Arc::new(FakeSandbox::default()), Arc::clone(&fetcher)).await;

    let installed = manager.install_plugin("oeway/ImJoy-Plugins:Main", None).await.unwrap();
    assert_eq!(installed.origin.as_deref(), Some("oeway/ImJoy-Plugins:Main"));

    let mut names: Vec<String> = manager.installed_plugins().into_iter().map(|p| p.name).collect();
    names.sort();
    assert_eq!(names, vec!["Helper", "Main"]);

    // Installed in the background.
    wait_for(|| manager.instance_state("Main") == Some(InstanceState::Running)).await;

    // A second install does not fetch the dependency again.
    manager.install_plugin("oeway/ImJoy-Plugins:Main", None).await.unwrap();
    assert_eq!(fetcher.requests_for(&format!("{SOURCE_ROOT}/Helper.imjoy.html")), 1);

    let source = manager.plugin_source("Main").await.unwrap();
    assert!(source.contains("oeway/ImJoy-Plugins:Helper"));
}

#[tokio::test]
async fn test_failed_dependency_aborts_install() {
    let fetcher = Arc::new(FakeFetcher::default());
    repository(&fetcher, &[("Parent", worker_source("Parent", &["oeway/ImJoy-Plugins:Missing"]))]);
    let manager = workspace_manager(Arc::new(FakeSandbox::default()), fetcher).await;

    let err = manager.install_plugin("oeway/ImJoy-Plugins:Parent", None).await.unwrap_err();
    match err {
        PluginError::DependencyInstall { ref plugin, .. } => assert_eq!(plugin, "Parent"),
        other => panic!("unexpected error: {other}"),
    }
    assert!(manager.installed_plugins().is_empty());
    assert!(manager.plugin_source("Parent").await.is_err());
}

#[tokio::test]
async fn test_dependencies_persisted_before_parent() {
    let fetcher = Arc::new(FakeFetcher::default());
    repository(
        &fetcher,
        &[
            ("Parent", worker_source("Parent", &["oeway/ImJoy-Plugins:Left", "oeway/ImJoy-Plugins:Right"])),
            ("Left", worker_source("Left", &[])),
            ("Right", worker_source("Right", &[])),
        ],
    );
    let stores = Arc::new(RecordingStoreProvider::default());
    let manager =
        PluginManager::builder(Arc::new(FakeSandbox::default()), fetcher, Arc::clone(&stores) as Arc<dyn StoreProvider>)
            .build()
            .unwrap();
    manager.load_workspace_list().await.unwrap();
    manager.load_workspace(None).await.unwrap();

    manager.install_plugin("oeway/ImJoy-Plugins:Parent", None).await.unwrap();

    let writes = stores.writes();
    let position = |name: &str| writes.iter().position(|w| w == name).unwrap_or_else(|| panic!("{name} not written"));
    assert!(position("Left") < position("Parent"));
    assert!(position("Right") < position("Parent"));

    let mut names: Vec<String> = manager.installed_plugins().into_iter().map(|p| p.name).collect();
    names.sort();
    assert_eq!(names, vec!["Left", "Parent", "Right"]);
}

#[tokio::test]
async fn test_one_failed_dependency_of_two_aborts_install() {
    let fetcher = Arc::new(FakeFetcher::default());
    repository(
        &fetcher,
        &[
            ("Parent", worker_source("Parent", &["oeway/ImJoy-Plugins:Left", "oeway/ImJoy-Plugins:Missing"])),
            ("Left", worker_source("Left", &[])),
        ],
    );
    let stores = Arc::new(RecordingStoreProvider::default());
    let manager =
        PluginManager::builder(Arc::new(FakeSandbox::default()), fetcher, Arc::clone(&stores) as Arc<dyn StoreProvider>)
            .build()
            .unwrap();
    manager.load_workspace_list().await.unwrap();
    manager.load_workspace(None).await.unwrap();

    let err = manager.install_plugin("oeway/ImJoy-Plugins:Parent", None).await.unwrap_err();
    match &err {
        PluginError::DependencyInstall { plugin, .. } => assert_eq!(plugin, "Parent"),
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.to_string().contains("Parent"));
    assert!(!stores.writes().contains(&"Parent".to_string()));
    assert!(!manager.installed_plugins().iter().any(|p| p.name == "Parent"));
    assert!(manager.plugin_source("Parent").await.is_err());
}

#[tokio::test]
async fn test_remove_plugin_unloads_it() {
    let fetcher = Arc::new(FakeFetcher::default());
    repository(&fetcher, &[("Solo", worker_source("Solo", &[]))]);
    let manager = workspace_manager(Arc::new(FakeSandbox::default()), fetcher).await;

    manager.install_plugin("oeway/ImJoy-Plugins:Solo", None).await.unwrap();
    wait_for(|| manager.instance_state("Solo") == Some(InstanceState::Running)).await;

    manager.remove_plugin("Solo").await.unwrap();
    assert!(manager.instance_state("Solo").is_none());
    assert!(manager.installed_plugins().is_empty());

    // Nothing left to reload.
    manager.reload_plugins().await.unwrap();
    assert!(manager.plugin_names().is_empty());
}

#[tokio::test]
async fn test_resolve_names_with_spaces() {
    let fetcher = Arc::new(FakeFetcher::default());
    repository(&fetcher, &[("3D Demos", worker_source("3D Demos", &[]))]);
    let resolver = RepositoryResolver::new(fetcher);

    let source = resolver.fetch_source("oeway/ImJoy-Plugins:3D Demos", &[]).await.unwrap();
    assert_eq!(source.uri, format!("{SOURCE_ROOT}/3D Demos.imjoy.html"));
    assert_eq!(source.origin.as_deref(), Some("oeway/ImJoy-Plugins:3D Demos"));
    assert_eq!(source.scope.len(), 1);
}
