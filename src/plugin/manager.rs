//! Plugin manager: installs, loads, runs and tears down plugins.
//!
//! The manager owns all runtime state behind one lock that is never held
//! across an await point. Plugin code reaches it through [`HostApi`] handles,
//! which keep only a weak reference so a dropped manager shuts plugins out.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::{join_all, try_join_all, BoxFuture};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::broadcast;

use super::adapter::{filter_for_plugin, plugin_to_workflow, workflow_to_plugin, WorkflowCall, WorkflowResult};
use super::config::{parse_plugin_source, validate_plugin_name, PluginConfig, SourceContext};
use super::debounce::DEFAULT_UPDATE_DEBOUNCE;
use super::error::ENGINE_UNAVAILABLE;
use super::host::{HostApi, HostExtensions};
use super::manifest::{Manifest, ManifestEntry};
use super::registry::{Binding, OpHandler, OperationRecord, OperationSpec, Registry};
use super::repository::{default_repositories, Fetcher, PluginReference, Repository, RepositoryResolver};
use super::runtime::{terminate_connection, InstanceState, PluginInstance};
use super::sandbox::{PluginConnection, Sandbox, SandboxSpec, WindowConfig, WindowHandle, WindowSurface};
use super::store::{DocumentStore, StoreProvider};
use super::types::{rand_id, slug, PLUGIN_EXTENSION};
use super::{PluginError, PluginKind, PluginResult};

/// Name of the store holding repository/workspace lists and plugin settings.
pub const CONFIG_STORE: &str = "config";

const REPOSITORY_LIST_DOC: &str = "repository_list";
const WORKSPACE_LIST_DOC: &str = "workspace_list";
const EVENT_CAPACITY: usize = 256;

/// Tunables for a [`PluginManager`].
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Upper bound on a sandbox handshake.
    pub connect_timeout: Duration,
    /// Quiet period before an operation's `update` runs.
    pub update_debounce: Duration,
    /// Workspace used when none has been selected.
    pub default_workspace: String,
    /// Repositories merged into the stored repository list.
    pub default_repositories: Vec<Repository>,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            update_debounce: DEFAULT_UPDATE_DEBOUNCE,
            default_workspace: "default".to_string(),
            default_repositories: default_repositories(),
        }
    }
}

/// Notifications published by the runtime.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RuntimeEvent {
    /// A plugin finished setup and accepts calls.
    PluginLoaded { name: String, id: String },
    /// An operation was published.
    OperationRegistered { key: String },
    /// The workspace list changed.
    WorkspaceListUpdated { workspaces: Vec<String> },
    /// A user-facing status message.
    Message { text: String },
}

/// Description of a running plugin handed to other plugins.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginHandle {
    pub name: String,
    pub id: String,
    #[serde(rename = "type")]
    pub kind: PluginKind,
    pub state: InstanceState,
    /// Exported function names.
    pub api: Vec<String>,
}

/// A saved workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRecord {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    /// Serialized workflow.
    pub workflow: String,
    /// RFC 3339 timestamp of the last save.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_at: Option<String>,
}

#[derive(Default)]
struct RuntimeState {
    /// One live instance per plugin name.
    instances: HashMap<String, PluginInstance>,
    /// Window instances by window id.
    windows: HashMap<String, PluginInstance>,
    registry: Registry,
    installed: Vec<PluginConfig>,
    available: Vec<ManifestEntry>,
    repositories: Vec<Repository>,
    selected_repository: Option<Repository>,
    workspaces: Vec<String>,
    selected_workspace: Option<String>,
    workspace_store: Option<Arc<dyn DocumentStore>>,
    workflows: Vec<WorkflowRecord>,
}

impl RuntimeState {
    /// Take every instance out, returning the connections to terminate.
    fn drain(&mut self) -> Vec<(String, Arc<dyn PluginConnection>)> {
        let mut connections = Vec::new();
        for (_, mut instance) in self.instances.drain().chain(self.windows.drain()) {
            let name = instance.name().to_string();
            if let Some(connection) = instance.shutdown() {
                connections.push((name, connection));
            }
        }
        self.registry.clear();
        connections
    }
}

/// Builder for [`PluginManager`].
pub struct PluginManagerBuilder {
    sandbox: Arc<dyn Sandbox>,
    fetcher: Arc<dyn Fetcher>,
    stores: Arc<dyn StoreProvider>,
    surface: Option<Arc<dyn WindowSurface>>,
    extensions: HostExtensions,
    options: ManagerOptions,
}

impl PluginManagerBuilder {
    pub fn new(sandbox: Arc<dyn Sandbox>, fetcher: Arc<dyn Fetcher>, stores: Arc<dyn StoreProvider>) -> Self {
        Self {
            sandbox,
            fetcher,
            stores,
            surface: None,
            extensions: HostExtensions::new(),
            options: ManagerOptions::default(),
        }
    }

    pub fn options(mut self, options: ManagerOptions) -> Self {
        self.options = options;
        self
    }

    /// Surface that renders windows.
    pub fn window_surface(mut self, surface: Arc<dyn WindowSurface>) -> Self {
        self.surface = Some(surface);
        self
    }

    /// Extra host functions exposed to every plugin.
    pub fn host_extensions(mut self, extensions: HostExtensions) -> Self {
        self.extensions = extensions;
        self
    }

    pub fn build(self) -> PluginResult<Arc<PluginManager>> {
        let config_store = self.stores.open(CONFIG_STORE)?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Arc::new_cyclic(|this| PluginManager {
            this: this.clone(),
            options: self.options,
            sandbox: self.sandbox,
            resolver: RepositoryResolver::new(self.fetcher),
            stores: self.stores,
            config_store,
            surface: self.surface,
            extensions: Arc::new(self.extensions),
            state: Mutex::new(RuntimeState::default()),
            events,
        }))
    }
}

/// Owns installed plugins and their live instances.
pub struct PluginManager {
    this: Weak<PluginManager>,
    options: ManagerOptions,
    sandbox: Arc<dyn Sandbox>,
    resolver: RepositoryResolver,
    stores: Arc<dyn StoreProvider>,
    config_store: Arc<dyn DocumentStore>,
    surface: Option<Arc<dyn WindowSurface>>,
    extensions: Arc<HostExtensions>,
    state: Mutex<RuntimeState>,
    events: broadcast::Sender<RuntimeEvent>,
}

impl PluginManager {
    pub fn builder(
        sandbox: Arc<dyn Sandbox>,
        fetcher: Arc<dyn Fetcher>,
        stores: Arc<dyn StoreProvider>,
    ) -> PluginManagerBuilder {
        PluginManagerBuilder::new(sandbox, fetcher, stores)
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    /// Subscribe to runtime events.
    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: RuntimeEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn message(&self, text: impl Into<String>) {
        let text = text.into();
        tracing::info!(message = %text, "Runtime message");
        self.emit(RuntimeEvent::Message { text });
    }

    fn host_api(&self, plugin: &str, instance_id: &str) -> HostApi {
        HostApi::new(self.this.clone(), plugin, instance_id, Arc::clone(&self.extensions))
    }

    fn workspace_store(&self) -> PluginResult<Arc<dyn DocumentStore>> {
        self.state
            .lock()
            .workspace_store
            .clone()
            .ok_or_else(|| PluginError::Storage("no workspace has been loaded".to_string()))
    }

    // ---- repositories -------------------------------------------------

    /// Load the stored repository list, merging in the default repositories.
    pub async fn load_repository_list(&self) -> PluginResult<Vec<Repository>> {
        let stored = self.config_store.get(REPOSITORY_LIST_DOC).await?;
        let mut changed = stored.is_none();
        let mut list: Vec<Repository> = match stored {
            Some(doc) => serde_json::from_value(doc.body.get("list").cloned().unwrap_or_else(|| json!([])))?,
            None => Vec::new(),
        };

        for repo in &self.options.default_repositories {
            if !list.iter().any(|r| r.name == repo.name && r.url == repo.url) {
                list.push(repo.clone());
                changed = true;
            }
        }
        if changed {
            self.persist_repositories(&list).await?;
        }

        self.state.lock().repositories = list.clone();
        Ok(list)
    }

    async fn persist_repositories(&self, list: &[Repository]) -> PluginResult<()> {
        self.config_store.upsert(REPOSITORY_LIST_DOC, json!({ "list": list })).await?;
        Ok(())
    }

    pub fn repositories(&self) -> Vec<Repository> {
        self.state.lock().repositories.clone()
    }

    pub fn selected_repository(&self) -> Option<Repository> {
        self.state.lock().selected_repository.clone()
    }

    /// Fetch a repository manifest and add the repository to the list.
    pub async fn add_repository(&self, repo: Repository) -> PluginResult<Repository> {
        let manifest = match self.reload_repository(&repo).await {
            Ok(manifest) => manifest,
            Err(e) => {
                self.message(format!("Failed to load repository from: {}", repo.url));
                return Err(e);
            }
        };

        let mut repo = repo;
        if let Some(name) = manifest.name {
            repo.name = name;
        }
        if manifest.description.is_some() {
            repo.description = manifest.description;
        }

        let (list, replaced) = {
            let mut state = self.state.lock();
            if state.repositories.iter().any(|r| r.name == repo.name && r.url != repo.url) {
                repo.name = repo.url.replace("https://github.com/", "").replace("http://github.com/", "");
            }
            let replaced = match state.repositories.iter().position(|r| r.url == repo.url) {
                Some(pos) => {
                    state.repositories.remove(pos);
                    true
                }
                None => false,
            };
            state.repositories.push(repo.clone());
            (state.repositories.clone(), replaced)
        };

        if replaced {
            self.message("Repository with the same url already exists.");
        }
        self.persist_repositories(&list).await?;
        Ok(repo)
    }

    /// Remove a repository by url or name.
    pub async fn remove_repository(&self, key: &str) -> PluginResult<bool> {
        let list = {
            let mut state = self.state.lock();
            let before = state.repositories.len();
            state.repositories.retain(|r| r.url != key && r.name != key);
            if state.repositories.len() == before {
                return Ok(false);
            }
            state.repositories.clone()
        };
        self.persist_repositories(&list).await?;
        self.message("Repository has been deleted.");
        Ok(true)
    }

    /// Refetch a repository manifest and make it the available plugin list.
    pub async fn reload_repository(&self, repo: &Repository) -> PluginResult<Manifest> {
        let mut manifest = self.resolver.refresh(&repo.url, None).await?;

        let mut state = self.state.lock();
        let installed: Vec<(String, Option<String>)> =
            state.installed.iter().map(|p| (p.name.clone(), p.tag.clone())).collect();
        manifest.mark_installed(installed.iter().map(|(name, tag)| (name.as_str(), tag.as_deref())));
        state.available = manifest.plugins.clone();
        state.selected_repository = Some(repo.clone());
        Ok(manifest)
    }

    pub fn available_plugins(&self) -> Vec<ManifestEntry> {
        self.state.lock().available.clone()
    }

    // ---- workspaces ---------------------------------------------------

    /// Load the stored workspace list, creating it on first use.
    pub async fn load_workspace_list(&self) -> PluginResult<Vec<String>> {
        let (list, default) = match self.config_store.get(WORKSPACE_LIST_DOC).await? {
            Some(doc) => {
                let list: Vec<String> =
                    serde_json::from_value(doc.body.get("list").cloned().unwrap_or_else(|| json!([])))?;
                let default = doc.body.get("default").and_then(Value::as_str).map(str::to_string);
                (list, default)
            }
            None => {
                let list = vec![self.options.default_workspace.clone()];
                self.persist_workspaces(&list, list.first().map(String::as_str)).await?;
                (list, None)
            }
        };

        let mut state = self.state.lock();
        if state.selected_workspace.is_none() {
            state.selected_workspace = default.filter(|d| list.contains(d)).or_else(|| list.first().cloned());
        }
        state.workspaces = list.clone();
        Ok(list)
    }

    /// Store the list with the workspace selected on next start.
    async fn persist_workspaces(&self, list: &[String], default: Option<&str>) -> PluginResult<()> {
        self.config_store.upsert(WORKSPACE_LIST_DOC, json!({ "list": list, "default": default })).await?;
        Ok(())
    }

    pub fn workspaces(&self) -> Vec<String> {
        self.state.lock().workspaces.clone()
    }

    pub fn selected_workspace(&self) -> Option<String> {
        self.state.lock().selected_workspace.clone()
    }

    /// Select a workspace and open its store. New names are added to the list.
    pub async fn load_workspace(&self, name: Option<&str>) -> PluginResult<String> {
        let (name, list) = {
            let mut state = self.state.lock();
            let name = name
                .map(str::to_string)
                .or_else(|| state.selected_workspace.clone())
                .unwrap_or_else(|| self.options.default_workspace.clone());
            if !state.workspaces.contains(&name) {
                state.workspaces.push(name.clone());
            }
            (name, state.workspaces.clone())
        };

        self.persist_workspaces(&list, Some(&name)).await?;

        let store = self.stores.open(&format!("{name}_workspace"))?;
        let workspaces = {
            let mut state = self.state.lock();
            state.workspace_store = Some(store);
            state.selected_workspace = Some(name.clone());
            state.workspaces.clone()
        };

        tracing::debug!(workspace = %name, "Workspace loaded");
        self.emit(RuntimeEvent::WorkspaceListUpdated { workspaces });
        Ok(name)
    }

    /// Remove a workspace from the list. Its documents are left in place.
    pub async fn remove_workspace(&self, name: &str) -> PluginResult<bool> {
        let (list, selected) = {
            let mut state = self.state.lock();
            let Some(pos) = state.workspaces.iter().position(|w| w == name) else {
                return Ok(false);
            };
            state.workspaces.remove(pos);
            if state.selected_workspace.as_deref() == Some(name) {
                state.selected_workspace = state.workspaces.first().cloned();
                state.workspace_store = None;
            }
            (state.workspaces.clone(), state.selected_workspace.clone())
        };
        self.persist_workspaces(&list, selected.as_deref()).await?;
        self.emit(RuntimeEvent::WorkspaceListUpdated { workspaces: list });
        Ok(true)
    }

    // ---- workflows ----------------------------------------------------

    /// Save a workflow in the current workspace.
    pub async fn save_workflow(&self, name: &str, workflow: &Value) -> PluginResult<WorkflowRecord> {
        let store = self.workspace_store()?;
        let record = WorkflowRecord {
            id: format!("{name}_workflow"),
            name: name.to_string(),
            workflow: workflow.to_string(),
            saved_at: Some(chrono::Utc::now().to_rfc3339()),
        };
        store.upsert(&record.id, serde_json::to_value(&record)?).await?;

        {
            let mut state = self.state.lock();
            state.workflows.retain(|w| w.id != record.id);
            state.workflows.push(record.clone());
        }
        self.message(format!("{name} has been successfully saved."));
        Ok(record)
    }

    pub async fn remove_workflow(&self, id: &str) -> PluginResult<bool> {
        let removed = self.workspace_store()?.remove(id).await?;
        self.state.lock().workflows.retain(|w| w.id != id);
        if removed {
            self.message(format!("{id} has been successfully removed."));
        }
        Ok(removed)
    }

    pub fn workflows(&self) -> Vec<WorkflowRecord> {
        self.state.lock().workflows.clone()
    }

    // ---- plugin records -----------------------------------------------

    /// Persist a plugin record in the current workspace, replacing any
    /// record with the same name.
    pub async fn save_plugin(&self, config: &PluginConfig) -> PluginResult<PluginConfig> {
        let mut template = parse_plugin_source(
            &config.code,
            &SourceContext { uri: config.uri.clone(), tag: config.tag.clone(), origin: config.origin.clone() },
        )?;
        template.origin = config.origin.clone();
        template.record_id = slug(&template.name);

        let store = self.workspace_store()?;
        store.remove(&template.record_id).await?;
        store.put(&template.record_id, template.to_value()?, None).await?;

        {
            let mut state = self.state.lock();
            state.installed.retain(|p| p.name != template.name);
            state.installed.push(template.clone());
        }
        self.message(format!("{} has been successfully saved.", template.name));
        Ok(template)
    }

    /// Delete a plugin record and unload the plugin.
    pub async fn remove_plugin(&self, name: &str) -> PluginResult<()> {
        let record_id = {
            let state = self.state.lock();
            state.installed.iter().find(|p| p.name == name).map(|p| p.record_id.clone())
        }
        .unwrap_or_else(|| slug(name));

        self.workspace_store()?.remove(&record_id).await?;

        {
            let mut state = self.state.lock();
            state.installed.retain(|p| p.name != name);
            for entry in state.available.iter_mut().filter(|p| p.name == name) {
                entry.installed = false;
                entry.tag = None;
            }
        }
        self.unload_plugin(name, true);
        self.message(format!("\"{name}\" has been removed."));
        Ok(())
    }

    pub fn installed_plugins(&self) -> Vec<PluginConfig> {
        self.state.lock().installed.clone()
    }

    async fn stored_code(&self, record_id: &str) -> PluginResult<String> {
        let doc = self
            .workspace_store()?
            .get(record_id)
            .await?
            .ok_or_else(|| PluginError::NotFound { kind: "Plugin record", name: record_id.to_string() })?;
        match doc.body.get("code") {
            Some(Value::String(code)) => Ok(code.clone()),
            _ => Err(PluginError::Storage(format!("record {record_id} has no source code"))),
        }
    }

    /// Raw source of a stored plugin.
    pub async fn plugin_source(&self, record_id: &str) -> PluginResult<String> {
        self.stored_code(record_id).await
    }

    /// Documentation block of a stored plugin.
    pub async fn plugin_docs(&self, record_id: &str) -> PluginResult<Option<String>> {
        let code = self.stored_code(record_id).await?;
        Ok(super::source::parse_sections(&code).docs_text().map(str::to_string))
    }

    // ---- install ------------------------------------------------------

    /// Install a plugin and its dependencies, then load it in the background.
    ///
    /// The returned config is the saved record. Load failures after install
    /// are reported as messages only.
    pub async fn install_plugin(&self, reference: &str, tag: Option<&str>) -> PluginResult<PluginConfig> {
        let scope = self.state.lock().available.clone();
        self.install_with_scope(reference.to_string(), tag.map(str::to_string), scope).await
    }

    fn install_with_scope(
        &self,
        reference: String,
        tag: Option<String>,
        scope: Vec<ManifestEntry>,
    ) -> BoxFuture<'_, PluginResult<PluginConfig>> {
        async move {
            let source = match self.resolver.fetch_source(&reference, &scope).await {
                Ok(source) => source,
                Err(e) => {
                    self.message(format!("Failed to download plugin from {reference}: {e}"));
                    return Err(e);
                }
            };

            let mut config = parse_plugin_source(
                &source.code,
                &SourceContext { uri: Some(source.uri.clone()), tag: source.tag.clone(), origin: None },
            )?;
            config.tag = tag.clone().or(config.tag);
            let origin = source.origin.clone().unwrap_or_else(|| reference.clone());
            config.origin = Some(tagged_origin(&origin, config.tag.as_deref()));
            config.record_id = slug(&config.name);

            if !config.dependencies.is_empty() {
                tracing::debug!(plugin = %config.name, count = config.dependencies.len(), "Installing dependencies");
                let installs =
                    config.dependencies.iter().map(|dep| self.install_dependency(dep.clone(), source.scope.clone()));
                if let Err(e) = try_join_all(installs).await {
                    self.message(format!("Failed to install dependencies for {}: {e}", config.name));
                    return Err(PluginError::DependencyInstall { plugin: config.name.clone(), source: Box::new(e) });
                }
            }

            let saved = self.save_plugin(&config).await?;
            {
                let mut state = self.state.lock();
                for entry in state.available.iter_mut().filter(|p| p.name == saved.name) {
                    entry.installed = true;
                    entry.tag = saved.tag.clone();
                }
            }
            self.message(format!("Plugin \"{}\" has been successfully installed.", saved.name));
            self.spawn_reload(saved.clone());
            Ok(saved)
        }
        .boxed()
    }

    /// Install one dependency. Already installed dependencies are only
    /// re-validated from their stored source.
    fn install_dependency(&self, reference: String, scope: Vec<ManifestEntry>) -> BoxFuture<'_, PluginResult<()>> {
        async move {
            let known = match PluginReference::parse(&reference)? {
                PluginReference::Repository { name, tag, .. } | PluginReference::Scoped { name, tag } => {
                    Some((name, tag))
                }
                PluginReference::Url { .. } => None,
            };

            if let Some((name, tag)) = known {
                let stored = self.state.lock().installed.iter().find(|p| p.name == name).cloned();
                if let Some(stored) = stored {
                    tracing::debug!(plugin = %name, "Dependency already installed");
                    parse_plugin_source(
                        &stored.code,
                        &SourceContext { uri: stored.uri.clone(), tag: tag.or(stored.tag), origin: stored.origin },
                    )?;
                    return Ok(());
                }
            }

            self.install_with_scope(reference, None, scope).await.map(|_| ())
        }
        .boxed()
    }

    fn spawn_reload(&self, config: PluginConfig) {
        let Some(manager) = self.this.upgrade() else { return };
        tokio::spawn(async move {
            if let Err(e) = manager.reload_plugin(&config).await {
                tracing::warn!(plugin = %config.name, error = %e, "Installed plugin failed to load");
            }
        });
    }

    // ---- lifecycle ----------------------------------------------------

    /// Reparse a stored record and load it.
    pub async fn reload_plugin(&self, record: &PluginConfig) -> PluginResult<String> {
        self.unload_plugin(&record.name, true);
        let mut template = parse_plugin_source(
            &record.code,
            &SourceContext { uri: record.uri.clone(), tag: record.tag.clone(), origin: record.origin.clone() },
        )?;
        template.record_id = record.record_id.clone();
        self.load_plugin(template).await
    }

    /// Load a plugin, replacing any live instance with the same name.
    ///
    /// Returns the new instance id once setup has finished.
    pub async fn load_plugin(&self, template: PluginConfig) -> PluginResult<String> {
        validate_plugin_name(&template.name)?;
        self.unload_plugin(&template.name, true);

        match template.kind {
            PluginKind::Window => self.preload_window_plugin(template),
            _ => self.load_sandboxed(template).await,
        }
    }

    /// Window plugins only register their window type until a window is created.
    fn preload_window_plugin(&self, template: PluginConfig) -> PluginResult<String> {
        let instance = PluginInstance::window(template.clone());
        let id = instance.id().to_string();

        let registered = {
            let mut state = self.state.lock();
            state.instances.insert(template.name.clone(), instance);
            let registered = state.registry.register(
                &template,
                &Binding::Window,
                OperationSpec::from_plugin(&template),
                self.options.update_debounce,
            );
            if registered.is_err() {
                state.instances.remove(&template.name);
            }
            registered
        };

        let key = registered?;
        self.emit(RuntimeEvent::OperationRegistered { key });
        self.emit(RuntimeEvent::PluginLoaded { name: template.name.clone(), id: id.clone() });
        Ok(id)
    }

    async fn load_sandboxed(&self, template: PluginConfig) -> PluginResult<String> {
        let name = template.name.clone();
        if template.kind == PluginKind::NativeProcess && !self.sandbox.engine_available(template.kind) {
            tracing::warn!(plugin = %name, "{ENGINE_UNAVAILABLE}");
        }

        let instance = PluginInstance::connecting(template.clone());
        let id = instance.id().to_string();
        let workspace = {
            let mut state = self.state.lock();
            state.instances.insert(name.clone(), instance);
            state.selected_workspace.clone()
        };

        let connection = match self.connect(SandboxSpec::new(id.clone(), template.clone(), workspace), &name, &id).await
        {
            Ok(connection) => connection,
            Err(e) => {
                self.fail_instance(&name, &id, &e.to_string());
                if !e.is_engine_unavailable() {
                    self.message(format!("<{name}>: {e}"));
                }
                return Err(e);
            }
        };

        // Publish the default operation as soon as the handshake completes.
        let registered = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            match state.instances.get_mut(&name).filter(|i| i.id() == id) {
                // Unloaded or replaced while connecting.
                None => None,
                Some(instance) => 'attached: {
                    if !instance.attach(Arc::clone(&connection)) {
                        break 'attached None;
                    }
                    let key = state.registry.register(
                        &template,
                        &Binding::Connection(Arc::clone(&connection)),
                        OperationSpec::from_plugin(&template),
                        self.options.update_debounce,
                    );
                    if key.is_ok() {
                        state.registry.register_extensions(&name, &template.extensions);
                    }
                    Some(key)
                }
            }
        };

        let key = match registered {
            None => {
                terminate_connection(&name, connection.as_ref());
                return Err(superseded(&name));
            }
            Some(Err(e)) => {
                self.fail_instance(&name, &id, &e.to_string());
                return Err(e);
            }
            Some(Ok(key)) => key,
        };
        self.emit(RuntimeEvent::OperationRegistered { key });

        if !connection.exposes("setup") {
            let err = PluginError::SetupMissing(name.clone());
            self.message(err.to_string());
            self.fail_instance(&name, &id, &err.to_string());
            return Err(err);
        }

        if let Err(e) = connection.call("setup", Vec::new()).await {
            let err = attribute(&name, e);
            tracing::error!(plugin = %name, error = %err, "Error occurred when loading plugin");
            self.message(err.to_string());
            self.fail_instance(&name, &id, &err.to_string());
            return Err(err);
        }

        let (running, released) = {
            let mut state = self.state.lock();
            match state.instances.get_mut(&name).filter(|i| i.id() == id) {
                Some(instance) => {
                    if instance.mark_running() {
                        (true, None)
                    } else {
                        (false, instance.shutdown())
                    }
                }
                None => (false, None),
            }
        };
        if !running {
            if let Some(connection) = released {
                self.state.lock().registry.remove_plugin(&name);
                terminate_connection(&name, connection.as_ref());
            }
            return Err(superseded(&name));
        }

        tracing::info!(plugin = %name, id = %id, "Plugin loaded");
        self.emit(RuntimeEvent::PluginLoaded { name, id: id.clone() });
        Ok(id)
    }

    async fn connect(&self, spec: SandboxSpec, plugin: &str, id: &str) -> PluginResult<Arc<dyn PluginConnection>> {
        let timeout = self.options.connect_timeout;
        let host = self.host_api(plugin, id);
        match tokio::time::timeout(timeout, self.sandbox.connect(spec, host)).await {
            Ok(result) => result,
            Err(_) => Err(PluginError::Connection {
                plugin: plugin.to_string(),
                message: format!("connection timed out after {}s", timeout.as_secs_f32()),
            }),
        }
    }

    /// Mark an instance failed if it is still the current one, dropping its
    /// operations and terminating its connection.
    fn fail_instance(&self, name: &str, id: &str, message: &str) {
        let released = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            match state.instances.get_mut(name).filter(|i| i.id() == id) {
                Some(instance) => {
                    state.registry.remove_plugin(name);
                    instance.fail(message)
                }
                None => None,
            }
        };
        if let Some(connection) = released {
            terminate_connection(name, connection.as_ref());
        }
    }

    /// Unregister a plugin's operations and terminate its instance.
    ///
    /// With `remove` the instance is dropped from the runtime; otherwise it
    /// stays listed as terminated. Returns whether an instance existed.
    pub fn unload_plugin(&self, name: &str, remove: bool) -> bool {
        let (released, windows) = {
            let mut state = self.state.lock();
            state.registry.remove_plugin(name);
            let released = if remove {
                state.instances.remove(name).map(|mut i| i.shutdown())
            } else {
                state.instances.get_mut(name).map(PluginInstance::shutdown)
            };
            let window_ids: Vec<String> =
                state.windows.iter().filter(|(_, w)| w.name() == name).map(|(id, _)| id.clone()).collect();
            let windows: Vec<_> = window_ids
                .iter()
                .filter_map(|id| state.windows.remove(id))
                .filter_map(|mut w| w.shutdown())
                .collect();
            (released, windows)
        };

        for connection in windows {
            terminate_connection(name, connection.as_ref());
        }

        match released {
            Some(connection) => {
                if let Some(connection) = connection {
                    tracing::debug!(plugin = %name, "Terminating plugin");
                    terminate_connection(name, connection.as_ref());
                }
                true
            }
            None => false,
        }
    }

    /// Terminate everything, reopen the workspace and load every stored plugin.
    pub async fn reload_plugins(&self) -> PluginResult<()> {
        let released = {
            let mut state = self.state.lock();
            state.installed.clear();
            state.workflows.clear();
            state.drain()
        };
        for (name, connection) in released {
            terminate_connection(&name, connection.as_ref());
        }

        let workspace = self.load_workspace(None).await?;
        let plugins = self.load_records().await?;
        tracing::info!(workspace = %workspace, plugins = plugins.len(), "Reloading plugins");

        let results = join_all(plugins.iter().map(|p| self.reload_plugin(p))).await;
        for (plugin, result) in plugins.iter().zip(results) {
            if let Err(e) = result {
                tracing::error!(plugin = %plugin.name, error = %e, "Failed to reload plugin");
                if !e.is_engine_unavailable() {
                    self.message(format!("<{}>: {e}", plugin.name));
                }
            }
        }
        Ok(())
    }

    /// Read plugin records and workflows from the current workspace without
    /// loading anything.
    pub async fn load_records(&self) -> PluginResult<Vec<PluginConfig>> {
        let docs = self.workspace_store()?.all().await?;

        let mut plugins = Vec::new();
        let mut workflows = Vec::new();
        for doc in docs {
            if doc.body.get("workflow").is_some() {
                match serde_json::from_value::<WorkflowRecord>(doc.body) {
                    Ok(workflow) => workflows.push(workflow),
                    Err(e) => tracing::warn!(id = %doc.id, error = %e, "Skipping unreadable workflow"),
                }
            } else {
                match serde_json::from_value::<PluginConfig>(doc.body) {
                    Ok(plugin) => plugins.push(plugin),
                    Err(e) => tracing::warn!(id = %doc.id, error = %e, "Skipping unreadable plugin record"),
                }
            }
        }

        let mut state = self.state.lock();
        state.installed = plugins.clone();
        state.workflows = workflows;
        Ok(plugins)
    }

    /// Terminate every instance and window.
    pub fn destroy(&self) {
        let released = self.state.lock().drain();
        for (name, connection) in released {
            terminate_connection(&name, connection.as_ref());
        }
    }

    // ---- windows ------------------------------------------------------

    /// Create a window, instantiating its window plugin when needed.
    pub async fn create_window(&self, caller: Option<&str>, window: Value) -> PluginResult<WindowHandle> {
        let mut window = WindowConfig::from_value(window)?;

        if window.is_builtin() {
            window.id = format!("imjoy_{}", rand_id());
            if window.name.is_empty() {
                window.name = "untitled window".to_string();
            }
            window.plugin = caller.map(str::to_string);
            let id = match self.surface {
                Some(ref surface) => surface.add_window(&window).await?,
                None => window.id.clone(),
            };
            return Ok(WindowHandle { id, name: window.name, plugin: window.plugin });
        }

        let owner = self
            .state
            .lock()
            .registry
            .window(&window.kind)
            .cloned()
            .ok_or_else(|| PluginError::NotFound { kind: "Window type", name: window.kind.clone() })?;
        if owner.kind != PluginKind::Window {
            return Err(PluginError::schema(&owner.name, "Window plugin must be with type \"window\""));
        }

        window.id = format!("{}_{}", owner.id, rand_id());
        if window.name.is_empty() {
            window.name = owner.name.clone();
        }
        window.plugin = Some(owner.name.clone());
        if let Some(ref surface) = self.surface {
            window.id = surface.add_window(&window).await?;
        }

        self.render_window(owner, window).await
    }

    async fn render_window(&self, owner: PluginConfig, mut window: WindowConfig) -> PluginResult<WindowHandle> {
        let name = owner.name.clone();
        let workspace = self.selected_workspace();
        let spec = SandboxSpec::new(window.id.clone(), owner.clone(), workspace);

        let connection = match self.connect(spec, &name, &window.id).await {
            Ok(connection) => connection,
            Err(e) => {
                self.message(format!("Error occurred when loading the window plugin {name}: {e}"));
                return Err(e);
            }
        };
        let abort = |err: PluginError| {
            terminate_connection(&name, connection.as_ref());
            err
        };

        if !connection.exposes("setup") {
            return Err(abort(PluginError::SetupMissing(name.clone())));
        }
        if let Err(e) = connection.call("setup", Vec::new()).await {
            let err = attribute(&name, e);
            self.message(err.to_string());
            return Err(abort(err));
        }

        let mut data = match window.data {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let source_op = data.get("_op").cloned().unwrap_or(Value::Null);
        data.insert("_source_op".to_string(), source_op);
        data.insert("_op".to_string(), Value::String(name.clone()));
        data.entry("_workflow_id").or_insert(Value::Null);
        window.data = Value::Object(data);

        if connection.exposes("run") {
            let my = json!({ "config": window.config, "data": window.data });
            if let Err(e) = connection.call("run", vec![filter_for_plugin(&my)]).await {
                let err = attribute(&name, e);
                self.message(err.to_string());
                return Err(abort(err));
            }
        } else if owner.runnable {
            return Err(abort(PluginError::execution(
                &name,
                format!("You must define a `run` function for {name} or set its `runnable` field to false."),
            )));
        }

        let mut instance = PluginInstance::connecting(owner).with_id(window.id.clone());
        instance.attach(connection);
        instance.mark_running();
        self.state.lock().windows.insert(window.id.clone(), instance);

        tracing::debug!(plugin = %name, window = %window.id, "Window created");
        Ok(WindowHandle { id: window.id, name: window.name, plugin: window.plugin })
    }

    /// Close a window instance.
    pub fn close_window(&self, id: &str) -> bool {
        let released = self.state.lock().windows.remove(id).map(|mut i| (i.name().to_string(), i.shutdown()));
        match released {
            Some((name, Some(connection))) => {
                terminate_connection(&name, connection.as_ref());
                true
            }
            Some((_, None)) => true,
            None => false,
        }
    }

    /// Number of open windows owned by a plugin.
    pub fn window_count(&self, plugin: &str) -> usize {
        self.state.lock().windows.values().filter(|w| w.name() == plugin).count()
    }

    /// Open a window of a window plugin from a call in the plugin shape.
    async fn open_plugin_window(&self, plugin: &str, call: &Value) -> PluginResult<WindowHandle> {
        let owner = self.plugin_config(plugin)?;
        let mut window = match owner.defaults {
            Some(Value::Object(ref defaults)) => defaults.clone(),
            _ => Map::new(),
        };
        window.insert("type".to_string(), Value::String(plugin.to_string()));
        window.insert("name".to_string(), Value::String(plugin.to_string()));
        window.insert("tag".to_string(), owner.tag.clone().map_or(Value::Null, Value::String));
        window.insert("data".to_string(), call.get("data").cloned().unwrap_or(Value::Null));
        window.insert("config".to_string(), call.get("config").cloned().unwrap_or(Value::Null));
        self.create_window(None, Value::Object(window)).await
    }

    // ---- invocation ---------------------------------------------------

    fn plugin_config(&self, plugin: &str) -> PluginResult<PluginConfig> {
        self.state
            .lock()
            .instances
            .get(plugin)
            .map(|i| i.config().clone())
            .ok_or_else(|| PluginError::plugin_not_found(plugin))
    }

    fn running_connection(&self, plugin: &str) -> PluginResult<Arc<dyn PluginConnection>> {
        let state = self.state.lock();
        let instance = state.instances.get(plugin).ok_or_else(|| PluginError::plugin_not_found(plugin))?;
        if !instance.is_running() {
            return Err(PluginError::NotRunning(plugin.to_string()));
        }
        instance
            .connection()
            .cloned()
            .ok_or_else(|| PluginError::NotFound { kind: "Plugin API", name: plugin.to_string() })
    }

    /// Publish an operation on behalf of a plugin.
    pub fn register_operation(&self, plugin: &str, op: Value) -> PluginResult<String> {
        let spec = OperationSpec::from_value(op)?;
        let key = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let instance = state.instances.get(plugin).ok_or_else(|| PluginError::plugin_not_found(plugin))?;
            let binding = match instance.connection() {
                Some(connection) => Binding::Connection(Arc::clone(connection)),
                None if instance.kind() == PluginKind::Window => Binding::Window,
                None => return Err(PluginError::NotRunning(plugin.to_string())),
            };
            let owner = instance.config().clone();
            state.registry.register(&owner, &binding, spec, self.options.update_debounce)?
        };
        self.emit(RuntimeEvent::OperationRegistered { key: key.clone() });
        Ok(key)
    }

    /// Run another plugin's `run` function on behalf of `caller`.
    pub async fn run_plugin(&self, caller: &str, target: &str, my: Value) -> PluginResult<Value> {
        let caller_kind = {
            let state = self.state.lock();
            state
                .instances
                .get(caller)
                .map(PluginInstance::kind)
                .ok_or_else(|| PluginError::NotFound { kind: "Source plugin", name: caller.to_string() })?
        };
        let connection = self.running_connection(target)?;
        if !connection.exposes("run") {
            return Err(PluginError::NotFound { kind: "Function", name: format!("{target}.run") });
        }

        let mut my = match my {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        my.insert("op".to_string(), json!({ "type": caller_kind.as_str(), "name": caller }));
        for key in ["config", "data"] {
            if !my.get(key).is_some_and(Value::is_object) {
                my.insert(key.to_string(), Value::Object(Map::new()));
            }
        }
        if let Some(Value::Object(data)) = my.get_mut("data") {
            data.insert("_op".to_string(), Value::String(target.to_string()));
            data.insert("_source_op".to_string(), Value::String(caller.to_string()));
            data.entry("_workflow_id").or_insert(Value::Null);
            data.insert("_transfer".to_string(), Value::Bool(false));
        }

        connection.call("run", vec![filter_for_plugin(&Value::Object(my))]).await.map_err(|e| attribute(target, e))
    }

    /// Call an exported function of a running plugin.
    pub async fn call_plugin(&self, target: &str, function: &str, args: Vec<Value>) -> PluginResult<Value> {
        let connection = self.running_connection(target)?;
        if !connection.exposes(function) {
            return Err(PluginError::NotFound { kind: "Function", name: format!("{target}.{function}") });
        }
        connection.call(function, args).await
    }

    /// Describe a running plugin.
    pub fn get_plugin(&self, name: &str) -> PluginResult<PluginHandle> {
        let state = self.state.lock();
        let instance = state.instances.get(name).ok_or_else(|| PluginError::plugin_not_found(name))?;
        if !instance.is_running() {
            return Err(PluginError::NotRunning(name.to_string()));
        }
        Ok(PluginHandle {
            name: instance.name().to_string(),
            id: instance.id().to_string(),
            kind: instance.kind(),
            state: instance.state(),
            api: instance.api_names(),
        })
    }

    fn running_operation(&self, key: &str) -> PluginResult<OperationRecord> {
        let state = self.state.lock();
        let op = state
            .registry
            .operation(key)
            .cloned()
            .ok_or_else(|| PluginError::NotFound { kind: "Operation", name: key.to_string() })?;
        match state.instances.get(&op.plugin_name) {
            Some(instance) if instance.is_running() => Ok(op),
            Some(_) => Err(PluginError::NotRunning(op.plugin_name)),
            None => Err(PluginError::plugin_not_found(op.plugin_name)),
        }
    }

    async fn execute(&self, key: &str, handler: OpHandler, call: Value) -> PluginResult<Value> {
        match handler {
            OpHandler::Remote { connection, function } => connection.call(&function, vec![call]).await,
            OpHandler::Window { plugin } => {
                self.open_plugin_window(&plugin, &call).await?;
                Ok(Value::Null)
            }
            OpHandler::Stub => {
                tracing::warn!(op = %key, "No run function defined");
                Ok(Value::Null)
            }
        }
    }

    /// Run a published operation with a workflow-shaped call.
    pub async fn run_operation(&self, key: &str, call: WorkflowCall) -> PluginResult<Option<WorkflowResult>> {
        let op = self.running_operation(key)?;
        let result =
            self.execute(key, op.handler, workflow_to_plugin(call)).await.map_err(|e| attribute(&op.plugin_name, e))?;
        Ok(plugin_to_workflow(&result))
    }

    /// Run an operation's update function. Rapid calls are debounced and
    /// superseded calls resolve to `None`.
    pub async fn update_operation(&self, key: &str, call: WorkflowCall) -> PluginResult<Option<WorkflowResult>> {
        let op = self.running_operation(key)?;
        let Some((handler, debouncer)) = op.update else {
            return Err(PluginError::NotFound { kind: "Update function", name: key.to_string() });
        };

        let call = workflow_to_plugin(call);
        match debouncer.call(|| self.execute(key, handler, call)).await {
            None => Ok(None),
            Some(result) => Ok(plugin_to_workflow(&result.map_err(|e| attribute(&op.plugin_name, e))?)),
        }
    }

    pub fn operations(&self) -> Vec<OperationRecord> {
        self.state.lock().registry.operations().cloned().collect()
    }

    pub fn operation(&self, key: &str) -> Option<OperationRecord> {
        self.state.lock().registry.operation(key).cloned()
    }

    /// Keys of operations whose input schema accepts `data`.
    pub fn match_loaders(&self, data: &Value) -> Vec<String> {
        self.state.lock().registry.match_loaders(data)
    }

    pub fn window_types(&self) -> Vec<String> {
        self.state.lock().registry.window_types().map(str::to_string).collect()
    }

    /// Plugins registered for a file extension.
    pub fn extension_owners(&self, extension: &str) -> Vec<String> {
        self.state.lock().registry.extension_owners(extension).to_vec()
    }

    pub fn instance_state(&self, name: &str) -> Option<InstanceState> {
        self.state.lock().instances.get(name).map(PluginInstance::state)
    }

    pub fn instance_id(&self, name: &str) -> Option<String> {
        self.state.lock().instances.get(name).map(|i| i.id().to_string())
    }

    /// Names of all live instances.
    pub fn plugin_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().instances.keys().cloned().collect();
        names.sort();
        names
    }

    // ---- per-plugin settings ------------------------------------------

    /// Persist a setting for a plugin. `_field` names are read-only views of
    /// the plugin config; empty values delete the setting.
    pub async fn set_plugin_config(&self, plugin: &str, name: &str, value: Value) -> PluginResult<()> {
        let config = self.plugin_config(plugin)?;
        if let Some(field) = name.strip_prefix('_') {
            if config.field(field).is_some() {
                return Err(PluginError::ReadOnly(field.to_string()));
            }
        }

        let id = config_key(plugin, name);
        if is_empty_value(&value) {
            self.config_store.remove(&id).await?;
        } else {
            self.config_store.upsert(&id, value).await?;
        }
        Ok(())
    }

    /// Read a setting for a plugin.
    pub async fn get_plugin_config(&self, plugin: &str, name: &str) -> PluginResult<Value> {
        let config = self.plugin_config(plugin)?;
        if let Some(value) = name.strip_prefix('_').and_then(|field| config.field(field)) {
            return Ok(value);
        }
        Ok(self.config_store.get(&config_key(plugin, name)).await?.map_or(Value::Null, |doc| doc.body))
    }

    /// Named attachment of a loaded plugin.
    pub fn get_attachment(&self, plugin: &str, name: &str) -> PluginResult<Option<String>> {
        let config = self.plugin_config(plugin)?;
        Ok(config.attachment(name).map(str::to_string))
    }
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager").field("plugins", &self.plugin_names()).finish()
    }
}

impl Drop for PluginManager {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn config_key(plugin: &str, name: &str) -> String {
    format!("config_{plugin}_{name}")
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::String(s) => s.is_empty(),
        Value::Number(n) => n.as_f64() == Some(0.0),
        _ => false,
    }
}

fn superseded(plugin: &str) -> PluginError {
    PluginError::Connection { plugin: plugin.to_string(), message: "unloaded or reloaded before setup completed".to_string() }
}

/// Attribute an error raised by plugin code to the plugin.
fn attribute(plugin: &str, err: PluginError) -> PluginError {
    match err {
        PluginError::Execution { .. } => err,
        other => PluginError::execution(plugin, other.to_string()),
    }
}

/// Origin with the installed tag appended, replacing any previous tag.
fn tagged_origin(origin: &str, tag: Option<&str>) -> String {
    let Some(tag) = tag else { return origin.to_string() };

    let tagged_url = format!("{PLUGIN_EXTENSION}@");
    let base = if let Some((url, _)) = origin.split_once(&tagged_url) {
        format!("{url}{PLUGIN_EXTENSION}")
    } else if origin.starts_with("http://") || origin.starts_with("https://") {
        origin.to_string()
    } else {
        match origin.rsplit_once(':') {
            Some((repo, name)) => format!("{repo}:{}", name.split('@').next().unwrap_or(name)),
            None => origin.split('@').next().unwrap_or(origin).to_string(),
        }
    };
    format!("{base}@{tag}")
}
