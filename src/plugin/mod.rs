//! Plugin runtime.
//!
//! Plugins are single-file HTML-like documents published in remote
//! repositories. This module resolves and fetches plugin sources, validates
//! them, installs their dependencies, instantiates them in isolated
//! sandboxes and dispatches calls between plugins, workflows and windows.
//!
//! # Architecture
//!
//! - [`source`] and [`config`] turn raw source text into a validated
//!   [`PluginConfig`].
//! - [`repository`] and [`manifest`] resolve references against repository
//!   manifests and fetch sources.
//! - [`manager`] owns installed plugins, live instances and the operation
//!   [`registry`].
//! - [`sandbox`] and [`host`] are the transport seams: how plugin code is
//!   started and how it calls back into the runtime.
//! - [`adapter`] converts between the workflow and plugin calling
//!   conventions.
//!
//! # Plugin source
//!
//! ```text
//! <config lang="json">{"name": "Threshold", "type": "web-worker"}</config>
//! <script lang="javascript">api.export({setup() {}, run(ctx) {}})</script>
//! ```

pub mod adapter;
pub mod config;
pub mod debounce;
mod error;
pub mod host;
pub mod manager;
pub mod manifest;
pub mod registry;
pub mod repository;
pub mod runtime;
pub mod sandbox;
pub mod schema;
pub mod source;
pub mod store;
mod types;

pub use adapter::{WorkflowCall, WorkflowResult};
pub use config::{parse_plugin_source, Execution, PluginConfig, SourceContext};
pub use error::{PluginError, PluginResult, ENGINE_UNAVAILABLE};
pub use host::{HostApi, HostExtensions, HostFunction};
pub use manager::{ManagerOptions, PluginHandle, PluginManager, PluginManagerBuilder, RuntimeEvent};
pub use manifest::{Manifest, ManifestEntry};
pub use repository::{Fetcher, PluginReference, Repository, RepositoryResolver};
pub use runtime::{InstanceState, PluginInstance};
pub use sandbox::{PluginConnection, Sandbox, SandboxSpec, UnavailableSandbox, WindowConfig, WindowSurface};
pub use store::{DocumentStore, FileStoreProvider, MemoryStoreProvider, StoreProvider};
pub use types::{slug, PluginKind, MANIFEST_FILE, PLUGIN_API_VERSION, PLUGIN_EXTENSION};

#[cfg(feature = "http")]
pub use repository::HttpFetcher;
