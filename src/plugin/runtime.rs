//! Live plugin instances.
//!
//! An instance binds one plugin configuration to one sandbox connection and
//! tracks where it is in its lifecycle:
//!
//! ```text
//! Connecting -> Ready -> Running -> Terminated
//!      |          |         |
//!      +----------+---------+----> Failed
//! ```

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use super::config::PluginConfig;
use super::sandbox::PluginConnection;
use super::types::instance_id;
use super::PluginKind;

/// Lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    /// Sandbox handshake in progress.
    Connecting,
    /// Connected, setup not finished.
    Ready,
    /// Setup finished; calls are accepted.
    Running,
    /// Stopped by unload.
    Terminated,
    /// Connection or setup failed.
    Failed,
}

impl InstanceState {
    /// Whether moving to `next` is a valid transition.
    pub fn can_transition(self, next: Self) -> bool {
        use InstanceState::{Connecting, Failed, Ready, Running, Terminated};
        matches!(
            (self, next),
            (Connecting, Ready | Failed | Terminated)
                | (Ready, Running | Failed | Terminated)
                | (Running, Failed | Terminated)
        )
    }

    /// Whether the state is final.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Failed)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A plugin instance owned by the runtime.
pub struct PluginInstance {
    id: String,
    config: PluginConfig,
    state: InstanceState,
    connection: Option<Arc<dyn PluginConnection>>,
    error: Option<String>,
}

impl PluginInstance {
    /// New instance waiting for its sandbox connection.
    pub fn connecting(config: PluginConfig) -> Self {
        Self { id: instance_id(&config.name), config, state: InstanceState::Connecting, connection: None, error: None }
    }

    /// Window plugins have no sandbox of their own until a window is created.
    pub fn window(config: PluginConfig) -> Self {
        Self { id: instance_id(&config.name), config, state: InstanceState::Running, connection: None, error: None }
    }

    /// Instance with a fixed id (used for window instances).
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn kind(&self) -> PluginKind {
        self.config.kind
    }

    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == InstanceState::Running
    }

    /// Last failure message.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn connection(&self) -> Option<&Arc<dyn PluginConnection>> {
        self.connection.as_ref()
    }

    /// Names exported by the connected plugin.
    pub fn api_names(&self) -> Vec<String> {
        self.connection.as_ref().map(|c| c.api_names()).unwrap_or_default()
    }

    fn transition(&mut self, next: InstanceState) -> bool {
        if !self.state.can_transition(next) {
            tracing::debug!(plugin = %self.name(), from = %self.state, to = %next, "Ignoring invalid transition");
            return false;
        }
        self.state = next;
        true
    }

    /// Connection established.
    pub fn attach(&mut self, connection: Arc<dyn PluginConnection>) -> bool {
        if self.transition(InstanceState::Ready) {
            self.connection = Some(connection);
            true
        } else {
            false
        }
    }

    /// Setup finished.
    pub fn mark_running(&mut self) -> bool {
        self.transition(InstanceState::Running)
    }

    /// Record a failure and release the connection.
    pub fn fail(&mut self, message: impl Into<String>) -> Option<Arc<dyn PluginConnection>> {
        self.error = Some(message.into());
        self.transition(InstanceState::Failed);
        self.connection.take()
    }

    /// Mark terminated and hand back the connection for the caller to stop.
    pub fn shutdown(&mut self) -> Option<Arc<dyn PluginConnection>> {
        self.transition(InstanceState::Terminated);
        self.connection.take()
    }

    /// Terminate the connection; failures are logged, never returned.
    pub fn terminate(&mut self) {
        if let Some(connection) = self.shutdown() {
            terminate_connection(self.name(), connection.as_ref());
        }
    }
}

impl fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginInstance")
            .field("id", &self.id)
            .field("name", &self.config.name)
            .field("kind", &self.config.kind)
            .field("state", &self.state)
            .field("connected", &self.connection.is_some())
            .finish()
    }
}

/// Best-effort termination of a connection.
pub fn terminate_connection(plugin: &str, connection: &dyn PluginConnection) {
    if let Err(e) = connection.terminate() {
        tracing::warn!(plugin = %plugin, error = %e, "Failed to terminate plugin");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::config::{parse_plugin_source, SourceContext};
    use crate::plugin::{PluginError, PluginResult};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingConnection {
        terminated: AtomicUsize,
    }

    #[async_trait]
    impl PluginConnection for CountingConnection {
        fn api_names(&self) -> Vec<String> {
            vec!["setup".into(), "run".into()]
        }

        async fn call(&self, _function: &str, _args: Vec<Value>) -> PluginResult<Value> {
            Ok(Value::Null)
        }

        fn terminate(&self) -> PluginResult<()> {
            self.terminated.fetch_add(1, Ordering::SeqCst);
            Err(PluginError::Connection { plugin: "p".into(), message: "already gone".into() })
        }
    }

    fn config() -> PluginConfig {
        parse_plugin_source(
            r#"<config>{"name": "Worker", "type": "web-worker"}</config><script lang="javascript"></script>"#,
            &SourceContext::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_state_transitions() {
        assert!(InstanceState::Connecting.can_transition(InstanceState::Ready));
        assert!(InstanceState::Ready.can_transition(InstanceState::Running));
        assert!(InstanceState::Running.can_transition(InstanceState::Failed));
        assert!(!InstanceState::Connecting.can_transition(InstanceState::Running));
        assert!(!InstanceState::Terminated.can_transition(InstanceState::Running));
        assert!(InstanceState::Failed.is_terminal());
    }

    #[test]
    fn test_instance_lifecycle() {
        let connection = Arc::new(CountingConnection { terminated: AtomicUsize::new(0) });
        let mut instance = PluginInstance::connecting(config());

        assert_eq!(instance.state(), InstanceState::Connecting);
        assert!(!instance.mark_running());

        assert!(instance.attach(connection.clone()));
        assert_eq!(instance.api_names(), vec!["setup", "run"]);
        assert!(instance.mark_running());
        assert!(instance.is_running());

        // Termination errors are swallowed.
        instance.terminate();
        instance.terminate();
        assert_eq!(instance.state(), InstanceState::Terminated);
        assert_eq!(connection.terminated.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failure_releases_connection() {
        let connection = Arc::new(CountingConnection { terminated: AtomicUsize::new(0) });
        let mut instance = PluginInstance::connecting(config());
        instance.attach(connection);

        let released = instance.fail("setup exploded");
        assert!(released.is_some());
        assert_eq!(instance.state(), InstanceState::Failed);
        assert_eq!(instance.error(), Some("setup exploded"));
        assert!(instance.connection().is_none());
    }

    #[test]
    fn test_window_instance_is_running() {
        let mut cfg = config();
        cfg.kind = PluginKind::Window;
        let instance = PluginInstance::window(cfg);
        assert!(instance.is_running());
        assert!(instance.id().starts_with("Worker_"));
    }
}
