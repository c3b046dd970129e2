//! # Plugrun
//!
//! Dynamic plugin runtime - resolve, validate, sandbox and dispatch plugins
//! published in remote repositories.
//!
//! A plugin is a single source document holding a JSON config, one or more
//! scripts, window templates, styles, docs and attachments. Plugrun resolves
//! plugin references against repository manifests, installs plugins and
//! their dependencies into a workspace, instantiates them through a
//! pluggable [`plugin::Sandbox`] and routes calls between plugins, workflows
//! and windows.
//!
//! ## Features
//!
//! - **Source validation**: Tag-aware config resolution and schema checks
//! - **Repositories**: GitHub shorthands, manifest URLs and checksums
//! - **Lifecycle**: One live instance per plugin, teardown before reload
//! - **Operations**: Registry of operations, window types and input loaders
//!
//! ## Quick Start
//!
//! ```bash
//! # Validate a plugin file
//! plugrun parse Threshold.imjoy.html
//!
//! # Install from a repository
//! plugrun install oeway/ImJoy-Plugins:Image-Window
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
// Allow common patterns that are intentional in this codebase
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::similar_names)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::if_not_else)]
#![allow(clippy::manual_let_else)]
#![allow(clippy::derivable_impls)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::redundant_closure_for_method_calls)]
#![allow(clippy::cast_possible_truncation)]

pub mod config;
pub mod plugin;

// Re-export commonly used types
pub use config::Config;
pub use plugin::{PluginConfig, PluginError, PluginKind, PluginManager, PluginResult};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "plugrun";
