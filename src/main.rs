//! Plugrun - dynamic plugin runtime.
//!
//! Resolves plugins from remote repositories, validates and installs them
//! into a workspace, and manages repository and workspace lists.

#![allow(clippy::single_match_else)]

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use plugrun::plugin::{
    parse_plugin_source, FileStoreProvider, HttpFetcher, PluginConfig, PluginManager, PluginReference,
    Repository, RepositoryResolver, SourceContext, UnavailableSandbox,
};
use plugrun::Config;

/// Dynamic plugin runtime
#[derive(Parser)]
#[command(name = "plugrun")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Workspace to operate on (defaults to the selected one)
    #[arg(short, long, global = true)]
    workspace: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse and validate a local plugin source file
    Parse {
        /// Path to the plugin source
        path: PathBuf,

        /// Variant tag to select
        #[arg(short, long)]
        tag: Option<String>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Resolve a plugin reference and validate its source without installing
    Resolve {
        /// `owner/repo:Name[@tag]`, a source URL, or `Name[@tag]`
        reference: String,
    },

    /// Install a plugin and its dependencies
    Install {
        /// `owner/repo:Name[@tag]`, a source URL, or `Name[@tag]`
        reference: String,

        /// Variant tag to install
        #[arg(short, long)]
        tag: Option<String>,
    },

    /// List installed plugins
    List {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Remove an installed plugin
    Remove {
        /// Plugin name
        name: String,
    },

    /// Manage plugin repositories
    Repo {
        #[command(subcommand)]
        operation: RepoOperation,
    },

    /// Manage workspaces
    Workspace {
        #[command(subcommand)]
        operation: WorkspaceOperation,
    },

    /// Show configuration
    Config {
        /// Show config file path
        #[arg(long)]
        path: bool,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum RepoOperation {
    /// List configured repositories
    List,

    /// Add a repository (`owner/repo`, GitHub URL or manifest URL)
    Add { url: String },

    /// Remove a repository by url or name
    Remove { key: String },

    /// Show the plugins a repository offers
    Show {
        /// Repository url or name
        repo: String,

        /// Only show plugins matching this query
        #[arg(short, long)]
        query: Option<String>,
    },
}

#[derive(Subcommand)]
enum WorkspaceOperation {
    /// List workspaces
    List,

    /// Select (and create if needed) a workspace
    Select { name: String },

    /// Remove a workspace from the list
    Remove { name: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.verbose { EnvFilter::new("debug") } else { EnvFilter::new("warn") };

    tracing_subscriber::registry().with(fmt::layer().with_target(false)).with(filter).init();

    let workspace = cli.workspace.as_deref();
    match cli.command {
        Commands::Parse { path, tag, format } => cmd_parse(&path, tag.as_deref(), &format),
        Commands::Resolve { reference } => cmd_resolve(&reference),
        Commands::Install { reference, tag } => cmd_install(&reference, tag.as_deref(), workspace),
        Commands::List { format } => cmd_list(&format, workspace),
        Commands::Remove { name } => cmd_remove(&name, workspace),
        Commands::Repo { operation } => cmd_repo(operation),
        Commands::Workspace { operation } => cmd_workspace(operation),
        Commands::Config { path } => cmd_config(path),
        Commands::Completions { shell } => {
            cmd_completions(shell);
            Ok(())
        }
    }
}

fn open_manager(config: &Config) -> Result<Arc<PluginManager>> {
    let fetcher = HttpFetcher::new(config.http_timeout(), &config.http.user_agent)?;
    let stores = FileStoreProvider::new(config.data_dir()?);

    let manager = PluginManager::builder(Arc::new(UnavailableSandbox), Arc::new(fetcher), Arc::new(stores))
        .options(config.manager_options())
        .build()?;
    Ok(manager)
}

/// Open the manager with repository and workspace lists loaded.
async fn open_workspace(config: &Config, workspace: Option<&str>) -> Result<Arc<PluginManager>> {
    let manager = open_manager(config)?;
    manager.load_repository_list().await?;
    manager.load_workspace_list().await?;
    manager.load_workspace(workspace).await?;
    manager.load_records().await?;
    Ok(manager)
}

fn print_plugin(plugin: &PluginConfig) {
    let version = plugin.version.as_deref().unwrap_or("-");
    let tag = plugin.tag.as_deref().map(|t| format!(" @{t}")).unwrap_or_default();
    println!("  {} v{}{} [{}]", plugin.name, version, tag, plugin.kind.display_name());
    if let Some(ref desc) = plugin.description {
        println!("      {desc}");
    }
}

fn cmd_parse(path: &Path, tag: Option<&str>, format: &str) -> Result<()> {
    let code = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {e}", path.display()))?;
    let ctx = SourceContext {
        uri: Some(path.display().to_string()),
        tag: tag.map(str::to_string),
        origin: None,
    };
    let plugin = parse_plugin_source(&code, &ctx)?;

    match format {
        "json" => {
            let mut value = plugin.to_value()?;
            if let Some(map) = value.as_object_mut() {
                map.remove("code");
            }
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        _ => {
            println!("✓ {} is valid\n", path.display());
            print_plugin(&plugin);
            if !plugin.tags.is_empty() {
                println!("      tags: {}", plugin.tags.join(", "));
            }
            if !plugin.dependencies.is_empty() {
                println!("      dependencies: {}", plugin.dependencies.join(", "));
            }
        }
    }
    Ok(())
}

fn cmd_resolve(reference: &str) -> Result<()> {
    let config = Config::load()?;
    let fetcher = HttpFetcher::new(config.http_timeout(), &config.http.user_agent)?;
    let resolver = RepositoryResolver::new(Arc::new(fetcher));

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        if let PluginReference::Scoped { .. } = PluginReference::parse(reference)? {
            anyhow::bail!("Bare plugin names need a repository: use owner/repo:{reference}");
        }

        let source = resolver.fetch_source(reference, &[]).await?;
        let plugin = parse_plugin_source(
            &source.code,
            &SourceContext { uri: Some(source.uri.clone()), tag: source.tag.clone(), origin: source.origin.clone() },
        )?;

        println!("Resolved {reference}\n");
        print_plugin(&plugin);
        println!("      source: {}", source.uri);
        if let Some(ref origin) = source.origin {
            println!("      origin: {origin}");
        }
        Ok(())
    })
}

fn cmd_install(reference: &str, tag: Option<&str>, workspace: Option<&str>) -> Result<()> {
    let config = Config::load()?;
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async {
        let manager = open_workspace(&config, workspace).await?;

        // Bare names are looked up in the first repository.
        if let PluginReference::Scoped { .. } = PluginReference::parse(reference)? {
            let repo = manager
                .repositories()
                .into_iter()
                .next()
                .ok_or_else(|| anyhow::anyhow!("No repository configured"))?;
            manager.reload_repository(&repo).await?;
        }

        println!("Installing {reference}...");
        let plugin = manager.install_plugin(reference, tag).await?;
        println!("✓ Installed {} into workspace {}", plugin.name, manager.selected_workspace().unwrap_or_default());
        if !plugin.dependencies.is_empty() {
            println!("  dependencies: {}", plugin.dependencies.join(", "));
        }
        Ok(())
    })
}

fn cmd_list(format: &str, workspace: Option<&str>) -> Result<()> {
    let config = Config::load()?;
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async {
        let manager = open_workspace(&config, workspace).await?;
        let mut plugins = manager.installed_plugins();
        plugins.sort_by(|a, b| a.name.cmp(&b.name));

        match format {
            "json" => {
                let summary: Vec<_> = plugins
                    .iter()
                    .map(|p| {
                        serde_json::json!({
                            "name": p.name,
                            "type": p.kind,
                            "version": p.version,
                            "tag": p.tag,
                            "origin": p.origin,
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&summary)?);
            }
            _ => {
                let workspace = manager.selected_workspace().unwrap_or_default();
                if plugins.is_empty() {
                    println!("No plugins installed in workspace {workspace}.");
                    println!("\nInstall plugins with:");
                    println!("  plugrun install owner/repo:PluginName");
                } else {
                    println!("Installed plugins ({workspace}):\n");
                    for plugin in &plugins {
                        print_plugin(plugin);
                    }
                    println!("\nTotal: {} plugin(s)", plugins.len());
                }
                let workflows = manager.workflows();
                if !workflows.is_empty() {
                    println!("\nWorkflows:");
                    for workflow in workflows {
                        println!("  {}", workflow.name);
                    }
                }
            }
        }
        Ok(())
    })
}

fn cmd_remove(name: &str, workspace: Option<&str>) -> Result<()> {
    let config = Config::load()?;
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async {
        let manager = open_workspace(&config, workspace).await?;
        if !manager.installed_plugins().iter().any(|p| p.name == name) {
            anyhow::bail!("Plugin '{name}' is not installed");
        }
        manager.remove_plugin(name).await?;
        println!("✓ Removed {name}");
        Ok(())
    })
}

fn cmd_repo(operation: RepoOperation) -> Result<()> {
    let config = Config::load()?;
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async {
        let manager = open_manager(&config)?;
        let repositories = manager.load_repository_list().await?;

        match operation {
            RepoOperation::List => {
                println!("Repositories:\n");
                for repo in &repositories {
                    println!("  {} ({})", repo.name, repo.url);
                    if let Some(ref desc) = repo.description {
                        println!("      {desc}");
                    }
                }
            }
            RepoOperation::Add { url } => {
                let repo = manager.add_repository(Repository::from_url(&url)).await?;
                println!("✓ Added repository {} ({})", repo.name, repo.url);
            }
            RepoOperation::Remove { key } => {
                if manager.remove_repository(&key).await? {
                    println!("✓ Removed repository {key}");
                } else {
                    anyhow::bail!("Repository '{key}' not found");
                }
            }
            RepoOperation::Show { repo, query } => {
                let repo = repositories
                    .into_iter()
                    .find(|r| r.url == repo || r.name == repo)
                    .unwrap_or_else(|| Repository::from_url(&repo));
                let manifest = manager.reload_repository(&repo).await?;

                let entries = match query {
                    Some(ref q) => manifest.search(q),
                    None => manifest.plugins.iter().collect(),
                };
                println!("{} - {} plugin(s):\n", manifest.name.as_deref().unwrap_or(&repo.name), entries.len());
                for entry in entries {
                    let version = entry.version.as_deref().unwrap_or("-");
                    println!("  {} v{}", entry.name, version);
                    if let Some(ref desc) = entry.description {
                        println!("      {desc}");
                    }
                }
            }
        }
        Ok(())
    })
}

fn cmd_workspace(operation: WorkspaceOperation) -> Result<()> {
    let config = Config::load()?;
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async {
        let manager = open_manager(&config)?;
        let workspaces = manager.load_workspace_list().await?;

        match operation {
            WorkspaceOperation::List => {
                let selected = manager.selected_workspace();
                for name in &workspaces {
                    let marker = if selected.as_deref() == Some(name.as_str()) { "*" } else { " " };
                    println!("{marker} {name}");
                }
            }
            WorkspaceOperation::Select { name } => {
                let created = !workspaces.contains(&name);
                manager.load_workspace(Some(&name)).await?;
                if created {
                    println!("✓ Created workspace {name}");
                } else {
                    println!("✓ Selected workspace {name}");
                }
            }
            WorkspaceOperation::Remove { name } => {
                if manager.remove_workspace(&name).await? {
                    println!("✓ Removed workspace {name}");
                } else {
                    anyhow::bail!("Workspace '{name}' not found");
                }
            }
        }
        Ok(())
    })
}

fn cmd_config(show_path: bool) -> Result<()> {
    if show_path {
        if let Some(path) = Config::config_dir() {
            println!("{}", path.display());
        }
        return Ok(());
    }

    let config = Config::load()?;
    let toml = toml::to_string_pretty(&config)?;
    println!("{toml}");

    Ok(())
}

fn cmd_completions(shell: Shell) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, "plugrun", &mut io::stdout());
}
