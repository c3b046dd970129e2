//! Plugin repositories: manifest fetching and reference resolution.
//!
//! A plugin can be referenced as:
//!
//! * `owner/repo[@hashtag]:PluginName[@tag]`, looked up in the repository manifest
//! * a URL ending in `.imjoy.html`, optionally followed by `@tag`
//! * `PluginName[@tag]`, looked up in an already known list of plugins

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::manifest::{Manifest, ManifestEntry};
use super::types::{MANIFEST_FILE, PLUGIN_EXTENSION};
use super::{PluginError, PluginResult};

/// Default branch used for short `owner/repo` references.
pub const DEFAULT_BRANCH: &str = "master";

static SHORT_REPO: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[^/.]+/[^/.]+$").expect("valid pattern"));
static URL_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^https?://").expect("valid pattern"));

/// A configured plugin repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub name: String,
    /// `owner/repo`, a GitHub URL or a direct manifest URL.
    pub url: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl Repository {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self { name: name.into(), url: url.into(), description: None }
    }

    /// A repository named after its location.
    pub fn from_url(url: &str) -> Self {
        Self { name: url.to_string(), url: url.to_string(), description: Some(url.to_string()) }
    }
}

/// Repositories that are always present in the repository list.
pub fn default_repositories() -> Vec<Repository> {
    vec![
        Repository {
            name: "ImJoy Repository".to_string(),
            url: "oeway/ImJoy-Plugins".to_string(),
            description: Some("The official plugin repository provided by ImJoy.io.".to_string()),
        },
        Repository {
            name: "ImJoy Demos".to_string(),
            url: "oeway/ImJoy-Demo-Plugins".to_string(),
            description: Some("A set of demo plugins provided by ImJoy.io".to_string()),
        },
    ]
}

/// Source of HTTP content.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch a URL as text.
    async fn fetch_text(&self, url: &str) -> PluginResult<String>;
}

/// Fetcher backed by `reqwest`.
#[cfg(feature = "http")]
pub struct HttpFetcher {
    client: reqwest::Client,
}

#[cfg(feature = "http")]
impl HttpFetcher {
    /// Create a fetcher with a request timeout and user agent.
    pub fn new(timeout: std::time::Duration, user_agent: &str) -> PluginResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| PluginError::Network(e.to_string()))?;
        Ok(Self { client })
    }
}

#[cfg(feature = "http")]
#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch_text(&self, url: &str) -> PluginResult<String> {
        let response =
            self.client.get(url).send().await.map_err(|e| PluginError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(PluginError::Network(format!("Failed to fetch {url}: HTTP {}", response.status())));
        }

        response.text().await.map_err(|e| PluginError::Network(e.to_string()))
    }
}

/// A parsed plugin reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginReference {
    /// `owner/repo[@hashtag]:name[@tag]`.
    Repository { repo: String, hashtag: Option<String>, name: String, tag: Option<String> },
    /// Direct source URL.
    Url { url: String, tag: Option<String> },
    /// Name within a known plugin list.
    Scoped { name: String, tag: Option<String> },
}

impl PluginReference {
    /// Parse a reference string.
    pub fn parse(reference: &str) -> PluginResult<Self> {
        let reference = github_raw_url(reference.trim());

        if !reference.starts_with("http") && reference.contains('/') && reference.contains(':') {
            let (repo_part, plugin_part) = reference.split_once(':').unwrap_or((&reference, ""));
            let (name, tag) = split_tag(plugin_part);
            let (repo, hashtag) = split_tag(repo_part);
            if repo.is_empty() || name.is_empty() {
                return Err(PluginError::Format(format!(
                    "Wrong URI format, it must be \"REPO_NAME:PLUGIN_NAME\": {reference}"
                )));
            }
            return Ok(Self::Repository { repo, hashtag, name, tag });
        }

        if !URL_PATTERN.is_match(&reference) {
            let (name, tag) = split_tag(&reference);
            if name.is_empty() {
                return Err(PluginError::Format("empty plugin reference".to_string()));
            }
            return Ok(Self::Scoped { name, tag });
        }

        let marker = format!("{PLUGIN_EXTENSION}@");
        match reference.split_once(&marker) {
            Some((base, tag)) if !tag.is_empty() => Ok(Self::Url {
                url: format!("{base}{PLUGIN_EXTENSION}"),
                tag: Some(tag.to_string()),
            }),
            _ => Ok(Self::Url { url: reference, tag: None }),
        }
    }

    /// Requested tag, if any.
    pub fn tag(&self) -> Option<&str> {
        match self {
            Self::Repository { tag, .. } | Self::Url { tag, .. } | Self::Scoped { tag, .. } => tag.as_deref(),
        }
    }
}

fn split_tag(text: &str) -> (String, Option<String>) {
    match text.split_once('@') {
        Some((name, tag)) => {
            let tag = tag.trim();
            (name.trim().to_string(), (!tag.is_empty()).then(|| tag.to_string()))
        }
        None => (text.trim().to_string(), None),
    }
}

/// Convert a GitHub `blob` URL to its raw-content equivalent.
pub fn github_raw_url(url: &str) -> String {
    if url.contains("github.com") && url.contains("/blob/") {
        url.replacen("//github.com", "//raw.githubusercontent.com", 1).replacen("/blob/", "/", 1)
    } else {
        url.to_string()
    }
}

/// Manifest location for a GitHub repository page URL.
///
/// `https://github.com/owner/repo[/tree/branch[/dir]]` maps to
/// `https://raw.githubusercontent.com/owner/repo/<branch>/[dir/]manifest.imjoy.json`.
pub fn github_manifest_url(url: &str) -> String {
    if url.contains("/blob/") {
        return github_raw_url(url);
    }

    let path = url
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_start_matches("github.com/")
        .trim_end_matches('/');
    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() < 2 {
        return url.to_string();
    }

    let (branch, dir) = match parts.get(2..) {
        Some(["tree", branch, rest @ ..]) => (*branch, rest.join("/")),
        _ => (DEFAULT_BRANCH, String::new()),
    };
    let dir = if dir.is_empty() { String::new() } else { format!("{dir}/") };
    format!("https://raw.githubusercontent.com/{}/{}/{branch}/{dir}{MANIFEST_FILE}", parts[0], parts[1])
}

/// Manifest URL and origin prefix for a repository reference.
pub fn manifest_location(repo: &str, hashtag: Option<&str>) -> (String, String) {
    if SHORT_REPO.is_match(repo) {
        let origin = hashtag.map_or_else(|| repo.to_string(), |h| format!("{repo}@{h}"));
        let page = match hashtag {
            Some(h) => format!("https://github.com/{repo}/tree/{h}"),
            None => format!("https://github.com/{repo}"),
        };
        (github_manifest_url(&page), origin)
    } else if repo.contains("github") && repo.contains("/blob/") {
        let url = github_manifest_url(repo);
        (url.clone(), url)
    } else if repo.contains("github.com/") && !repo.ends_with(".json") {
        let url = github_manifest_url(repo);
        (url.clone(), url)
    } else {
        (repo.to_string(), repo.to_string())
    }
}

/// Verify a SHA256 checksum of fetched content.
pub fn verify_checksum(content: &str, expected: &str) -> PluginResult<()> {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    let actual = format!("{:x}", hasher.finalize());

    if !actual.eq_ignore_ascii_case(expected) {
        return Err(PluginError::Validation(format!(
            "Checksum mismatch: expected {expected}, got {actual}"
        )));
    }
    Ok(())
}

/// A fetched plugin source ready for parsing.
#[derive(Debug, Clone)]
pub struct ResolvedSource {
    /// Source location.
    pub uri: String,
    /// Tag requested by the reference.
    pub tag: Option<String>,
    /// Raw source text.
    pub code: String,
    /// Known plugins for resolving this plugin's own dependencies.
    pub scope: Vec<ManifestEntry>,
    /// Manifest origin when resolved through a repository.
    pub origin: Option<String>,
}

/// Resolves references to plugin sources, caching manifests per URL.
pub struct RepositoryResolver {
    fetcher: Arc<dyn Fetcher>,
    cache: Mutex<HashMap<String, Manifest>>,
}

impl RepositoryResolver {
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        Self { fetcher, cache: Mutex::new(HashMap::new()) }
    }

    /// Get a repository manifest, fetching it on first use.
    pub async fn manifest(&self, repo: &str, hashtag: Option<&str>) -> PluginResult<Manifest> {
        let (url, _) = manifest_location(repo, hashtag);
        if let Some(cached) = self.cache.lock().get(&url) {
            return Ok(cached.clone());
        }
        self.refresh(repo, hashtag).await
    }

    /// Fetch a repository manifest, replacing any cached copy.
    pub async fn refresh(&self, repo: &str, hashtag: Option<&str>) -> PluginResult<Manifest> {
        let (url, origin) = manifest_location(repo, hashtag);
        tracing::debug!(repository = %repo, url = %url, "Fetching repository manifest");

        let body = self.fetcher.fetch_text(&url).await?;
        let manifest = Manifest::from_json(&url, &body)?.normalize(&url, &origin);

        self.cache.lock().insert(url, manifest.clone());
        Ok(manifest)
    }

    /// Drop all cached manifests.
    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }

    /// Resolve a reference and fetch the plugin source.
    ///
    /// `scope` is the list of known plugins used for bare `Name@tag` references.
    pub async fn fetch_source(&self, reference: &str, scope: &[ManifestEntry]) -> PluginResult<ResolvedSource> {
        let parsed = PluginReference::parse(reference)?;
        let tag = parsed.tag().map(str::to_string);

        let (entry, scope) = match parsed {
            PluginReference::Repository { repo, hashtag, name, .. } => {
                let manifest = self.manifest(&repo, hashtag.as_deref()).await?;
                let entry = manifest.find(&name).cloned().ok_or_else(|| PluginError::NotFound {
                    kind: "Plugin",
                    name: format!("{repo}:{name}"),
                })?;
                (entry, manifest.plugins)
            }
            PluginReference::Scoped { name, .. } => {
                let entry = scope.iter().find(|p| p.name == name).cloned().ok_or_else(|| {
                    PluginError::NotFound { kind: "Plugin", name: format!("\"{name}\" in the repository") }
                })?;
                (entry, scope.to_vec())
            }
            PluginReference::Url { url, .. } => {
                let mut entry = ManifestEntry::new("");
                entry.uri = Some(url);
                (entry, scope.to_vec())
            }
        };

        let uri = entry.source_uri().to_string();
        let path = uri.split('?').next().unwrap_or(&uri);
        if !path.ends_with(PLUGIN_EXTENSION) {
            return Err(PluginError::Format(format!("Plugin url must end with \"{PLUGIN_EXTENSION}\": {uri}")));
        }

        let code = self.fetcher.fetch_text(&uri).await?;
        if code.trim().is_empty() {
            return Err(PluginError::Network(format!("Failed to get plugin code from {uri}")));
        }
        if let Some(ref expected) = entry.sha256 {
            verify_checksum(&code, expected)?;
        }

        Ok(ResolvedSource { uri, tag, code, scope, origin: entry.origin })
    }
}
