//! Plugin source document decomposition.
//!
//! A plugin document is a flat sequence of top-level blocks:
//!
//! ```text
//! <docs>...</docs>
//! <config lang="json">{ "name": "Demo", "type": "web-worker", ... }</config>
//! <script lang="javascript" tag="stable">...</script>
//! <window>...</window>
//! <style>...</style>
//! <attachment name="sample.csv">...</attachment>
//! ```
//!
//! This module only splits the document; interpretation of the blocks lives in
//! [`super::config`].

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Kind of a top-level block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockKind {
    Config,
    Script,
    Window,
    Style,
    Link,
    Docs,
    Attachment,
}

impl BlockKind {
    const ALL: [Self; 7] = [
        Self::Config,
        Self::Script,
        Self::Window,
        Self::Style,
        Self::Link,
        Self::Docs,
        Self::Attachment,
    ];

    fn tag_name(self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Script => "script",
            Self::Window => "window",
            Self::Style => "style",
            Self::Link => "link",
            Self::Docs => "docs",
            Self::Attachment => "attachment",
        }
    }
}

/// One block of a plugin document with its attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceBlock {
    /// Block kind.
    pub kind: BlockKind,
    /// Attributes of the opening tag (`lang`, `tag`, `name`, ...).
    #[serde(default)]
    pub attrs: BTreeMap<String, String>,
    /// Raw content between the opening and closing tags.
    pub content: String,
}

impl SourceBlock {
    /// Get an attribute value.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }
}

/// All blocks of a document grouped by kind, in document order.
#[derive(Debug, Clone, Default)]
pub struct SourceSections {
    pub config: Vec<SourceBlock>,
    pub script: Vec<SourceBlock>,
    pub window: Vec<SourceBlock>,
    pub style: Vec<SourceBlock>,
    pub link: Vec<SourceBlock>,
    pub docs: Vec<SourceBlock>,
    pub attachment: Vec<SourceBlock>,
}

impl SourceSections {
    fn push(&mut self, block: SourceBlock) {
        let bucket = match block.kind {
            BlockKind::Config => &mut self.config,
            BlockKind::Script => &mut self.script,
            BlockKind::Window => &mut self.window,
            BlockKind::Style => &mut self.style,
            BlockKind::Link => &mut self.link,
            BlockKind::Docs => &mut self.docs,
            BlockKind::Attachment => &mut self.attachment,
        };
        bucket.push(block);
    }

    /// Content of the first docs block.
    pub fn docs_text(&self) -> Option<&str> {
        self.docs.first().map(|d| d.content.as_str())
    }
}

static ATTR_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"([A-Za-z_][\w:-]*)(?:\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+)))?"#)
        .expect("attribute pattern is valid")
});

/// Split a plugin document into its top-level blocks.
///
/// Unknown markup between blocks is ignored. An opening tag without a matching
/// closing tag is skipped, except void `<link>` and self-closing tags which
/// yield an empty block; scanning continues after the opening tag.
pub fn parse_sections(code: &str) -> SourceSections {
    let mut sections = SourceSections::default();
    let mut rest = code;

    while let Some(start) = rest.find('<') {
        let after = &rest[start..];

        if after.starts_with("<!--") {
            match after.find("-->") {
                Some(end) => {
                    rest = &after[end + 3..];
                    continue;
                }
                None => break,
            }
        }

        let Some(kind) = opening_kind(after) else {
            rest = &after[1..];
            continue;
        };

        let Some(open_end) = after.find('>') else { break };
        let attr_text = &after[1 + kind.tag_name().len()..open_end];
        let body = &after[open_end + 1..];

        let self_closing = attr_text.trim_end().ends_with('/');
        let closing = format!("</{}>", kind.tag_name());
        let close = if self_closing { None } else { body.find(&closing) };
        let Some(close) = close else {
            if self_closing || kind == BlockKind::Link {
                sections.push(SourceBlock { kind, attrs: parse_attrs(attr_text), content: String::new() });
            } else {
                tracing::warn!(block = kind.tag_name(), "Unterminated block in plugin source");
            }
            rest = body;
            continue;
        };

        sections.push(SourceBlock {
            kind,
            attrs: parse_attrs(attr_text),
            content: body[..close].to_string(),
        });
        rest = &body[close + closing.len()..];
    }

    sections
}

fn opening_kind(text: &str) -> Option<BlockKind> {
    BlockKind::ALL.into_iter().find(|kind| {
        let name = kind.tag_name();
        text.len() > name.len() + 1
            && text[1..].starts_with(name)
            && text[1 + name.len()..]
                .chars()
                .next()
                .is_some_and(|c| c == '>' || c.is_whitespace())
    })
}

fn parse_attrs(text: &str) -> BTreeMap<String, String> {
    ATTR_PATTERN
        .captures_iter(text.trim_end_matches('/'))
        .map(|caps| {
            let value = caps
                .get(2)
                .or_else(|| caps.get(3))
                .or_else(|| caps.get(4))
                .map(|m| m.as_str().to_string())
                .unwrap_or_default();
            (caps[1].to_string(), value)
        })
        .collect()
}
