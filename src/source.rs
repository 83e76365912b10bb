//! Front-matter document source.
//!
//! Walks `<content.root>/<collection>/` for markdown files, splits the YAML
//! front-matter from the body, and produces the incoming batch for one entity
//! type. Files that fail to parse or validate are reported in
//! [`IncomingBatch::rejected`] rather than failing the whole scan.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::ContentConfig;
use crate::models::{Document, EntityType, Fields, Value};
use crate::schema;

/// A file that could not be turned into a document.
#[derive(Debug, Clone)]
pub struct Rejected {
    pub path: PathBuf,
    pub reason: String,
}

/// Documents loaded for one entity type.
#[derive(Debug, Clone, Default)]
pub struct IncomingBatch {
    pub documents: Vec<Document>,
    pub rejected: Vec<Rejected>,
}

/// Yields the incoming document batch for an entity type.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn load(&self, entity: EntityType) -> Result<IncomingBatch>;
}

/// Source reading markdown files with front-matter from a directory tree.
pub struct MarkdownDirSource {
    config: ContentConfig,
}

impl MarkdownDirSource {
    pub fn new(config: ContentConfig) -> Self {
        Self { config }
    }

    fn scan(&self, entity: EntityType) -> Result<IncomingBatch> {
        let root = self.config.root.join(entity.collection());
        if !self.config.root.exists() {
            bail!("Content root does not exist: {}", self.config.root.display());
        }
        // A missing collection directory is an empty collection, not an error.
        if !root.exists() {
            return Ok(IncomingBatch::default());
        }

        let include_set = build_globset(&self.config.include_globs)?;
        let mut default_excludes = vec!["**/.git/**".to_string(), "**/_*".to_string()];
        default_excludes.extend(self.config.exclude_globs.clone());
        let exclude_set = build_globset(&default_excludes)?;

        let mut paths = Vec::new();
        let walker = WalkDir::new(&root).follow_links(self.config.follow_symlinks);
        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let relative = path.strip_prefix(&root).unwrap_or(path);
            let rel_str = relative.to_string_lossy().to_string();

            if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
                continue;
            }
            paths.push(path.to_path_buf());
        }

        // Sort for deterministic ordering
        paths.sort();

        let mut batch = IncomingBatch::default();
        for path in paths {
            match read_document(entity, &path) {
                Ok(doc) => batch.documents.push(doc),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "rejected content file");
                    batch.rejected.push(Rejected {
                        path,
                        reason: format!("{:#}", e),
                    });
                }
            }
        }
        Ok(batch)
    }
}

#[async_trait]
impl DocumentSource for MarkdownDirSource {
    async fn load(&self, entity: EntityType) -> Result<IncomingBatch> {
        let source = MarkdownDirSource::new(self.config.clone());
        tokio::task::spawn_blocking(move || source.scan(entity)).await?
    }
}

fn read_document(entity: EntityType, path: &Path) -> Result<Document> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let (front_matter, body) = split_front_matter(&raw);

    let mut fields = match front_matter {
        Some(yaml) => parse_front_matter(yaml)?,
        None => Fields::new(),
    };

    let slug = match fields.remove("slug") {
        Some(Value::String(s)) => s,
        Some(other) => bail!("field 'slug' must be a string, got {}", other.kind()),
        None => path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default(),
    };

    let doc = Document {
        slug,
        content: body.to_string(),
        fields,
        embedding: None,
        last_synced_at: None,
    };
    schema::validate(entity, &doc)?;
    Ok(doc)
}

/// Splits `---`-delimited front-matter from the body. Returns `None` for the
/// front-matter when the file does not open with a delimiter line.
pub fn split_front_matter(raw: &str) -> (Option<&str>, &str) {
    let raw = raw.strip_prefix('\u{feff}').unwrap_or(raw);
    let Some(rest) = raw
        .strip_prefix("---\n")
        .or_else(|| raw.strip_prefix("---\r\n"))
    else {
        return (None, raw);
    };

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed == "---" || trimmed == "..." {
            let yaml = &rest[..offset];
            let body = &rest[offset + line.len()..];
            return (Some(yaml), body.trim_start_matches(['\r', '\n']));
        }
        offset += line.len();
    }
    (None, raw)
}

fn parse_front_matter(yaml: &str) -> Result<Fields> {
    if yaml.trim().is_empty() {
        return Ok(Fields::new());
    }
    let mapping: serde_yaml::Mapping =
        serde_yaml::from_str(yaml).context("malformed front-matter")?;

    let mut fields = Fields::new();
    for (key, value) in mapping {
        let key = match key {
            serde_yaml::Value::String(k) => k,
            other => bail!("front-matter key must be a string, got {:?}", other),
        };
        if let Some(value) = convert_yaml(&key, value)? {
            fields.insert(key, value);
        }
    }
    Ok(fields)
}

fn convert_yaml(key: &str, value: serde_yaml::Value) -> Result<Option<Value>> {
    use serde_yaml::Value as Y;

    Ok(match value {
        Y::Null => None,
        Y::Bool(b) => Some(Value::Bool(b)),
        Y::Number(n) => match n.as_f64() {
            Some(f) if f.is_finite() => Some(Value::Number(f)),
            Some(_) => bail!("field '{}': number must be finite", key),
            None => bail!("field '{}': number out of range", key),
        },
        Y::String(s) => Some(Value::String(s)),
        Y::Sequence(items) => {
            let mut strings = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Y::String(s) => strings.push(s),
                    Y::Number(n) => strings.push(n.to_string()),
                    Y::Bool(b) => strings.push(b.to_string()),
                    _ => bail!("field '{}': lists may only hold scalar values", key),
                }
            }
            Some(Value::StringArray(strings))
        }
        Y::Mapping(_) | Y::Tagged(_) => {
            bail!("field '{}': nested values are not supported", key)
        }
    })
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
