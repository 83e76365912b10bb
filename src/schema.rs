//! Per-entity field schemas, checked where documents enter the system.
//!
//! The reconciler trusts its input; the front-matter source and the editing
//! path call [`validate`] first. Fields not named here are accepted as-is.

use anyhow::{bail, Result};

use crate::models::{Document, EntityType, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    String,
    Bool,
    StringArray,
}

impl Kind {
    fn matches(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (Kind::String, Value::String(_))
                | (Kind::Bool, Value::Bool(_))
                | (Kind::StringArray, Value::StringArray(_))
        )
    }

    fn name(&self) -> &'static str {
        match self {
            Kind::String => "string",
            Kind::Bool => "bool",
            Kind::StringArray => "string array",
        }
    }
}

struct FieldRule {
    name: &'static str,
    kind: Kind,
    required: bool,
}

const POST_FIELDS: &[FieldRule] = &[
    FieldRule {
        name: "title",
        kind: Kind::String,
        required: true,
    },
    FieldRule {
        name: "date",
        kind: Kind::String,
        required: true,
    },
    FieldRule {
        name: "tags",
        kind: Kind::StringArray,
        required: false,
    },
    FieldRule {
        name: "draft",
        kind: Kind::Bool,
        required: false,
    },
];

const PAGE_FIELDS: &[FieldRule] = &[
    FieldRule {
        name: "title",
        kind: Kind::String,
        required: true,
    },
    FieldRule {
        name: "draft",
        kind: Kind::Bool,
        required: false,
    },
];

fn rules(entity: EntityType) -> &'static [FieldRule] {
    match entity {
        EntityType::Post => POST_FIELDS,
        EntityType::Page => PAGE_FIELDS,
    }
}

/// Slugs are lowercase ASCII alphanumerics separated by single dashes.
pub fn validate_slug(slug: &str) -> Result<()> {
    if slug.is_empty() {
        bail!("slug must not be empty");
    }
    let valid_chars = slug
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if !valid_chars || slug.starts_with('-') || slug.ends_with('-') || slug.contains("--") {
        bail!(
            "invalid slug '{}': use lowercase letters, digits, and single dashes",
            slug
        );
    }
    Ok(())
}

pub fn validate(entity: EntityType, doc: &Document) -> Result<()> {
    validate_slug(&doc.slug)?;
    for (name, value) in &doc.fields {
        if let Value::Number(n) = value {
            if !n.is_finite() {
                bail!(
                    "{} '{}': field '{}' must be a finite number",
                    entity,
                    doc.slug,
                    name
                );
            }
        }
    }
    for rule in rules(entity) {
        match doc.fields.get(rule.name) {
            Some(value) if !rule.kind.matches(value) => bail!(
                "{} '{}': field '{}' must be a {}, got {}",
                entity,
                doc.slug,
                rule.name,
                rule.kind.name(),
                value.kind()
            ),
            None if rule.required => bail!(
                "{} '{}': missing required field '{}'",
                entity,
                doc.slug,
                rule.name
            ),
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post(slug: &str) -> Document {
        Document::new(slug, "body")
            .with_field("title", "Hello")
            .with_field("date", "2024-05-01")
    }

    #[test]
    fn valid_post_passes() {
        assert!(validate(EntityType::Post, &post("hello-world")).is_ok());
    }

    #[test]
    fn missing_required_field_fails() {
        let doc = Document::new("about", "").with_field("draft", false);
        let err = validate(EntityType::Page, &doc).unwrap_err();
        assert!(err.to_string().contains("missing required field 'title'"));
    }

    #[test]
    fn wrong_type_fails() {
        let doc = post("p").with_field("tags", "rust");
        let err = validate(EntityType::Post, &doc).unwrap_err();
        assert!(err.to_string().contains("string array"), "{}", err);
    }

    #[test]
    fn unknown_fields_are_accepted() {
        let doc = post("p").with_field("reading_time", 4.0);
        assert!(validate(EntityType::Post, &doc).is_ok());
    }

    #[test]
    fn non_finite_number_fails() {
        for n in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let doc = post("p").with_field("rating", n);
            let err = validate(EntityType::Post, &doc).unwrap_err();
            assert!(err.to_string().contains("finite number"), "{}", err);
        }
    }

    #[test]
    fn slug_rules() {
        assert!(validate_slug("a-1").is_ok());
        assert!(validate_slug("").is_err());
        assert!(validate_slug("Hello").is_err());
        assert!(validate_slug("a--b").is_err());
        assert!(validate_slug("-a").is_err());
        assert!(validate_slug("a b").is_err());
    }
}
