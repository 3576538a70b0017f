//! Per-node configuration rendering.
//!
//! Strategies render templates such as genesis files through a
//! `ConfigRenderer`. The bundled `TemplateRenderer` substitutes `{{key}}` and
//! `{{a.b.c}}` placeholders from a JSON context.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value;

use crate::error::{BuildError, Result};

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.]+)\s*\}\}").expect("valid placeholder regex"));

pub trait ConfigRenderer: Send + Sync {
    fn render(&self, template: &str, context: &Value) -> Result<Vec<u8>>;
}

/// `{{key}}` substitution over a JSON context.
///
/// Strings are inserted verbatim; every other value is inserted as compact
/// JSON. A placeholder with no matching key is an error.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateRenderer;

impl ConfigRenderer for TemplateRenderer {
    fn render(&self, template: &str, context: &Value) -> Result<Vec<u8>> {
        let mut missing = None;
        let rendered = PLACEHOLDER.replace_all(template, |caps: &Captures| {
            match lookup(context, &caps[1]) {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => {
                    missing.get_or_insert_with(|| caps[1].to_string());
                    String::new()
                }
            }
        });
        if let Some(key) = missing {
            let err = BuildError::Render(format!("no value for placeholder '{}'", key));
            log::error!("{}", err);
            return Err(err);
        }
        Ok(rendered.into_owned().into_bytes())
    }
}

fn lookup<'v>(context: &'v Value, path: &str) -> Option<&'v Value> {
    path.split('.').try_fold(context, |v, part| v.get(part))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_renders_nested_keys() {
        let ctx = json!({"chain": {"id": 61, "name": "classic"}, "alloc": {"ab": {"balance": "1"}}});
        let out = TemplateRenderer
            .render(r#"{"name": "{{chain.name}}", "id": {{ chain.id }}, "alloc": {{alloc}}}"#, &ctx)
            .unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            r#"{"name": "classic", "id": 61, "alloc": {"ab":{"balance":"1"}}}"#
        );
    }

    #[test]
    fn test_missing_key_is_an_error() {
        let err = TemplateRenderer.render("{{nope}}", &json!({})).unwrap_err();
        assert!(matches!(err, BuildError::Render(msg) if msg.contains("nope")));
    }
}
