//! `{{ path }}` placeholder rendering against a run context

use crate::run::RunContext;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*([^{}\s]+)\s*\}\}").expect("placeholder pattern is valid")
});

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unresolved reference `{reference}`")]
pub struct RenderError {
    pub reference: String,
}

/// Render every string inside `value`, recursing into arrays and objects.
pub fn render_value(value: &Value, ctx: &RunContext) -> Result<Value, RenderError> {
    match value {
        Value::String(s) => render_string(s, ctx),
        Value::Array(items) => items
            .iter()
            .map(|item| render_value(item, ctx))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut rendered = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                rendered.insert(key.clone(), render_value(item, ctx)?);
            }
            Ok(Value::Object(rendered))
        }
        other => Ok(other.clone()),
    }
}

/// Render a string and always return a string
pub fn render_str(template: &str, ctx: &RunContext) -> Result<String, RenderError> {
    match render_string(template, ctx)? {
        Value::String(s) => Ok(s),
        other => Ok(other.to_string()),
    }
}

fn render_string(template: &str, ctx: &RunContext) -> Result<Value, RenderError> {
    // A lone placeholder keeps the referenced value's type
    if let Some(caps) = PLACEHOLDER.captures(template) {
        if let Some(whole) = caps.get(0) {
            if whole.start() == 0 && whole.end() == template.len() {
                return resolve(&caps[1], ctx).cloned();
            }
        }
    } else {
        return Ok(Value::String(template.to_string()));
    }

    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in PLACEHOLDER.captures_iter(template) {
        let Some(whole) = caps.get(0) else { continue };
        out.push_str(&template[last..whole.start()]);
        match resolve(&caps[1], ctx)? {
            Value::String(s) => out.push_str(s),
            other => out.push_str(&other.to_string()),
        }
        last = whole.end();
    }
    out.push_str(&template[last..]);

    Ok(Value::String(out))
}

fn resolve<'a>(reference: &str, ctx: &'a RunContext) -> Result<&'a Value, RenderError> {
    ctx.lookup(reference).ok_or_else(|| RenderError {
        reference: reference.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> RunContext {
        let input = json!({"env": "staging", "replicas": 3, "regions": ["eu", "us"]});
        let mut ctx = RunContext::new(input.as_object().cloned().unwrap());
        ctx.record_output("build", json!({"image": "app:1.2", "layers": [1, 2]}));
        ctx
    }

    #[test]
    fn test_interpolates_into_strings() {
        let ctx = context();
        assert_eq!(render_str("env:{{ env }}", &ctx).unwrap(), "env:staging");
        assert_eq!(
            render_str("deploy {{steps.build.image}} to {{ input.regions.0 }}", &ctx).unwrap(),
            "deploy app:1.2 to eu"
        );
    }

    #[test]
    fn test_single_reference_keeps_type() {
        let ctx = context();
        let rendered = render_value(
            &json!({"count": "{{ replicas }}", "layers": "{{ steps.build.layers }}", "label": "n={{ replicas }}"}),
            &ctx,
        )
        .unwrap();

        assert_eq!(rendered["count"], json!(3));
        assert_eq!(rendered["layers"], json!([1, 2]));
        assert_eq!(rendered["label"], json!("n=3"));
    }

    #[test]
    fn test_non_string_values_pass_through() {
        let ctx = context();
        let payload = json!({"flag": true, "items": [1, "{{ env }}"]});

        assert_eq!(
            render_value(&payload, &ctx).unwrap(),
            json!({"flag": true, "items": [1, "staging"]})
        );
    }

    #[test]
    fn test_unresolved_reference() {
        let ctx = context();
        let err = render_value(&json!({"x": "{{ steps.deploy.url }}"}), &ctx).unwrap_err();
        assert_eq!(err.reference, "steps.deploy.url");

        assert!(render_str("{{ missing }}-suffix", &ctx).is_err());
    }

    #[test]
    fn test_plain_strings_untouched() {
        let ctx = context();
        assert_eq!(render_str("no placeholders {here}", &ctx).unwrap(), "no placeholders {here}");
    }
}
