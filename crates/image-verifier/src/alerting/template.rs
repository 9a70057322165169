use std::path::Path;

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

use super::NotificationValues;
use crate::utils::{json_escape, safe_file_name};

lazy_static! {
    static ref PLACEHOLDER_RE: Regex = Regex::new(r"\{\{[^{}]*\}\}").unwrap();
}

/// Renders a named template file by substituting `{{ field }}`
/// placeholders with the notification values. String values are
/// JSON-escaped so the rendered document stays valid JSON.
pub(crate) fn render_template(
    template_dir: &Path,
    template: &str,
    values: &NotificationValues,
) -> Result<String, String> {
    let path = safe_file_name(template_dir, &[&format!("{template}.json")])
        .map_err(|e| format!("unable to get template file: {e}"))?;
    let raw = std::fs::read_to_string(&path)
        .map_err(|e| format!("failed to read template file: {e}"))?;

    let value_map = match serde_json::to_value(values) {
        Ok(Value::Object(map)) => map,
        _ => return Err("cannot build template values".to_string()),
    };

    let rendered = PLACEHOLDER_RE.replace_all(&raw, |captures: &regex::Captures| {
        let field = captures[0]
            .trim_start_matches("{{")
            .trim_end_matches("}}")
            .trim();
        match value_map.get(field) {
            Some(Value::String(s)) => json_escape(s),
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::Bool(b)) => b.to_string(),
            _ => String::new(),
        }
    });

    Ok(rendered.into_owned())
}
