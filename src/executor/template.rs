//! Command template rendering.
//!
//! A template names payload fields as `<key>` placeholders:
//! `python run.py --strategy <strategy> --date <date>`.

use serde_json::{Map, Value};

/// A template with its placeholders substituted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedCommand {
    pub command: String,
    /// Placeholders that had no payload field, left in the command literally.
    pub unresolved: Vec<String>,
}

/// Substitute every `<key>` whose key is a payload field.
///
/// Strings are inserted raw, other values as their JSON text. The template
/// is scanned once, so substituted values are never re-expanded.
/// Placeholders without a field stay as written.
pub fn render_command(template: &str, payload: &Map<String, Value>) -> RenderedCommand {
    let mut command = String::with_capacity(template.len());
    let mut unresolved = Vec::new();
    let mut rest = template;

    while let Some(start) = rest.find('<') {
        command.push_str(&rest[..start]);
        let after = &rest[start + 1..];

        match after.find(['<', '>']) {
            Some(end) if after[end..].starts_with('>') => {
                let name = &after[..end];
                match payload.get(name) {
                    Some(value) => command.push_str(&value_text(value)),
                    None => {
                        if is_placeholder(name) && !unresolved.iter().any(|u| u == name) {
                            unresolved.push(name.to_string());
                        }
                        command.push('<');
                        command.push_str(name);
                        command.push('>');
                    }
                }
                rest = &after[end + 1..];
            }
            _ => {
                command.push('<');
                rest = after;
            }
        }
    }
    command.push_str(rest);

    RenderedCommand {
        command,
        unresolved,
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Shell redirections like `cat < in > out` are not placeholders.
fn is_placeholder(name: &str) -> bool {
    !name.is_empty() && !name.chars().any(char::is_whitespace)
}
