// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! `{{variable}}` substitution and dot-path lookup.

use std::collections::HashMap;

use serde_json::Value;

use crate::utils::helpers::value_to_text;

/// Walk a dot path (`data.items.0.name`) into a JSON value.
///
/// A leading `$.` is accepted and ignored. Numeric segments index arrays.
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.strip_prefix("$.").unwrap_or(path);
    if path.is_empty() || path == "$" {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Resolve a variable reference, allowing `customer.name` to reach into an
/// object-valued variable.
pub fn lookup_variable<'a>(variables: &'a HashMap<String, Value>, name: &str) -> Option<&'a Value> {
    if let Some(value) = variables.get(name) {
        return Some(value);
    }
    let (head, rest) = name.split_once('.')?;
    lookup_path(variables.get(head)?, rest)
}

/// Replace every `{{name}}` in `template` with the variable's text form.
///
/// Unresolved tokens and an unterminated `{{` are kept verbatim.
pub fn interpolate(template: &str, variables: &HashMap<String, Value>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let Some(close) = after.find("}}") else {
            out.push_str(&rest[open..]);
            return out;
        };
        let name = after[..close].trim();
        match lookup_variable(variables, name) {
            Some(value) => out.push_str(&value_to_text(value)),
            None => out.push_str(&rest[open..open + 2 + close + 2]),
        }
        rest = &after[close + 2..];
    }
    out.push_str(rest);
    out
}

/// Interpolate every string leaf of a JSON template.
pub fn interpolate_value(template: &Value, variables: &HashMap<String, Value>) -> Value {
    match template {
        Value::String(s) => Value::String(interpolate(s, variables)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| interpolate_value(item, variables))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), interpolate_value(v, variables)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars() -> HashMap<String, Value> {
        HashMap::from([
            ("name".to_string(), json!("Alice")),
            ("count".to_string(), json!(3)),
            ("customer".to_string(), json!({"tier": "gold", "orders": [{"id": 7}]})),
        ])
    }

    #[test]
    fn test_interpolate_basic() {
        assert_eq!(
            interpolate("Hi {{name}}, you have {{ count }} items", &vars()),
            "Hi Alice, you have 3 items"
        );
    }

    #[test]
    fn test_interpolate_missing_and_unterminated() {
        assert_eq!(interpolate("Hi {{nobody}}!", &vars()), "Hi {{nobody}}!");
        assert_eq!(interpolate("Hi {{name", &vars()), "Hi {{name");
        assert_eq!(interpolate("no tokens", &vars()), "no tokens");
    }

    #[test]
    fn test_interpolate_nested_path() {
        assert_eq!(
            interpolate("{{customer.tier}} #{{customer.orders.0.id}}", &vars()),
            "gold #7"
        );
    }

    #[test]
    fn test_lookup_path() {
        let v = json!({"data": {"items": [{"name": "x"}]}});
        assert_eq!(lookup_path(&v, "data.items.0.name"), Some(&json!("x")));
        assert_eq!(lookup_path(&v, "$.data.items.0.name"), Some(&json!("x")));
        assert_eq!(lookup_path(&v, "data.missing"), None);
        assert_eq!(lookup_path(&v, "data.items.nope"), None);
    }

    #[test]
    fn test_interpolate_value() {
        let body = json!({"who": "{{name}}", "n": 1, "tags": ["{{customer.tier}}"]});
        assert_eq!(
            interpolate_value(&body, &vars()),
            json!({"who": "Alice", "n": 1, "tags": ["gold"]})
        );
    }
}
