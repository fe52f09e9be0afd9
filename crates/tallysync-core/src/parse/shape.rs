//! Typed accessors over the generic tree.
//!
//! Tally emits the same logical field in several shapes: a bare string, an
//! object carrying its value under `"_"` next to a `TYPE` attribute, a single
//! object where a list was expected, or a tag in unexpected casing. Entity
//! projections read the tree only through these functions.

use serde_json::Value;

use super::tree::{ATTR_KEY, TEXT_KEY};

/// Child `name` of `node`, matched exactly first and then ignoring ASCII case.
pub fn field<'a>(node: &'a Value, name: &str) -> Option<&'a Value> {
    let obj = node.as_object()?;
    obj.get(name).or_else(|| {
        obj.iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
    })
}

/// Attribute `name` of `node`, ignoring ASCII case.
pub fn attr<'a>(node: &'a Value, name: &str) -> Option<&'a str> {
    let attrs = node.as_object()?.get(ATTR_KEY)?.as_object()?;
    attrs
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .and_then(|(_, value)| value.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Resolves a scalar regardless of wrapping. Blank values are `None`.
pub fn as_scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(if *b { "Yes" } else { "No" }.to_string()),
        Value::Object(obj) => obj.get(TEXT_KEY).and_then(as_scalar),
        Value::Array(items) => items.iter().find_map(as_scalar),
        Value::Null => None,
    }
}

/// Treats absent as empty and a single object as a one-element list.
pub fn as_list(value: Option<&Value>) -> Vec<&Value> {
    match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.iter().collect(),
        Some(Value::String(s)) if s.trim().is_empty() => Vec::new(),
        Some(other) => vec![other],
    }
}

pub fn scalar(node: &Value, name: &str) -> Option<String> {
    field(node, name).and_then(as_scalar)
}

pub fn list<'a>(node: &'a Value, name: &str) -> Vec<&'a Value> {
    as_list(field(node, name))
}

/// Tally's Yes/No flags.
pub fn as_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "yes" | "true" | "1" | "y" => Some(true),
        "no" | "false" | "0" | "n" => Some(false),
        _ => None,
    }
}

pub fn flag(node: &Value, name: &str) -> Option<bool> {
    scalar(node, name).as_deref().and_then(as_flag)
}

/// Name of a master object.
///
/// Looked up as the `NAME` child, then the `NAME` attribute, then the first
/// entry of the multilingual `LANGUAGENAME.LIST/NAME.LIST` block.
pub fn name_of(node: &Value) -> Option<String> {
    scalar(node, "NAME")
        .or_else(|| attr(node, "NAME").map(str::to_string))
        .or_else(|| {
            list(node, "LANGUAGENAME.LIST")
                .into_iter()
                .flat_map(|lang| list(lang, "NAME.LIST"))
                .find_map(|names| scalar(names, "NAME"))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scalar_forms_agree() {
        let bare = json!("1200.00");
        let wrapped = json!({"$": {"TYPE": "Amount"}, "_": "1200.00"});
        let listed = json!(["", {"_": "1200.00"}]);
        assert_eq!(as_scalar(&bare), as_scalar(&wrapped));
        assert_eq!(as_scalar(&wrapped), as_scalar(&listed));
        assert_eq!(as_scalar(&json!("   ")), None);
        assert_eq!(as_scalar(&json!({"$": {"TYPE": "Amount"}})), None);
    }

    #[test]
    fn test_list_forms() {
        let node = json!({
            "ONE": {"LEDGERNAME": "Cash"},
            "MANY": [{"LEDGERNAME": "Cash"}, {"LEDGERNAME": "Bank"}],
            "BLANK": ""
        });
        assert_eq!(list(&node, "ONE").len(), 1);
        assert_eq!(list(&node, "MANY").len(), 2);
        assert!(list(&node, "BLANK").is_empty());
        assert!(list(&node, "MISSING").is_empty());
    }

    #[test]
    fn test_field_ignores_case() {
        let node = json!({"VoucherNumber": "42"});
        assert_eq!(scalar(&node, "VOUCHERNUMBER").as_deref(), Some("42"));
    }

    #[test]
    fn test_name_lookup_order() {
        let attr_only = json!({"$": {"NAME": "Cash"}, "PARENT": "Cash-in-Hand"});
        assert_eq!(name_of(&attr_only).as_deref(), Some("Cash"));

        let multilingual = json!({
            "LANGUAGENAME.LIST": {"NAME.LIST": {"$": {"TYPE": "String"}, "NAME": ["HDFC Bank", "HDFC"]}}
        });
        assert_eq!(name_of(&multilingual).as_deref(), Some("HDFC Bank"));

        assert_eq!(name_of(&json!({"PARENT": "x"})), None);
    }

    #[test]
    fn test_flags() {
        assert_eq!(as_flag("Yes"), Some(true));
        assert_eq!(as_flag(" no "), Some(false));
        assert_eq!(as_flag("maybe"), None);
    }
}
