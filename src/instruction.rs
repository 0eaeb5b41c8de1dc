//! Session-state templating for instructions.
//!
//! Instructions may reference session state with `{{key}}` placeholders.
//! [`inject_session_state`] replaces each placeholder with the string form
//! of `state[key]`; unknown keys are left verbatim so typos and
//! intentionally literal braces survive untouched.

use serde_json::Value;
use std::collections::HashMap;

/// Renders a JSON value into the string form used for substitution.
///
/// Strings are inserted without surrounding quotes; everything else uses
/// its compact JSON encoding.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Replaces every `{{key}}` occurrence in `template` with the string form
/// of `state[key]`. Unknown keys are left verbatim. Whitespace around the
/// key inside the braces is tolerated.
///
/// ```
/// use agent_kit::instruction::inject_session_state;
/// use std::collections::HashMap;
/// use serde_json::json;
///
/// let state = HashMap::from([("user_name".to_string(), json!("Ada"))]);
/// let out = inject_session_state("Greet {{user_name}} and unknown {{missing}}", &state);
/// assert_eq!(out, "Greet Ada and unknown {{missing}}");
/// ```
pub fn inject_session_state(template: &str, state: &HashMap<String, Value>) -> String {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        output.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        match after_open.find("}}") {
            Some(end) => {
                let key = after_open[..end].trim();
                match state.get(key) {
                    Some(value) => output.push_str(&value_to_string(value)),
                    None => {
                        // Unknown key: keep the placeholder verbatim
                        output.push_str(&rest[start..start + 2 + end + 2]);
                    }
                }
                rest = &after_open[end + 2..];
            }
            None => {
                // Unterminated placeholder: keep the remainder as-is
                output.push_str(&rest[start..]);
                rest = "";
            }
        }
    }

    output.push_str(rest);
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state() -> HashMap<String, Value> {
        HashMap::from([
            ("user_name".to_string(), json!("Ada")),
            ("visits".to_string(), json!(3)),
            ("prefs".to_string(), json!({"lang": "en"})),
        ])
    }

    #[test]
    fn test_basic_substitution() {
        let out = inject_session_state("Hello {{user_name}}!", &state());
        assert_eq!(out, "Hello Ada!");
    }

    #[test]
    fn test_unknown_key_left_verbatim() {
        let out = inject_session_state("Greet {{user_name}} and unknown {{missing}}", &state());
        assert_eq!(out, "Greet Ada and unknown {{missing}}");
    }

    #[test]
    fn test_non_string_values() {
        let out = inject_session_state("{{visits}} visits, prefs {{prefs}}", &state());
        assert_eq!(out, r#"3 visits, prefs {"lang":"en"}"#);
    }

    #[test]
    fn test_whitespace_inside_braces() {
        let out = inject_session_state("Hello {{ user_name }}!", &state());
        assert_eq!(out, "Hello Ada!");
    }

    #[test]
    fn test_unterminated_placeholder() {
        let out = inject_session_state("Hello {{user_name", &state());
        assert_eq!(out, "Hello {{user_name");
    }

    #[test]
    fn test_no_placeholders() {
        let out = inject_session_state("plain text", &state());
        assert_eq!(out, "plain text");
    }

    #[test]
    fn test_adjacent_placeholders() {
        let out = inject_session_state("{{user_name}}{{visits}}", &state());
        assert_eq!(out, "Ada3");
    }
}
