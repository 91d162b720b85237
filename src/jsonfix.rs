// Best-effort repair of malformed JSON from model output. This is an
// explicit, isolated fallback stage: callers parse the raw text first and
// only run this on failure, so a clean response never pays for it.
//
// Handled: markdown code fences, prose around the JSON value, trailing
// commas, single-quoted strings, unquoted keys, Python literals, line and
// block comments, unterminated strings, and unclosed braces/brackets.

/// Produces a repaired candidate string. The caller re-parses it; if that
/// parse also fails the output was unrepairable.
pub fn repair(raw: &str) -> String {
    let text = strip_code_fences(raw.trim());
    let text = isolate_json_span(text);

    let mut out = String::with_capacity(text.len() + 4);
    let mut stack: Vec<char> = Vec::new();
    let mut chars = text.chars().peekable();
    let mut in_string = false;
    let mut quote = '"';
    let mut escape = false;

    while let Some(c) = chars.next() {
        if in_string {
            if escape {
                out.push(c);
                escape = false;
                continue;
            }
            match c {
                '\\' => {
                    out.push(c);
                    escape = true;
                }
                _ if c == quote => {
                    out.push('"');
                    in_string = false;
                }
                '"' => {
                    // double quote inside a single-quoted string
                    out.push('\\');
                    out.push('"');
                }
                '\n' => out.push_str("\\n"),
                _ => out.push(c),
            }
            continue;
        }
        match c {
            '"' | '\'' => {
                in_string = true;
                quote = c;
                out.push('"');
            }
            '{' => {
                stack.push('}');
                out.push(c);
            }
            '[' => {
                stack.push(']');
                out.push(c);
            }
            '}' | ']' => {
                if stack.last() == Some(&c) {
                    stack.pop();
                }
                out.push(c);
            }
            ',' => {
                // drop trailing commas before a closer or end of input
                let mut ahead = chars.clone();
                let next = loop {
                    match ahead.next() {
                        Some(n) if n.is_whitespace() => continue,
                        n => break n,
                    }
                };
                if !matches!(next, Some('}') | Some(']') | None) {
                    out.push(c);
                }
            }
            '/' => match chars.peek() {
                Some('/') => {
                    while let Some(&n) = chars.peek() {
                        if n == '\n' {
                            break;
                        }
                        chars.next();
                    }
                }
                Some('*') => {
                    chars.next();
                    let mut prev = ' ';
                    for n in chars.by_ref() {
                        if prev == '*' && n == '/' {
                            break;
                        }
                        prev = n;
                    }
                }
                _ => out.push(c),
            },
            _ if (c.is_ascii_alphabetic() || c == '_') && !follows_number(&out) => {
                let mut ident = String::from(c);
                while let Some(&n) = chars.peek() {
                    if n.is_ascii_alphanumeric() || n == '_' {
                        ident.push(n);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match ident.as_str() {
                    "true" | "false" | "null" => out.push_str(&ident),
                    "True" => out.push_str("true"),
                    "False" => out.push_str("false"),
                    "None" | "NULL" | "nil" => out.push_str("null"),
                    // bare word: quote it, it is most likely an unquoted key
                    _ => {
                        out.push('"');
                        out.push_str(&ident);
                        out.push('"');
                    }
                }
            }
            _ => out.push(c),
        }
    }

    if in_string {
        out.push('"');
    }
    while let Some(closer) = stack.pop() {
        out.push(closer);
    }
    out
}

// Exponent letters must not be mistaken for identifiers ("1e5").
fn follows_number(out: &str) -> bool {
    matches!(out.chars().last(), Some(c) if c.is_ascii_digit() || c == '.' || c == '-' || c == '+')
}

fn strip_code_fences(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // drop the fence line (``` or ```json), then any trailing fence
    let body = rest.split_once('\n').map(|(_, b)| b).unwrap_or("");
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

// Models often wrap the value in prose. Cut to the outermost JSON-looking
// span; a missing closer is fine, the bracket stack appends it later.
fn isolate_json_span(text: &str) -> &str {
    let Some(start) = text.find(['{', '[']) else {
        return text;
    };
    match text.rfind(['}', ']']) {
        Some(end) if end > start => &text[start..=end],
        _ => &text[start..],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    fn fixed(raw: &str) -> Value {
        serde_json::from_str(&repair(raw)).expect("repair should yield valid JSON")
    }

    #[test]
    fn valid_json_passes_through() {
        assert_eq!(fixed(r#"{"a": [1, 2], "b": "x"}"#), json!({"a": [1, 2], "b": "x"}));
    }

    #[test]
    fn trailing_commas_are_removed() {
        assert_eq!(fixed(r#"{"a": 1,}"#), json!({"a": 1}));
        assert_eq!(fixed(r#"[1, 2, 3,]"#), json!([1, 2, 3]));
        assert_eq!(fixed("{\"a\": 1,\n}"), json!({"a": 1}));
    }

    #[test]
    fn code_fences_are_stripped() {
        assert_eq!(fixed("```json\n{\"a\": 1}\n```"), json!({"a": 1}));
        assert_eq!(fixed("```\n[1]\n```"), json!([1]));
    }

    #[test]
    fn surrounding_prose_is_cut() {
        assert_eq!(
            fixed(r#"Here is the result: {"a": 1} Hope that helps!"#),
            json!({"a": 1})
        );
    }

    #[test]
    fn single_quotes_and_bare_keys_are_quoted() {
        assert_eq!(fixed(r#"{'a': 'x'}"#), json!({"a": "x"}));
        assert_eq!(fixed(r#"{a: 1, b_2: 2}"#), json!({"a": 1, "b_2": 2}));
    }

    #[test]
    fn python_literals_become_json() {
        assert_eq!(
            fixed(r#"{"a": True, "b": False, "c": None}"#),
            json!({"a": true, "b": false, "c": null})
        );
    }

    #[test]
    fn unclosed_structures_are_closed() {
        assert_eq!(fixed(r#"{"a": [1, 2"#), json!({"a": [1, 2]}));
        assert_eq!(fixed(r#"{"a": "unterminated"#), json!({"a": "unterminated"}));
    }

    #[test]
    fn comments_are_stripped() {
        assert_eq!(
            fixed("{\n  \"a\": 1, // inline\n  /* block */ \"b\": 2\n}"),
            json!({"a": 1, "b": 2})
        );
    }

    #[test]
    fn exponent_numbers_survive() {
        assert_eq!(fixed(r#"{"a": 1e5}"#), json!({"a": 1e5}));
    }

    #[test]
    fn hopeless_input_stays_unparseable() {
        assert!(serde_json::from_str::<Value>(&repair("no json here at all")).is_err());
    }
}
