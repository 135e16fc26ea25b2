//! Trigger pattern language for the auto-responder.
//!
//! A pattern is literal text with capture placeholders: `{name}` captures
//! one whitespace-free token, `{name:regex}` captures the given
//! sub-pattern. The compiled regex is anchored; a message matches only if
//! the whole text does. Captures are exposed to actions as `PARAM_<name>`
//! environment variables.

use hashbrown::HashMap;
use regex::Regex;

#[derive(Debug)]
pub struct TriggerPattern {
    regex: Regex,
    names: Vec<String>,
}

#[derive(Debug, PartialEq)]
pub enum PatternError {
    /// A `{` without a matching `}`.
    UnclosedCapture,
    /// Empty or non-alphanumeric capture name.
    BadCaptureName(String),
    /// The assembled expression failed to compile.
    BadRegex(String),
}

impl TriggerPattern {
    /// Tokenises and compiles a pattern string.
    pub fn compile(pattern: &str) -> Result<TriggerPattern, PatternError> {
        let mut expression = String::from("^");
        let mut names = Vec::new();
        let mut rest = pattern;

        while let Some(open) = rest.find('{') {
            expression.push_str(&regex::escape(&rest[..open]));
            rest = &rest[open + 1..];

            let close = rest.find('}').ok_or(PatternError::UnclosedCapture)?;
            let capture = &rest[..close];
            rest = &rest[close + 1..];

            let (name, sub_pattern) = match capture.find(':') {
                Some(colon) => (&capture[..colon], &capture[colon + 1..]),
                None => (capture, r"[^\s]+"),
            };

            if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(PatternError::BadCaptureName(name.to_string()));
            }

            expression.push_str(&format!("(?P<{}>{})", name, sub_pattern));
            names.push(name.to_string());
        }

        expression.push_str(&regex::escape(rest));
        expression.push('$');

        let regex =
            Regex::new(&expression).map_err(|err| PatternError::BadRegex(err.to_string()))?;

        Ok(TriggerPattern { regex, names })
    }

    /// Matches the entire text, returning the named captures.
    pub fn match_text(&self, text: &str) -> Option<HashMap<String, String>> {
        let captures = self.regex.captures(text)?;

        let mut params = HashMap::new();

        for name in &self.names {
            if let Some(value) = captures.name(name) {
                params.insert(name.clone(), value.as_str().to_string());
            }
        }

        Some(params)
    }

    /// Environment variable form of the captures.
    pub fn env_params(params: &HashMap<String, String>) -> Vec<(String, String)> {
        params
            .iter()
            .map(|(name, value)| (format!("PARAM_{}", name), value.clone()))
            .collect()
    }
}

/// Substitutes `{name}` placeholders in a response template.
pub fn render_template(template: &str, params: &HashMap<String, String>) -> String {
    let mut rendered = template.to_string();

    for (name, value) in params {
        rendered = rendered.replace(&format!("{{{}}}", name), value);
    }

    rendered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_capture_matches_token() {
        let pattern = TriggerPattern::compile("ping {name}").unwrap();

        let params = pattern.match_text("ping gateway").unwrap();
        assert_eq!(params["name"], "gateway");

        // Whitespace breaks a plain capture.
        assert!(pattern.match_text("ping two words").is_none());
    }

    #[test]
    fn test_typed_capture() {
        let pattern = TriggerPattern::compile("ping {name:[A-Z]+}").unwrap();

        assert_eq!(pattern.match_text("ping FOO").unwrap()["name"], "FOO");
        assert!(pattern.match_text("ping foo").is_none());
    }

    #[test]
    fn test_anchored_whole_text() {
        let pattern = TriggerPattern::compile("status").unwrap();

        assert!(pattern.match_text("status").is_some());
        assert!(pattern.match_text("status please").is_none());
        assert!(pattern.match_text("the status").is_none());
    }

    #[test]
    fn test_literals_are_escaped() {
        let pattern = TriggerPattern::compile("temp? {value:[0-9]+}").unwrap();

        assert!(pattern.match_text("temp? 21").is_some());
        // The '?' is literal, not an optional quantifier.
        assert!(pattern.match_text("tem 21").is_none());
    }

    #[test]
    fn test_multiple_captures() {
        let pattern = TriggerPattern::compile("move {x:[0-9]+} {y:[0-9]+}").unwrap();
        let params = pattern.match_text("move 3 14").unwrap();

        assert_eq!(params["x"], "3");
        assert_eq!(params["y"], "14");

        let mut env = TriggerPattern::env_params(&params);
        env.sort();
        assert_eq!(
            env,
            vec![
                ("PARAM_x".to_string(), "3".to_string()),
                ("PARAM_y".to_string(), "14".to_string())
            ]
        );
    }

    #[test]
    fn test_compile_errors() {
        assert_eq!(
            TriggerPattern::compile("ping {name").unwrap_err(),
            PatternError::UnclosedCapture
        );
        assert_eq!(
            TriggerPattern::compile("ping {}").unwrap_err(),
            PatternError::BadCaptureName(String::new())
        );
        assert!(matches!(
            TriggerPattern::compile("ping {n:[}"),
            Err(PatternError::BadRegex(_))
        ));
    }

    #[test]
    fn test_render_template() {
        let pattern = TriggerPattern::compile("echo {word}").unwrap();
        let params = pattern.match_text("echo hi").unwrap();

        assert_eq!(render_template("you said {word}", &params), "you said hi");
    }
}
