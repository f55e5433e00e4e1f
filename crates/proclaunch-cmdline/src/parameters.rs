//! Parameter templates with variable placeholders
//!
//! A [`Parameters`] value is an ordered list of command-line tokens. Some tokens
//! are placeholders (`<%name%>` by default) that get replaced right before a
//! launch, so one template can be reused for many launches with different
//! values.
//!
//! # Examples
//!
//! ```
//! use std::collections::HashMap;
//! use proclaunch_cmdline::Parameters;
//!
//! let template = Parameters::parse("-i <%input%> -o <%output%> -y");
//!
//! let mut vars = HashMap::new();
//! vars.insert("input".to_string(), "in.wav".to_string());
//!
//! // `-o` has no value to go with, so it is dropped too
//! let resolved = template.inject_vars(&vars, true);
//! assert_eq!(resolved.tokens(), ["-i", "in.wav", "-y"]);
//! ```

use std::collections::HashMap;
use std::fmt;

use tracing::trace;

use crate::error::{CmdlineError, Result};

/// Default placeholder start tag
pub const DEFAULT_START_VAR_TAG: &str = "<%";
/// Default placeholder end tag
pub const DEFAULT_END_VAR_TAG: &str = "%>";
/// Default prefix that marks a token as a flag/key
pub const DEFAULT_KEY_PREFIX: &str = "-";

const QUOTE: char = '"';

/// Split a bulk parameter string into tokens
///
/// Splits on whitespace outside of quotes. A `"` opens or closes a quoted span;
/// quotes are stripped and whitespace inside a span is kept. An empty quoted
/// span (`""`) is kept as an empty token.
pub fn tokenize(bulk: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for chr in bulk.chars() {
        match chr {
            QUOTE if in_quotes => {
                tokens.push(std::mem::take(&mut current));
                in_quotes = false;
            }
            QUOTE => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
                in_quotes = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }

    // Unterminated quote: keep what was collected
    if in_quotes || !current.is_empty() {
        tokens.push(current);
    }

    tokens
}

/// Ordered command-line tokens with variable placeholders
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameters {
    tokens: Vec<String>,
    key_prefix: String,
    start_var_tag: String,
    end_var_tag: String,
}

impl Default for Parameters {
    fn default() -> Self {
        Self::new()
    }
}

impl Parameters {
    /// Create an empty template with default tags and key prefix
    pub fn new() -> Self {
        Self {
            tokens: Vec::new(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            start_var_tag: DEFAULT_START_VAR_TAG.to_string(),
            end_var_tag: DEFAULT_END_VAR_TAG.to_string(),
        }
    }

    /// Create a template from a bulk string, see [`tokenize`]
    pub fn parse(bulk: &str) -> Self {
        let mut parameters = Self::new();
        parameters.add_bulk(bulk);
        parameters
    }

    /// Create a template from already split tokens
    pub fn from_tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut parameters = Self::new();
        parameters.add(tokens);
        parameters
    }

    /// Builder variant of [`Parameters::set_var_tags`]
    pub fn with_var_tags(mut self, start: &str, end: &str) -> Result<Self> {
        self.set_var_tags(start, end)?;
        Ok(self)
    }

    /// Change the placeholder syntax, e.g. `("{", "}")` for `{name}`
    pub fn set_var_tags(&mut self, start: &str, end: &str) -> Result<&mut Self> {
        if start.is_empty() {
            return Err(CmdlineError::EmptyVarTag { which: "start" });
        }
        if end.is_empty() {
            return Err(CmdlineError::EmptyVarTag { which: "end" });
        }
        self.start_var_tag = start.to_string();
        self.end_var_tag = end.to_string();
        Ok(self)
    }

    pub fn start_var_tag(&self) -> &str {
        &self.start_var_tag
    }

    pub fn end_var_tag(&self) -> &str {
        &self.end_var_tag
    }

    /// Change the prefix that marks a token as a key (`-` by default)
    pub fn set_key_prefix(&mut self, prefix: &str) -> Result<&mut Self> {
        if prefix.is_empty() {
            return Err(CmdlineError::EmptyKeyPrefix);
        }
        trace!(prefix, "Set parameter key prefix");
        self.key_prefix = prefix.to_string();
        Ok(self)
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn into_tokens(self) -> Vec<String> {
        self.tokens
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn clear(&mut self) -> &mut Self {
        self.tokens.clear();
        self
    }

    /// Append tokens as-is
    pub fn add<I, S>(&mut self, tokens: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tokens.extend(tokens.into_iter().map(Into::into));
        self
    }

    /// Append tokens from a bulk string
    pub fn add_bulk(&mut self, bulk: &str) -> &mut Self {
        trace!(bulk, "Add bulk parameters");
        self.tokens.extend(tokenize(bulk));
        self
    }

    /// Insert tokens before the current ones, keeping their order
    pub fn prepend<I, S>(&mut self, tokens: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut head: Vec<String> = tokens.into_iter().map(Into::into).collect();
        head.append(&mut self.tokens);
        self.tokens = head;
        self
    }

    /// Insert tokens from a bulk string before the current ones
    pub fn prepend_bulk(&mut self, bulk: &str) -> &mut Self {
        self.prepend(tokenize(bulk))
    }

    /// Append a placeholder for `name` and return the placeholder token
    pub fn add_variable(&mut self, name: &str) -> String {
        let placeholder = self.placeholder(name);
        self.tokens.push(placeholder.clone());
        placeholder
    }

    /// Placeholder token for `name` with the current tags
    pub fn placeholder(&self, name: &str) -> String {
        format!("{}{}{}", self.start_var_tag, name, self.end_var_tag)
    }

    /// True if `token` is a placeholder with a non-empty name
    pub fn is_placeholder(&self, token: &str) -> bool {
        self.var_name_of(token).is_some()
    }

    /// Variable name carried by a placeholder token
    pub fn var_name_of<'a>(&self, token: &'a str) -> Option<&'a str> {
        if token.chars().any(char::is_whitespace) {
            return None;
        }
        let name = token
            .strip_prefix(self.start_var_tag.as_str())?
            .strip_suffix(self.end_var_tag.as_str())?;
        if name.is_empty() {
            None
        } else {
            Some(name)
        }
    }

    /// True if `token` starts with the key prefix
    pub fn is_key(&self, token: &str) -> bool {
        token.starts_with(self.key_prefix.as_str())
    }

    fn conform_key(&self, key: &str) -> String {
        if self.is_key(key) {
            key.to_string()
        } else {
            format!("{}{}", self.key_prefix, key)
        }
    }

    /// True if any of `keys` (with or without prefix) is present
    pub fn has_parameters<I, S>(&self, keys: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        keys.into_iter().any(|key| {
            let key = self.conform_key(key.as_ref());
            self.tokens.iter().any(|token| *token == key)
        })
    }

    /// Values following every occurrence of `key`
    ///
    /// Returns `None` when the key is absent, and an empty list when the key is
    /// present but never followed by a value.
    pub fn values_of(&self, key: &str) -> Option<Vec<String>> {
        let key = self.conform_key(key);
        let mut found = false;
        let mut values = Vec::new();

        for (pos, token) in self.tokens.iter().enumerate() {
            if *token != key {
                continue;
            }
            found = true;
            if let Some(next) = self.tokens.get(pos + 1) {
                if !self.is_key(next) {
                    values.push(next.clone());
                }
            }
        }

        found.then_some(values)
    }

    fn key_position(&self, key: &str, occurrence: usize) -> Option<usize> {
        let key = self.conform_key(key);
        self.tokens
            .iter()
            .enumerate()
            .filter(|(_, token)| **token == key)
            .map(|(pos, _)| pos)
            .nth(occurrence)
    }

    /// Remove the `occurrence`-th `key` (0-based) and its value, if any
    pub fn remove_parameter(&mut self, key: &str, occurrence: usize) -> bool {
        let Some(pos) = self.key_position(key, occurrence) else {
            return false;
        };
        if self
            .tokens
            .get(pos + 1)
            .is_some_and(|next| !self.is_key(next))
        {
            self.tokens.remove(pos + 1);
        }
        let removed = self.tokens.remove(pos);
        trace!(parameter = %removed, "Removed parameter");
        true
    }

    /// Set the value of the `occurrence`-th `key` (0-based)
    ///
    /// Replaces the existing value, or inserts one right after the key.
    pub fn alter_parameter(&mut self, key: &str, value: &str, occurrence: usize) -> bool {
        let Some(pos) = self.key_position(key, occurrence) else {
            return false;
        };
        match self.tokens.get(pos + 1) {
            Some(next) if !self.is_key(next) => self.tokens[pos + 1] = value.to_string(),
            _ => self.tokens.insert(pos + 1, value.to_string()),
        }
        true
    }

    /// Surround every placeholder of `name` with extra tokens
    pub fn inject_around_variable<B, A>(&mut self, name: &str, before: B, after: A) -> bool
    where
        B: IntoIterator,
        B::Item: Into<String>,
        A: IntoIterator,
        A::Item: Into<String>,
    {
        let before: Vec<String> = before.into_iter().map(Into::into).collect();
        let after: Vec<String> = after.into_iter().map(Into::into).collect();
        let mut done = false;
        let mut rebuilt = Vec::with_capacity(self.tokens.len());

        for token in self.tokens.drain(..) {
            let matches = {
                let start = self.start_var_tag.as_str();
                let end = self.end_var_tag.as_str();
                !token.chars().any(char::is_whitespace)
                    && token
                        .strip_prefix(start)
                        .and_then(|rest| rest.strip_suffix(end))
                        == Some(name)
            };
            if matches {
                done = true;
                rebuilt.extend(before.iter().cloned());
                rebuilt.push(token);
                rebuilt.extend(after.iter().cloned());
            } else {
                rebuilt.push(token);
            }
        }

        self.tokens = rebuilt;
        done
    }

    /// Replace placeholders with single values
    ///
    /// See [`Parameters::inject_var_lists`] for the handling of missing values.
    pub fn inject_vars(&self, vars: &HashMap<String, String>, drop_orphan_flag: bool) -> Self {
        self.resolve(
            |name| vars.get(name).map(|value| vec![value.clone()]),
            drop_orphan_flag,
        )
    }

    /// Replace placeholders, each with zero or more tokens
    ///
    /// A placeholder without a value is removed. With `drop_orphan_flag`, the
    /// token right before it is removed as well when it is a key, so
    /// `-flag <%missing%>` disappears as a pair.
    pub fn inject_var_lists(
        &self,
        vars: &HashMap<String, Vec<String>>,
        drop_orphan_flag: bool,
    ) -> Self {
        self.resolve(|name| vars.get(name).cloned(), drop_orphan_flag)
    }

    /// Remove every placeholder, see [`Parameters::inject_var_lists`]
    pub fn remove_vars(&self, drop_orphan_flag: bool) -> Self {
        self.resolve(|_| None, drop_orphan_flag)
    }

    fn resolve<F>(&self, lookup: F, drop_orphan_flag: bool) -> Self
    where
        F: Fn(&str) -> Option<Vec<String>>,
    {
        let mut resolved: Vec<String> = Vec::with_capacity(self.tokens.len());

        for token in &self.tokens {
            let Some(name) = self.var_name_of(token) else {
                resolved.push(token.clone());
                continue;
            };

            match lookup(name) {
                Some(values) => resolved.extend(values),
                None if drop_orphan_flag => {
                    if resolved.last().is_some_and(|prev| self.is_key(prev)) {
                        let flag = resolved.pop();
                        trace!(var = name, flag = ?flag, "Dropped orphan flag");
                    }
                }
                None => trace!(var = name, "Dropped unresolved variable"),
            }
        }

        Self {
            tokens: resolved,
            ..self.duplicate_config()
        }
    }

    fn duplicate_config(&self) -> Self {
        Self {
            tokens: Vec::new(),
            key_prefix: self.key_prefix.clone(),
            start_var_tag: self.start_var_tag.clone(),
            end_var_tag: self.end_var_tag.clone(),
        }
    }

    /// Deep copy, configuration included
    pub fn duplicate(&self) -> Self {
        self.clone()
    }
}

impl fmt::Display for Parameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tokens.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const TEMPLATE: &str = "-a <%var1%> <%var2%> <%varNOPE%> -b <%varNOPE%> -c";

    fn vars() -> HashMap<String, String> {
        let mut vars = HashMap::new();
        vars.insert("var1".to_string(), "value1".to_string());
        vars.insert("var2".to_string(), "value2".to_string());
        vars
    }

    #[test]
    fn test_tokenize_quotes_and_spaces() {
        assert_eq!(tokenize("  -a   b  "), ["-a", "b"]);
        assert_eq!(tokenize("-i \"my file.txt\" -y"), ["-i", "my file.txt", "-y"]);
        assert_eq!(tokenize("abc\"def ghi\"jkl"), ["abc", "def ghi", "jkl"]);
        assert_eq!(tokenize("-title \"\" -x"), ["-title", "", "-x"]);
        assert_eq!(tokenize("\"open ended"), ["open ended"]);
        assert!(tokenize("   ").is_empty());
    }

    #[test]
    fn test_placeholder_detection() {
        let p = Parameters::new();
        assert_eq!(p.start_var_tag(), "<%");
        assert_eq!(p.end_var_tag(), "%>");
        assert!(p.is_placeholder("<%ok%>"));
        assert!(!p.is_placeholder("<%nope"));
        assert!(!p.is_placeholder("nope%>"));
        assert!(!p.is_placeholder("<nope>"));
        assert!(!p.is_placeholder("%>nope<%"));
        assert!(!p.is_placeholder("<%nope %>"));
        assert_eq!(p.var_name_of("<%my_var%>"), Some("my_var"));
        assert_eq!(p.var_name_of("<%%>"), None);
        assert_eq!(p.var_name_of("<%"), None);
    }

    #[test]
    fn test_custom_var_tags() {
        let p = Parameters::new().with_var_tags("{", "}").unwrap();
        assert!(p.is_placeholder("{ok}"));
        assert!(!p.is_placeholder("{ok }"));
        assert!(!p.is_placeholder("}nope{"));
        assert_eq!(p.var_name_of("{my_var}"), Some("my_var"));

        let mut p = Parameters::new();
        assert!(matches!(
            p.set_var_tags("", "}"),
            Err(CmdlineError::EmptyVarTag { which: "start" })
        ));
        assert!(matches!(
            p.set_var_tags("{", ""),
            Err(CmdlineError::EmptyVarTag { which: "end" })
        ));
    }

    #[test]
    fn test_inject_vars_drop_orphan_flag() {
        let p = Parameters::parse(TEMPLATE);
        let resolved = p.inject_vars(&vars(), true);
        assert_eq!(resolved.tokens(), ["-a", "value1", "value2", "-c"]);
        // template is untouched
        assert_eq!(p.to_string(), TEMPLATE);
    }

    #[test]
    fn test_inject_vars_keep_orphan_flag() {
        let p = Parameters::parse(TEMPLATE);
        let resolved = p.inject_vars(&vars(), false);
        assert_eq!(resolved.tokens(), ["-a", "value1", "value2", "-b", "-c"]);
    }

    #[test]
    fn test_empty_placeholder_stays_literal() {
        let p = Parameters::parse("-flag <%%> -x <%value%>");
        assert!(!p.is_placeholder("<%%>"));

        let resolved = p.inject_vars(&vars(), true);
        assert_eq!(resolved.tokens(), ["-flag", "<%%>"]);
        assert_eq!(p.remove_vars(true).tokens(), ["-flag", "<%%>"]);
    }

    #[test]
    fn test_remove_vars() {
        let p = Parameters::parse(TEMPLATE);
        assert_eq!(p.remove_vars(false).to_string(), "-a -b -c");
        assert_eq!(p.remove_vars(true).to_string(), "-c");
    }

    #[test]
    fn test_inject_var_lists_expands() {
        let p = Parameters::parse("-x <%filters%> -y");
        let mut vars = HashMap::new();
        vars.insert(
            "filters".to_string(),
            vec!["-vf".to_string(), "scale=2".to_string()],
        );
        assert_eq!(
            p.inject_var_lists(&vars, true).tokens(),
            ["-x", "-vf", "scale=2", "-y"]
        );
    }

    #[test]
    fn test_resolved_copy_keeps_configuration() {
        let mut p = Parameters::parse("+a {v}").with_var_tags("{", "}").unwrap();
        p.set_key_prefix("+").unwrap();
        let resolved = p.remove_vars(true);
        assert!(resolved.is_empty());
        assert_eq!(resolved.key_prefix(), "+");
        assert_eq!(resolved.start_var_tag(), "{");
        assert_eq!(resolved.end_var_tag(), "}");
    }

    #[test]
    fn test_inject_around_variable() {
        let mut p = Parameters::parse("-before <%myvar%> -after");
        assert!(p.inject_around_variable("myvar", ["-addedbefore", "1"], ["-addedafter", "2"]));
        assert_eq!(
            p.to_string(),
            "-before -addedbefore 1 <%myvar%> -addedafter 2 -after"
        );

        let mut p = Parameters::parse("-before <%myvar%> <%myvar%> -after");
        p.inject_around_variable("myvar", ["-addedbefore", "1"], ["-addedafter", "2"]);
        assert_eq!(
            p.to_string(),
            "-before -addedbefore 1 <%myvar%> -addedafter 2 -addedbefore 1 <%myvar%> -addedafter 2 -after"
        );

        let mut p = Parameters::parse("-before <%myvar1%> -after");
        assert!(!p.inject_around_variable("other", ["x"], Vec::<String>::new()));
        assert_eq!(p.to_string(), "-before <%myvar1%> -after");
    }

    #[test]
    fn test_values_alter_remove() {
        let mut p = Parameters::parse("-i a.wav -v -i b.wav -y");
        assert!(p.has_parameters(["i"]));
        assert!(p.has_parameters(["-y", "missing"]));
        assert!(!p.has_parameters(["missing"]));
        assert_eq!(p.values_of("-i"), Some(vec!["a.wav".to_string(), "b.wav".to_string()]));
        assert_eq!(p.values_of("v"), Some(vec![]));
        assert_eq!(p.values_of("z"), None);

        assert!(p.alter_parameter("i", "c.wav", 1));
        assert!(p.alter_parameter("v", "3", 0));
        assert!(p.alter_parameter("y", "now", 0));
        assert_eq!(p.to_string(), "-i a.wav -v 3 -i c.wav -y now");
        assert!(!p.alter_parameter("i", "x", 2));

        assert!(p.remove_parameter("-i", 0));
        assert_eq!(p.to_string(), "-v 3 -i c.wav -y now");
        assert!(!p.remove_parameter("-q", 0));
    }

    #[test]
    fn test_prepend_and_add_variable() {
        let mut p = Parameters::parse("-c");
        p.prepend_bulk("-a \"b c\"");
        let placeholder = p.add_variable("out");
        assert_eq!(placeholder, "<%out%>");
        assert_eq!(p.tokens(), ["-a", "b c", "-c", "<%out%>"]);
    }

    #[test]
    fn test_duplicate_is_independent() {
        let original = Parameters::parse("-a <%x%>");
        let mut copy = original.duplicate();
        copy.add(["-z"]);
        assert_eq!(original.len(), 2);
        assert_eq!(copy.len(), 3);
    }

    proptest! {
        #[test]
        fn prop_full_injection_leaves_no_placeholder(
            names in proptest::collection::vec("[a-z]{1,8}", 1..6),
            value in "[a-zA-Z0-9_.]{1,12}",
        ) {
            let mut template = Parameters::new();
            let mut vars = HashMap::new();
            for name in &names {
                template.add(["-k"]);
                template.add_variable(name);
                vars.insert(name.clone(), value.clone());
            }

            let resolved = template.inject_vars(&vars, true);
            prop_assert_eq!(resolved.len(), template.len());
            prop_assert!(resolved.tokens().iter().all(|t| !template.is_placeholder(t)));
        }

        #[test]
        fn prop_remove_vars_with_drop_never_leaves_dangling_flag(
            names in proptest::collection::vec("[a-z]{1,8}", 1..6),
        ) {
            let mut template = Parameters::new();
            for name in &names {
                template.add([format!("-{name}")]);
                template.add_variable(name);
            }
            prop_assert!(template.remove_vars(true).is_empty());
        }
    }
}
