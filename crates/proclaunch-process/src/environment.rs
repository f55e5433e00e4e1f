//! Child process environment

use std::collections::BTreeMap;

use proclaunch_cmdline::ExecutableFinder;
use tokio::process::Command;

/// `LANG` used when the host environment has none
pub const DEFAULT_LANG: &str = "en_US.UTF-8";

const LANG: &str = "LANG";

/// Environment variables passed to a child, replacing the host ones
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Environment {
    vars: BTreeMap<String, String>,
    lang_defaulted: bool,
}

impl Environment {
    /// Empty environment
    pub fn empty() -> Self {
        Self::default()
    }

    /// Host environment, with `LANG` defaulted to [`DEFAULT_LANG`]
    pub fn inherit() -> Self {
        let mut env = Self::empty();
        for (key, value) in std::env::vars_os() {
            // Non UTF-8 entries can't be represented
            if let (Ok(key), Ok(value)) = (key.into_string(), value.into_string()) {
                env.vars.insert(key, value);
            }
        }
        env.set_default_lang(DEFAULT_LANG);
        env
    }

    /// Set `LANG` unless it came from the host or was set explicitly
    pub fn set_default_lang(&mut self, lang: &str) -> &mut Self {
        if self.lang_defaulted || !self.vars.contains_key(LANG) {
            self.vars.insert(LANG.to_string(), lang.to_string());
            self.lang_defaulted = true;
        }
        self
    }

    /// Set a variable
    ///
    /// On Windows a key equal to `path` in any case sets both `PATH` and `Path`.
    pub fn set(&mut self, key: &str, value: &str) -> &mut Self {
        self.insert(key, value, cfg!(windows))
    }

    fn insert(&mut self, key: &str, value: &str, path_alias: bool) -> &mut Self {
        if path_alias && key.eq_ignore_ascii_case("path") {
            self.vars.insert("PATH".to_string(), value.to_string());
            self.vars.insert("Path".to_string(), value.to_string());
        } else {
            if key == LANG {
                self.lang_defaulted = false;
            }
            self.vars.insert(key.to_string(), value.to_string());
        }
        self
    }

    /// Builder variant of [`Environment::set`]
    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.set(key, value);
        self
    }

    pub fn set_if_absent(&mut self, key: &str, value: &str) -> &mut Self {
        if !self.vars.contains_key(key) {
            self.set(key, value);
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.vars.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Use the finder search directories as `PATH`
    pub fn with_search_path(mut self, finder: &ExecutableFinder) -> Self {
        let path = finder.full_path_string();
        self.set("PATH", &path);
        self
    }

    pub(crate) fn apply(&self, command: &mut Command) {
        command.env_clear();
        command.envs(&self.vars);
    }
}
