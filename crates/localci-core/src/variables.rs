//! Variable interpolation and scope composition.
//!
//! Expansion is intentionally non-recursive: a value that itself contains
//! `$FOO` is substituted once and the result is not re-scanned. This keeps
//! the resolver a pure text transform with no risk of expansion loops.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

/// `$NAME` or `${NAME}`, anchored to identifier characters.
static VAR_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)").unwrap());

/// An ordered variable scope. Later layers in [`Scope::compose`] win on
/// key collision, matching GitLab's documented precedence: process
/// environment, predefined, project-level, global `variables:`, then
/// job-local `variables:`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scope(BTreeMap<String, String>);

impl Scope {
    #[must_use]
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    #[must_use]
    pub fn from_map(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn as_env_map(&self) -> BTreeMap<String, String> {
        self.0.clone()
    }

    /// Layers `layers` in order, each one overriding earlier keys.
    #[must_use]
    pub fn compose(layers: impl IntoIterator<Item = Scope>) -> Scope {
        let mut merged = Scope::new();
        for layer in layers {
            for (k, v) in layer.0 {
                merged.0.insert(k, v);
            }
        }
        merged
    }
}

/// Replaces every `$NAME`/`${NAME}` in `text` found in `scope`. Names not
/// present in `scope` are left untouched, literal text.
#[must_use]
pub fn expand_text(text: &str, scope: &Scope) -> String {
    VAR_PATTERN
        .replace_all(text, |caps: &Captures| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            match scope.get(name) {
                Some(value) => value.to_string(),
                None => caps.get(0).unwrap().as_str().to_string(),
            }
        })
        .into_owned()
}

/// Applies [`expand_text`] to every value in `vars`, producing a new scope.
#[must_use]
pub fn expand_variables(vars: &Scope, scope: &Scope) -> Scope {
    let mut expanded = Scope::new();
    for (k, v) in vars.iter() {
        expanded.insert(k, expand_text(v, scope));
    }
    expanded
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope(pairs: &[(&str, &str)]) -> Scope {
        let mut s = Scope::new();
        for (k, v) in pairs {
            s.insert(*k, *v);
        }
        s
    }

    #[test]
    fn expands_both_forms() {
        let s = scope(&[("NAME", "world")]);
        assert_eq!(expand_text("hello $NAME", &s), "hello world");
        assert_eq!(expand_text("hello ${NAME}", &s), "hello world");
    }

    #[test]
    fn leaves_unknown_names_literal() {
        let s = scope(&[]);
        assert_eq!(expand_text("echo $MISSING", &s), "echo $MISSING");
    }

    #[test]
    fn does_not_recurse() {
        let s = scope(&[("A", "$B"), ("B", "leaf")]);
        assert_eq!(expand_text("$A", &s), "$B");
    }

    #[test]
    fn compose_later_layers_win() {
        let base = scope(&[("X", "1")]);
        let override_layer = scope(&[("X", "2")]);
        let merged = Scope::compose([base, override_layer]);
        assert_eq!(merged.get("X"), Some("2"));
    }

    #[test]
    fn idempotent_without_recursive_values() {
        let s = scope(&[("NAME", "world")]);
        let once = expand_text("hello $NAME", &s);
        let twice = expand_text(&once, &s);
        assert_eq!(once, twice);
    }
}
