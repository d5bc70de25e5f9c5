use lazy_static::lazy_static;
use regex::Regex;
use rosnative_common::{Error, Result};

lazy_static! {
    static ref GRAPH_NAME_REGEX: Regex = Regex::new(r"^[/a-zA-Z][a-zA-Z0-9_/]*$").unwrap();
}

/// A validated ROS graph resource name (node, topic, or service name).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Name {
    inner: String,
}

impl Name {
    /// Validates a name against the ROS naming rules.
    ///
    /// Names are alphanumeric plus underscore, may not start with a digit,
    /// and use `/` as the namespace separator.
    pub fn new(name: &str) -> Result<Self> {
        if !GRAPH_NAME_REGEX.is_match(name) || name.contains("//") {
            return Err(Error::InvalidName(name.to_string()));
        }
        Ok(Self {
            inner: name.to_string(),
        })
    }

    pub fn is_global(&self) -> bool {
        self.inner.starts_with('/')
    }

    /// Resolves this name to a global name under the given namespace.
    ///
    /// Global names pass through untouched; relative names are prefixed.
    pub fn resolve(&self, namespace: &str) -> Name {
        if self.is_global() {
            return self.clone();
        }
        let separator = if namespace.ends_with('/') { "" } else { "/" };
        Name {
            inner: format!("{namespace}{separator}{}", self.inner),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }
}

impl std::fmt::Display for Name {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.inner)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn valid_names_are_accepted() {
        for name in ["/chatter", "chatter", "/ns/deeper/topic", "talker_1"] {
            assert!(Name::new(name).is_ok(), "{name} should be valid");
        }
    }

    #[test]
    fn invalid_names_are_rejected() {
        for name in ["", "1talker", "/bad name", "with-dash", "//double"] {
            assert!(Name::new(name).is_err(), "{name} should be invalid");
        }
    }

    #[test]
    fn relative_names_resolve_under_namespace() {
        let name = Name::new("chatter").unwrap();
        assert_eq!(name.resolve("/").as_str(), "/chatter");
        assert_eq!(name.resolve("/ns").as_str(), "/ns/chatter");
    }

    #[test]
    fn global_names_are_untouched_by_resolve() {
        let name = Name::new("/chatter").unwrap();
        assert_eq!(name.resolve("/ns").as_str(), "/chatter");
    }
}
