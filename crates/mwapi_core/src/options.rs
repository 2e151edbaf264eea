use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, Result};
use crate::paraminfo::ParameterInfo;

/// A multi-valued toggle parameter such as `rcshow=anon|!bot`.
///
/// An unbound set accepts any option name; once bound to a parameter schema
/// only the names the server declares are accepted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionSet {
    bound_to: Option<String>,
    valid: Option<BTreeSet<String>>,
    values: BTreeMap<String, bool>,
}

impl OptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// A set validated against `param` of `module`.
    pub fn for_parameter(module: &str, param: &ParameterInfo) -> Result<Self> {
        let mut options = Self::new();
        options.bind(module, param, false)?;
        Ok(options)
    }

    /// Re-creates a set from API tokens, where `!name` means disabled.
    pub fn decode<S: AsRef<str>>(tokens: &[S]) -> Self {
        let mut options = Self::new();
        for token in tokens {
            let token = token.as_ref();
            match token.strip_prefix('!') {
                Some(name) => options.values.insert(name.to_string(), false),
                None => options.values.insert(token.to_string(), true),
            };
        }
        options
    }

    /// Attaches a schema to a set built without one. Names the schema does not know
    /// are an error unless `clear_invalid` is set, in which case they are dropped.
    pub fn bind(&mut self, module: &str, param: &ParameterInfo, clear_invalid: bool) -> Result<()> {
        if let Some(bound_to) = &self.bound_to {
            return Err(Error::Validation(format!(
                "option set is already bound to {bound_to}"
            )));
        }
        let valid = param.option_names().ok_or_else(|| {
            Error::Validation(format!(
                "{module} parameter {} is not an option list",
                param.name
            ))
        })?;
        let invalid = self
            .values
            .keys()
            .filter(|name| !valid.contains(*name))
            .cloned()
            .collect::<Vec<_>>();
        if !invalid.is_empty() {
            if !clear_invalid {
                return Err(Error::Validation(format!(
                    "invalid {module} {} options: {}",
                    param.name,
                    invalid.join(", ")
                )));
            }
            for name in invalid {
                self.values.remove(&name);
            }
        }
        self.bound_to = Some(format!("{module}/{}", param.name));
        self.valid = Some(valid);
        Ok(())
    }

    /// `Some(true)` enables, `Some(false)` disables and `None` removes the option.
    pub fn set(&mut self, name: &str, value: Option<bool>) -> Result<()> {
        if let Some(valid) = &self.valid
            && !valid.contains(name)
        {
            return Err(Error::Validation(format!("unknown option name: {name}")));
        }
        match value {
            Some(flag) => {
                self.values.insert(name.to_string(), flag);
            }
            None => {
                self.values.remove(name);
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<bool> {
        self.values.get(name).copied()
    }

    pub fn enabled(&self) -> impl Iterator<Item = &str> {
        self.values
            .iter()
            .filter(|(_, flag)| **flag)
            .map(|(name, _)| name.as_str())
    }

    pub fn disabled(&self) -> impl Iterator<Item = &str> {
        self.values
            .iter()
            .filter(|(_, flag)| !**flag)
            .map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, bool)> {
        self.values.iter().map(|(name, flag)| (name.as_str(), *flag))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn is_bound(&self) -> bool {
        self.bound_to.is_some()
    }

    /// The values as sent to the API, in name order.
    pub fn api_values(&self) -> Vec<String> {
        self.values
            .iter()
            .map(|(name, flag)| {
                if *flag {
                    name.clone()
                } else {
                    format!("!{name}")
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::OptionSet;
    use crate::error::Error;
    use crate::paraminfo::ParameterInfo;

    fn rcshow() -> ParameterInfo {
        serde_json::from_value(json!({
            "name": "show",
            "type": ["!anon", "!bot", "!minor", "anon", "bot", "minor"],
            "multi": true
        }))
        .expect("parameter")
    }

    #[test]
    fn bound_set_tracks_enabled_and_disabled() {
        let mut options = OptionSet::for_parameter("recentchanges", &rcshow()).expect("bind");
        assert!(matches!(
            options.set("invalid_name", Some(true)),
            Err(Error::Validation(_))
        ));
        options.set("anon", Some(true)).expect("set anon");
        assert_eq!(options.enabled().collect::<Vec<_>>(), vec!["anon"]);
        assert_eq!(options.disabled().count(), 0);
        assert_eq!(options.api_values(), vec!["anon"]);

        options.set("bot", Some(false)).expect("set bot");
        assert_eq!(options.len(), 2);
        assert_eq!(
            options.iter().map(|(name, _)| name).collect::<Vec<_>>(),
            vec!["anon", "bot"]
        );
        assert_eq!(options.api_values(), vec!["anon", "!bot"]);

        options.clear();
        assert!(options.is_empty());
        assert!(options.api_values().is_empty());
    }

    #[test]
    fn none_removes_option() {
        let mut options = OptionSet::new();
        options.set("a", Some(true)).expect("a");
        options.set("b", Some(false)).expect("b");
        options.set("c", None).expect("c");
        assert_eq!(options.len(), 2);
        options.set("a", None).expect("a");
        assert_eq!(options.get("a"), None);
        assert_eq!(options.get("b"), Some(false));
    }

    #[test]
    fn lazy_bind_rejects_or_clears_unknown_names() {
        let mut options = OptionSet::new();
        options.set("invalid_name", Some(true)).expect("lazy set");
        options.set("anon", Some(true)).expect("lazy set");
        assert_eq!(options.len(), 2);

        assert!(options.bind("recentchanges", &rcshow(), false).is_err());
        assert_eq!(options.len(), 2);
        assert!(!options.is_bound());

        options
            .bind("recentchanges", &rcshow(), true)
            .expect("bind clearing invalid");
        assert_eq!(options.len(), 1);
        assert!(options.bind("recentchanges", &rcshow(), true).is_err());
    }

    #[test]
    fn decode_reproduces_booleans() {
        let mut options = OptionSet::new();
        options.set("anon", Some(true)).expect("anon");
        options.set("bot", Some(false)).expect("bot");
        options.set("minor", Some(true)).expect("minor");
        let decoded = OptionSet::decode(&options.api_values());
        assert_eq!(decoded, options);
    }

    #[test]
    fn plain_string_parameter_cannot_bind() {
        let param: ParameterInfo =
            serde_json::from_value(json!({"name": "title", "type": "string"})).expect("param");
        assert!(OptionSet::for_parameter("edit", &param).is_err());
    }
}
