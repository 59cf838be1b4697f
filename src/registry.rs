//! Name → constructor tables for adaptors and functions.
//!
//! A [`Registry`] is an explicit value handed to the
//! [`PipelineBuilder`](crate::pipeline::PipelineBuilder); there is no global
//! registration.

use crate::adaptor::file::{self, FileAdaptor};
use crate::adaptor::memory::{self, MemoryAdaptor};
use crate::adaptor::{construct, Adaptor, Config};
use crate::error::{Result, TransitError};
use crate::function::{AnyFunction, BuiltinFunction, Omit, OpFilter, Pick, Skip};
use std::collections::BTreeMap;

/// Builds an adaptor from its `config` table.
pub type AdaptorFactory = Box<dyn Fn(&Config) -> Result<Box<dyn Adaptor>> + Send + Sync>;

/// Builds a function from its `config` table.
pub type FunctionFactory = Box<dyn Fn(&Config) -> Result<AnyFunction> + Send + Sync>;

/// What `transit --list` shows for an adaptor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdaptorInfo {
    pub description: String,
    pub sample_config: String,
}

impl AdaptorInfo {
    pub fn new(description: impl Into<String>, sample_config: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            sample_config: sample_config.into(),
        }
    }
}

struct AdaptorEntry {
    info: AdaptorInfo,
    factory: AdaptorFactory,
}

/// Available adaptors and functions.
#[derive(Default)]
pub struct Registry {
    adaptors: BTreeMap<String, AdaptorEntry>,
    functions: BTreeMap<String, FunctionFactory>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The adaptors (`file`, `memory`) and functions (`pick`, `omit`,
    /// `skip`, `opfilter`) shipped with transit.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_adaptor_with_info(
            "file",
            AdaptorInfo::new(file::DESCRIPTION, file::SAMPLE_CONFIG),
            |config| Ok(Box::new(FileAdaptor::from_config(config)?) as Box<dyn Adaptor>),
        );
        registry.register_adaptor_with_info(
            "memory",
            AdaptorInfo::new(memory::DESCRIPTION, memory::SAMPLE_CONFIG),
            |config| Ok(Box::new(MemoryAdaptor::from_config(config)?) as Box<dyn Adaptor>),
        );
        registry.register_function("pick", |config| {
            Ok(BuiltinFunction::Pick(construct::<Pick>(config)?).into())
        });
        registry.register_function("omit", |config| {
            Ok(BuiltinFunction::Omit(construct::<Omit>(config)?).into())
        });
        registry.register_function("skip", |config| {
            Ok(BuiltinFunction::Skip(construct::<Skip>(config)?).into())
        });
        registry.register_function("opfilter", |config| {
            Ok(BuiltinFunction::OpFilter(construct::<OpFilter>(config)?).into())
        });
        registry
    }

    /// Register (or replace) the adaptor called `name`.
    pub fn register_adaptor<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&Config) -> Result<Box<dyn Adaptor>> + Send + Sync + 'static,
    {
        self.register_adaptor_with_info(name, AdaptorInfo::default(), factory);
    }

    /// Register (or replace) the adaptor called `name` along with its listing.
    pub fn register_adaptor_with_info<F>(
        &mut self,
        name: impl Into<String>,
        info: AdaptorInfo,
        factory: F,
    ) where
        F: Fn(&Config) -> Result<Box<dyn Adaptor>> + Send + Sync + 'static,
    {
        self.adaptors.insert(
            name.into(),
            AdaptorEntry {
                info,
                factory: Box::new(factory),
            },
        );
    }

    /// Register (or replace) the function called `name`.
    pub fn register_function<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&Config) -> Result<AnyFunction> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Box::new(factory));
    }

    pub fn adaptor(&self, name: &str, config: &Config) -> Result<Box<dyn Adaptor>> {
        let entry = self
            .adaptors
            .get(name)
            .ok_or_else(|| TransitError::AdaptorNotFound(name.to_string()))?;
        (entry.factory)(config).map_err(|e| e.with_context(format!("Building adaptor '{}'", name)))
    }

    /// Description and sample config of `name`, without building it.
    pub fn adaptor_info(&self, name: &str) -> Option<&AdaptorInfo> {
        self.adaptors.get(name).map(|entry| &entry.info)
    }

    pub fn function(&self, name: &str, config: &Config) -> Result<AnyFunction> {
        let factory = self
            .functions
            .get(name)
            .ok_or_else(|| TransitError::FunctionNotFound(name.to_string()))?;
        factory(config).map_err(|e| e.with_context(format!("Building function '{}'", name)))
    }

    pub fn adaptor_names(&self) -> impl Iterator<Item = &str> {
        self.adaptors.keys().map(String::as_str)
    }

    pub fn function_names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("adaptors", &self.adaptors.keys().collect::<Vec<_>>())
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{document, Op, Record};
    use serde_json::json;

    fn config(value: serde_json::Value) -> Config {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_builtins() {
        let registry = Registry::with_builtins();
        assert_eq!(registry.adaptor_names().collect::<Vec<_>>(), vec!["file", "memory"]);
        assert_eq!(
            registry.function_names().collect::<Vec<_>>(),
            vec!["omit", "opfilter", "pick", "skip"]
        );
    }

    #[test]
    fn test_lookup_errors() {
        let registry = Registry::with_builtins();
        assert!(matches!(
            registry.adaptor("mongodb", &Config::new()),
            Err(TransitError::AdaptorNotFound(name)) if name == "mongodb"
        ));
        assert!(matches!(
            registry.function("js", &Config::new()),
            Err(TransitError::FunctionNotFound(_))
        ));
        assert!(registry.adaptor("file", &config(json!({"uri": "ftp://x"}))).is_err());
    }

    #[test]
    fn test_adaptor_info_without_config() {
        let registry = Registry::with_builtins();
        // file needs a uri to build, its listing must not
        assert!(registry.adaptor("file", &Config::new()).is_err());
        let info = registry.adaptor_info("file").unwrap();
        assert_eq!(info.description, file::DESCRIPTION);
        assert!(info.sample_config.contains("type = \"file\""));
        assert!(registry.adaptor_info("memory").unwrap().sample_config.contains("memory"));
        assert!(registry.adaptor_info("mongodb").is_none());

        let mut registry = Registry::new();
        registry.register_adaptor("custom", |_| {
            Ok(Box::new(MemoryAdaptor::sink()) as Box<dyn Adaptor>)
        });
        assert_eq!(registry.adaptor_info("custom"), Some(&AdaptorInfo::default()));
    }

    #[test]
    fn test_function_from_config() {
        let registry = Registry::with_builtins();
        let pick = registry
            .function("pick", &config(json!({"fields": ["_id"]})))
            .unwrap();
        assert_eq!(pick.name(), "pick");
        let record = Record::new(Op::Insert, "a.b", document(json!({"_id": 1, "x": 2})));
        let out = pick.apply(record).unwrap().unwrap();
        assert_eq!(out.document.len(), 1);
    }

    #[test]
    fn test_register_replaces() {
        let mut registry = Registry::with_builtins();
        let sink = MemoryAdaptor::sink();
        let shared = sink.clone();
        registry.register_adaptor("memory", move |_| Ok(Box::new(shared.clone()) as Box<dyn Adaptor>));
        let adaptor = registry.adaptor("memory", &Config::new()).unwrap();
        assert_eq!(adaptor.description(), sink.description());
    }
}
