//! The write-once table mapping configuration to provider constructors
//!
//! Populated with the built-in families at first access and read-only from
//! then on; this is the one global the crate allows itself. Everything else
//! (configuration, caches, engines) is passed by value.

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;

use crate::config::BackendConfig;
use crate::error::{CbError, CbResult};
use crate::providers::caldav::CalDavRemote;
use crate::providers::markdown::MarkdownRepo;
use crate::providers::memory::MemorySource;
use crate::providers::rest::RestRemote;
use crate::traits::TaskSource;

pub type BoxedSource = Box<dyn TaskSource + Send + Sync>;

/// Builds a provider for one configured backend
pub type SourceConstructor = fn(&BackendConfig) -> CbResult<BoxedSource>;

pub struct ProviderRegistry {
    by_scheme: HashMap<String, SourceConstructor>,
    by_type_tag: HashMap<String, SourceConstructor>,
    auto_detectable: HashSet<String>,
}

fn caldav_ctor(config: &BackendConfig) -> CbResult<BoxedSource> {
    Ok(Box::new(CalDavRemote::new(config)?))
}

fn rest_ctor(config: &BackendConfig) -> CbResult<BoxedSource> {
    Ok(Box::new(RestRemote::new(config)?))
}

fn markdown_ctor(config: &BackendConfig) -> CbResult<BoxedSource> {
    Ok(Box::new(MarkdownRepo::new(config)?))
}

fn memory_ctor(config: &BackendConfig) -> CbResult<BoxedSource> {
    Ok(Box::new(MemorySource::shared(&config.name)))
}

impl ProviderRegistry {
    /// The registry with every built-in provider family
    pub fn builtin() -> Self {
        let mut registry = Self {
            by_scheme: HashMap::new(),
            by_type_tag: HashMap::new(),
            auto_detectable: HashSet::new(),
        };
        registry.register("caldav", &["caldav", "dav"], caldav_ctor, false);
        registry.register("rest", &["rest"], rest_ctor, false);
        registry.register("markdown", &["file"], markdown_ctor, true);
        registry.register("memory", &["memory"], memory_ctor, false);
        registry
    }

    fn register(
        &mut self,
        type_tag: &str,
        schemes: &[&str],
        constructor: SourceConstructor,
        auto_detectable: bool,
    ) {
        self.by_type_tag.insert(type_tag.to_string(), constructor);
        for scheme in schemes {
            self.by_scheme.insert(scheme.to_string(), constructor);
        }
        if auto_detectable {
            self.auto_detectable.insert(type_tag.to_string());
        }
    }

    pub fn by_type_tag(&self, tag: &str) -> CbResult<SourceConstructor> {
        self.by_type_tag
            .get(tag)
            .copied()
            .ok_or_else(|| CbError::UnsupportedProvider {
                key: tag.to_string(),
            })
    }

    pub fn by_scheme(&self, scheme: &str) -> CbResult<SourceConstructor> {
        self.by_scheme
            .get(scheme)
            .copied()
            .ok_or_else(|| CbError::UnsupportedProvider {
                key: scheme.to_string(),
            })
    }

    /// Whether this family can introspect the environment to decide whether
    /// it applies (the markdown provider looking for its opt-in marker)
    pub fn is_auto_detectable(&self, type_tag: &str) -> bool {
        self.auto_detectable.contains(type_tag)
    }

    /// Build the provider for a backend: its type tag picks the family, or
    /// failing that the scheme of its configured URL
    pub fn construct(&self, config: &BackendConfig) -> CbResult<BoxedSource> {
        if let Ok(constructor) = self.by_type_tag(&config.type_tag) {
            return constructor(config);
        }
        if let Some(scheme) = config
            .url
            .as_deref()
            .and_then(|u| url::Url::parse(u).ok())
            .map(|u| u.scheme().to_string())
        {
            if let Ok(constructor) = self.by_scheme(&scheme) {
                return constructor(config);
            }
        }
        Err(CbError::UnsupportedProvider {
            key: config.type_tag.clone(),
        })
    }
}

static REGISTRY: Lazy<ProviderRegistry> = Lazy::new(ProviderRegistry::builtin);

/// The process-wide registry
pub fn global() -> &'static ProviderRegistry {
    &REGISTRY
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn builtin_families_resolve_by_tag_and_scheme() {
        let registry = ProviderRegistry::builtin();
        assert!(registry.by_type_tag("caldav").is_ok());
        assert!(registry.by_type_tag("rest").is_ok());
        assert!(registry.by_type_tag("markdown").is_ok());
        assert!(registry.by_scheme("dav").is_ok());
        assert!(registry.by_scheme("memory").is_ok());
        assert!(registry.is_auto_detectable("markdown"));
        assert!(!registry.is_auto_detectable("caldav"));
    }

    #[test]
    fn unknown_keys_report_unsupported_provider() {
        let registry = ProviderRegistry::builtin();
        let err = registry.by_type_tag("gopher").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }

    #[test]
    fn construct_prefers_the_type_tag_then_the_scheme() {
        let registry = ProviderRegistry::builtin();

        let by_tag = BackendConfig::new("mem-reg", "memory");
        let source = registry.construct(&by_tag).unwrap();
        assert_eq!(source.type_tag(), "memory");

        let mut by_scheme = BackendConfig::new("mem-reg-2", "");
        by_scheme.url = Some("memory://mem-reg-2".into());
        let source = registry.construct(&by_scheme).unwrap();
        assert_eq!(source.type_tag(), "memory");

        let unknown = BackendConfig::new("x", "gopher");
        assert!(registry.construct(&unknown).is_err());
    }
}
