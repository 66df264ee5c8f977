//! Shared resolution environment built at finalization.
//!
//! The worker consults [`LocalZones`] first and hands everything else to the
//! [`Resolve`] collaborator, which stands in for the module pipeline and
//! caches.

use crate::arena::{Arena, SharedCache, SuperAllocator};
use crate::config::{ConcurrencyMode, ContextConfig};
use crate::error::{ContextError, Result};
use crate::query::{Answer, Query};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// One stage of the module pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Module {
    Validator,
    Iterator,
    Dns64,
    Respip,
    Subnetcache,
}

impl FromStr for Module {
    type Err = ContextError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "validator" => Ok(Self::Validator),
            "iterator" => Ok(Self::Iterator),
            "dns64" => Ok(Self::Dns64),
            "respip" => Ok(Self::Respip),
            "subnetcache" => Ok(Self::Subnetcache),
            other => Err(ContextError::InitializationFailed(format!(
                "unknown module {other:?}"
            ))),
        }
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Validator => "validator",
            Self::Iterator => "iterator",
            Self::Dns64 => "dns64",
            Self::Respip => "respip",
            Self::Subnetcache => "subnetcache",
        })
    }
}

/// Ordered module pipeline parsed from `module-config`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleStack {
    modules: Vec<Module>,
}

impl ModuleStack {
    /// Parses a whitespace-separated module list.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::InitializationFailed`] for an empty list, an
    /// unknown module or a module listed twice.
    pub fn from_config(config: &str) -> Result<Self> {
        let mut modules = Vec::new();
        for name in config.split_whitespace() {
            let module: Module = name.parse()?;
            if modules.contains(&module) {
                return Err(ContextError::InitializationFailed(format!(
                    "module {module} listed twice"
                )));
            }
            modules.push(module);
        }
        if modules.is_empty() {
            return Err(ContextError::InitializationFailed("empty module-config".into()));
        }
        Ok(Self { modules })
    }

    #[must_use]
    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    #[must_use]
    pub fn contains(&self, module: Module) -> bool {
        self.modules.contains(&module)
    }
}

impl fmt::Display for ModuleStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, m) in self.modules.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            m.fmt(f)?;
        }
        Ok(())
    }
}

/// Module environment handed to the collaborator.
#[derive(Debug, Clone)]
pub struct ModuleEnv {
    pub mode: ConcurrencyMode,
    pub msg_cache: SharedCache,
    pub rrset_cache: SharedCache,
}

/// Locally served records, keyed by lowercased owner name and class.
#[derive(Debug, Clone, Default)]
pub struct LocalZones {
    records: BTreeMap<(String, u16), Vec<(u16, Vec<u8>)>>,
}

impl LocalZones {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, rtype: u16, class: u16, rdata: Vec<u8>) {
        self.records
            .entry((normalize(name), class))
            .or_default()
            .push((rtype, rdata));
    }

    /// Answers `query` if its name is served locally.
    ///
    /// A local name without records of the asked type yields a `NOERROR`
    /// answer without data.
    #[must_use]
    pub fn lookup(&self, query: &Query) -> Option<Answer> {
        let records = self
            .records
            .get(&(normalize(query.name()), query.class().0))?;
        let mut answer = Answer::for_query(query);
        for (rtype, rdata) in records {
            if *rtype == query.rtype().0 {
                answer = answer.with_data(rdata.clone());
            }
        }
        Some(answer)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn normalize(name: &str) -> String {
    let trimmed = name.strip_suffix('.').unwrap_or(name);
    trimmed.to_ascii_lowercase()
}

/// Everything finalization materializes, shared read-only afterwards.
#[derive(Debug, Clone)]
pub struct Environment {
    pub env: ModuleEnv,
    pub modules: ModuleStack,
    pub local_zones: LocalZones,
}

impl Environment {
    /// Builds the module pipeline, reserves the shared caches from `root`
    /// and loads local data.
    ///
    /// Nothing is reserved if the module pipeline is invalid.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::InitializationFailed`] if the module pipeline
    /// cannot be built.
    pub fn build(config: &ContextConfig, root: &mut SuperAllocator) -> Result<Self> {
        let modules = ModuleStack::from_config(&config.module_config)?;
        let env = ModuleEnv {
            mode: config.mode,
            msg_cache: root.reserve_shared(config.msg_cache_size),
            rrset_cache: root.reserve_shared(config.rrset_cache_size),
        };
        let mut local_zones = LocalZones::new();
        for data in &config.local_data {
            local_zones.insert(&data.name, data.rtype.0, data.class.0, data.rdata.clone());
        }
        Ok(Self {
            env,
            modules,
            local_zones,
        })
    }
}

/// The resolution collaborator run by the worker.
///
/// Closures `Fn(&Query) -> Result<Answer>` implement this trait directly.
pub trait Resolve: Send + Sync {
    /// Called once during finalization, before any query is resolved.
    ///
    /// # Errors
    ///
    /// A failure aborts finalization; it may be retried later.
    fn init(&self, _env: &ModuleEnv, _modules: &ModuleStack) -> Result<()> {
        Ok(())
    }

    /// Resolves one query. `arena` is scratch space valid for this call.
    ///
    /// # Errors
    ///
    /// Any error is reported to the caller; typically
    /// [`ContextError::ResolutionFailed`].
    fn resolve(&self, query: &Query, env: &ModuleEnv, arena: &mut Arena) -> Result<Answer>;
}

impl<F> Resolve for F
where
    F: Fn(&Query) -> Result<Answer> + Send + Sync,
{
    fn resolve(&self, query: &Query, _env: &ModuleEnv, _arena: &mut Arena) -> Result<Answer> {
        self(query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LocalData;
    use crate::error::ErrorCode;
    use crate::query::{RecordClass, RecordType};

    #[test]
    fn parses_default_pipeline() {
        let stack = ModuleStack::from_config("validator iterator").unwrap();
        assert_eq!(stack.modules(), &[Module::Validator, Module::Iterator]);
        assert_eq!(stack.to_string(), "validator iterator");
        assert!(stack.contains(Module::Iterator));
    }

    #[test]
    fn bad_pipelines_fail_initialization() {
        for config in ["", "   ", "iterator bogus", "iterator iterator"] {
            let err = ModuleStack::from_config(config).unwrap_err();
            assert_eq!(err.code(), ErrorCode::InitializationFailed, "{config:?}");
        }
    }

    #[test]
    fn local_zone_lookup() {
        let mut zones = LocalZones::new();
        zones.insert("Router.Home.", 1, 1, vec![192, 168, 1, 1]);

        let a = Query::new("router.home", RecordType::A, RecordClass::IN).unwrap();
        let answer = zones.lookup(&a).unwrap();
        assert_eq!(answer.data, vec![vec![192, 168, 1, 1]]);

        let aaaa = Query::new("router.home", RecordType::AAAA, RecordClass::IN).unwrap();
        let nodata = zones.lookup(&aaaa).unwrap();
        assert!(!nodata.havedata);

        let other = Query::new("elsewhere.home", RecordType::A, RecordClass::IN).unwrap();
        assert!(zones.lookup(&other).is_none());
    }

    #[test]
    fn build_reserves_caches_only_on_success() {
        let mut root = SuperAllocator::new();
        let bad = ContextConfig::new().with_module_config("nonsense");
        assert!(Environment::build(&bad, &mut root).is_err());
        assert_eq!(root.shared_reserved(), 0);

        let good = ContextConfig::new().with_local_data(LocalData {
            name: "a.test".into(),
            rtype: RecordType::A,
            class: RecordClass::IN,
            rdata: vec![10, 0, 0, 1],
        });
        let env = Environment::build(&good, &mut root).unwrap();
        assert_eq!(
            root.shared_reserved(),
            good.msg_cache_size + good.rrset_cache_size
        );
        assert_eq!(env.local_zones.len(), 1);
    }
}
