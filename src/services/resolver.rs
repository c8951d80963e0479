//! Routine resolver - per-category candidate chains

use std::sync::Arc;

use tracing::{debug, error};

use crate::error::StorageError;
use crate::routines::{Category, DataCaptureRoutines, RoutineOverrides};

use super::registry::ProviderRegistry;

/// Name of the built-in routines in chains and logs
pub const DEFAULT_ROUTINES: &str = "default";

/// One routine implementation eligible for a category
#[derive(Clone)]
pub struct Candidate {
    pub provider: String,
    pub routines: Arc<dyn DataCaptureRoutines>,
}

impl std::fmt::Debug for Candidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Candidate").field("provider", &self.provider).finish()
    }
}

/// Ordered candidates for each category, default routines last
#[derive(Debug, Clone)]
pub struct RoutineChains {
    chains: [Vec<Candidate>; 5],
    default: Candidate,
}

impl RoutineChains {
    /// Chains holding only the default routines
    pub fn new(default: Arc<dyn DataCaptureRoutines>) -> Self {
        Self {
            chains: Default::default(),
            default: Candidate {
                provider: DEFAULT_ROUTINES.to_string(),
                routines: default,
            },
        }
    }

    /// Append an override candidate behind those already pushed
    pub fn push_override(
        &mut self,
        provider: impl Into<String>,
        routines: Arc<dyn DataCaptureRoutines>,
        overrides: RoutineOverrides,
    ) {
        let provider = provider.into();
        for category in overrides.categories() {
            self.chains[index(category)].push(Candidate {
                provider: provider.clone(),
                routines: routines.clone(),
            });
        }
    }

    /// Override candidates followed by the default
    pub fn chain(&self, category: Category) -> impl Iterator<Item = &Candidate> {
        self.chains[index(category)].iter().chain(std::iter::once(&self.default))
    }

    pub fn providers_for(&self, category: Category) -> Vec<&str> {
        self.chain(category).map(|c| c.provider.as_str()).collect()
    }
}

fn index(category: Category) -> usize {
    match category {
        Category::UserData => 0,
        Category::UdfData => 1,
        Category::MemberData => 2,
        Category::LpPeriod => 3,
        Category::ObjectData => 4,
    }
}

/// Builds chains from the registry on every call
pub struct RoutineResolver {
    registry: Arc<ProviderRegistry>,
    default: Arc<dyn DataCaptureRoutines>,
}

impl RoutineResolver {
    pub fn new(registry: Arc<ProviderRegistry>, default: Arc<dyn DataCaptureRoutines>) -> Self {
        Self { registry, default }
    }

    pub fn default_routines(&self) -> &Arc<dyn DataCaptureRoutines> {
        &self.default
    }

    /// Most recently registered providers come first
    pub fn resolve(&self) -> Result<RoutineChains, StorageError> {
        let mut providers = self.registry.providers()?;
        providers.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let mut chains = RoutineChains::new(self.default.clone());

        for provider in providers {
            if !provider.has_overrides || !provider.active_overrides.any() {
                continue;
            }

            match self.registry.table().instantiate(&provider.path, self.registry.context()) {
                Ok(routines) => {
                    chains.push_override(provider.name.clone(), routines, provider.active_overrides);
                }
                Err(e) => {
                    error!(
                        provider = %provider.name,
                        namespace = %provider.namespace,
                        path = %provider.path,
                        error = %e,
                        "Cannot load provider routines, skipping"
                    );
                }
            }
        }

        debug!(
            object_data = ?chains.providers_for(Category::ObjectData),
            user_data = ?chains.providers_for(Category::UserData),
            "Resolved capture routine chains"
        );

        Ok(chains)
    }
}
