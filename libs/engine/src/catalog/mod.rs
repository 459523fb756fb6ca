//! Step catalog
//!
//! The registry of reusable steps, backed by the `catalog` aggregate.
//! Registration validates scripts, global type consistency, and the
//! acyclicity of the attribute graph before any event is emitted.

mod state;

pub use state::{CatalogState, HealthState, HealthStatus};

use std::sync::Arc;

use thiserror::Error;

use argyll_domain::Step;
use argyll_script::{ScriptError, ScriptRuntime};

use crate::events::{AggregateCache, AggregateRef, Event, StoreError};
use crate::graph::AttributeGraph;

// =============================================================================
// Errors
// =============================================================================

/// Catalog operation errors
#[derive(Debug, Error)]
pub enum CatalogError {
    /// A carried script failed to compile
    #[error("script compile failed: {0}")]
    Compile(#[from] ScriptError),

    /// An attribute name is already registered with a different type
    #[error("attribute '{attribute}' is declared {declared} but registered as {registered}")]
    TypeConflict {
        attribute: String,
        declared: String,
        registered: String,
    },

    /// Admitting the step would close a dependency cycle
    #[error("step would create a dependency cycle through: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    /// A different step with the same id already exists
    #[error("step '{0}' is already registered with a different definition")]
    DuplicateId(String),

    /// The step definition is invalid
    #[error("invalid step: {0}")]
    InvalidStep(String),

    /// The step does not exist
    #[error("step '{id}' is not registered{}", suggestion.as_ref().map(|s| format!(" (did you mean '{s}'?)")).unwrap_or_default())]
    NotFound {
        id: String,
        suggestion: Option<String>,
    },

    /// The step is a goal of at least one active flow
    #[error("step '{0}' is a goal of an active flow")]
    InUse(String),

    /// Event store failure
    #[error(transparent)]
    Store(#[from] StoreError),
}

// =============================================================================
// Catalog
// =============================================================================

/// Pure helper: the attribute graph that would result if `extra` were
/// admitted alongside the given steps. Shared by registration validation and
/// plan generation.
#[must_use]
pub fn build_dependencies<'a>(
    steps: impl Iterator<Item = &'a Step>,
    extra: Option<&'a Step>,
) -> AttributeGraph {
    AttributeGraph::build(steps, extra)
}

/// The step registry service
pub struct Catalog {
    cache: AggregateCache<CatalogState>,
    scripts: Arc<ScriptRuntime>,
}

impl Catalog {
    /// Create a catalog over its aggregate cache
    #[must_use]
    pub fn new(cache: AggregateCache<CatalogState>, scripts: Arc<ScriptRuntime>) -> Self {
        Self { cache, scripts }
    }

    fn aggregate() -> AggregateRef {
        AggregateRef::catalog()
    }

    /// Compile every script the step carries, with inputs bound by sorted
    /// attribute name. Fails without side effects.
    fn precompile(&self, step: &Step) -> Result<(), CatalogError> {
        let names: Vec<&str> = step.inputs().map(|(name, _)| name).collect();
        for spec in step.scripts() {
            self.scripts.compile(spec, &names)?;
        }
        Ok(())
    }

    /// Validations shared by register and update. Returns the admission
    /// event to emit, or `None` for an idempotent no-op.
    fn validate_admission(
        state: &CatalogState,
        step: &Step,
        replacing: bool,
    ) -> Result<Option<()>, CatalogError> {
        match state.steps.get(&step.id) {
            Some(existing) if existing == step => return Ok(None),
            Some(_) if !replacing => return Err(CatalogError::DuplicateId(step.id.clone())),
            Some(_) => {}
            None if replacing => {
                return Err(CatalogError::NotFound {
                    id: step.id.clone(),
                    suggestion: find_similar(&step.id, state.steps.keys()),
                })
            }
            None => {}
        }

        // Global type consistency, ignoring the version being replaced
        for (name, spec) in &step.attributes {
            let registered = state
                .steps
                .values()
                .filter(|s| s.id != step.id)
                .find_map(|s| s.attributes.get(name).map(|a| a.attr_type));
            if let Some(registered) = registered {
                if registered != spec.attr_type {
                    return Err(CatalogError::TypeConflict {
                        attribute: name.clone(),
                        declared: format!("{:?}", spec.attr_type).to_lowercase(),
                        registered: format!("{registered:?}").to_lowercase(),
                    });
                }
            }

            // At most one default per attribute across the catalog
            if spec.default.is_some() {
                let declarer = state
                    .steps
                    .values()
                    .filter(|s| s.id != step.id)
                    .find(|s| {
                        s.attributes
                            .get(name)
                            .is_some_and(|a| a.default.is_some())
                    });
                if let Some(declarer) = declarer {
                    return Err(CatalogError::InvalidStep(format!(
                        "attribute '{name}' already has a default declared by step '{}'",
                        declarer.id
                    )));
                }
            }
        }

        // Cycle detection over the candidate graph
        let candidate = build_dependencies(
            state.steps.values().filter(|s| s.id != step.id),
            Some(step),
        );
        let cycle = candidate.find_cycle();
        if !cycle.is_empty() {
            return Err(CatalogError::Cycle(cycle));
        }

        Ok(Some(()))
    }

    /// Register a new step.
    ///
    /// Idempotent: re-registering a byte-identical step is a no-op.
    pub async fn register_step(&self, step: Step) -> Result<(), CatalogError> {
        step.validate()
            .map_err(|e| CatalogError::InvalidStep(e.to_string()))?;
        self.precompile(&step)?;

        self.cache
            .apply(&Self::aggregate(), |state: &CatalogState, _version| {
                match Self::validate_admission(state, &step, false)? {
                    None => Ok((vec![], ())),
                    Some(()) => {
                        tracing::info!(step_id = %step.id, kind = ?step.kind(), "step registered");
                        Ok((vec![Event::StepRegistered { step: step.clone() }], ()))
                    }
                }
            })
            .await
    }

    /// Replace an existing step definition
    pub async fn update_step(&self, step: Step) -> Result<(), CatalogError> {
        step.validate()
            .map_err(|e| CatalogError::InvalidStep(e.to_string()))?;
        self.precompile(&step)?;

        self.cache
            .apply(&Self::aggregate(), |state: &CatalogState, _version| {
                match Self::validate_admission(state, &step, true)? {
                    None => Ok((vec![], ())),
                    Some(()) => {
                        tracing::info!(step_id = %step.id, "step updated");
                        Ok((vec![Event::StepUpdated { step: step.clone() }], ()))
                    }
                }
            })
            .await
    }

    /// Remove a step from the catalog.
    ///
    /// The caller is responsible for ensuring the step is not a goal of any
    /// active flow (`CatalogError::InUse` is raised at the engine surface).
    pub async fn unregister_step(&self, step_id: &str) -> Result<(), CatalogError> {
        self.cache
            .apply(&Self::aggregate(), |state: &CatalogState, _version| {
                if !state.steps.contains_key(step_id) {
                    return Err(CatalogError::NotFound {
                        id: step_id.to_string(),
                        suggestion: find_similar(step_id, state.steps.keys()),
                    });
                }
                Ok((
                    vec![Event::StepUnregistered {
                        step_id: step_id.to_string(),
                    }],
                    (),
                ))
            })
            .await
    }

    /// Record a health probe result, debounced to emit only on transitions
    pub async fn set_step_health(
        &self,
        step_id: &str,
        status: HealthStatus,
        error: Option<String>,
    ) -> Result<(), CatalogError> {
        self.cache
            .apply(&Self::aggregate(), |state: &CatalogState, _version| {
                let Some(current) = state.health.get(step_id) else {
                    return Err(CatalogError::NotFound {
                        id: step_id.to_string(),
                        suggestion: find_similar(step_id, state.steps.keys()),
                    });
                };
                if current.status == status {
                    return Ok((vec![], ()));
                }
                tracing::debug!(step_id, ?status, "step health changed");
                Ok((
                    vec![Event::StepHealthChanged {
                        step_id: step_id.to_string(),
                        status,
                        error: error.clone(),
                    }],
                    (),
                ))
            })
            .await
    }

    /// Snapshot of the whole catalog state
    pub async fn snapshot(&self) -> Result<CatalogState, CatalogError> {
        Ok(self
            .cache
            .get(&Self::aggregate())
            .await?
            .map(|(state, _)| state)
            .unwrap_or_default())
    }

    /// Fetch one step definition
    pub async fn get_step(&self, step_id: &str) -> Result<Step, CatalogError> {
        let state = self.snapshot().await?;
        state
            .steps
            .get(step_id)
            .cloned()
            .ok_or_else(|| CatalogError::NotFound {
                id: step_id.to_string(),
                suggestion: find_similar(step_id, state.steps.keys()),
            })
    }
}

/// Find a similar id for "did you mean" hints
fn find_similar<'a>(target: &str, candidates: impl Iterator<Item = &'a String>) -> Option<String> {
    let mut best: Option<String> = None;
    let mut best_distance = usize::MAX;
    for candidate in candidates {
        let distance = strsim::levenshtein(target, candidate);
        if distance < best_distance && distance <= 3 {
            best_distance = distance;
            best = Some(candidate.clone());
        }
    }
    best
}
