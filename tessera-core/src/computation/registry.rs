//! Handle Registry
//!
//! Maps a `(computation kind, context kind)` pair to the factory building its
//! handle. The built-in table covers every kind in the contexts it supports;
//! applications may register their own factories or override built-in ones.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{EngineError, Result};

use super::{any, average, count, custom, every, state_machine, summation, transform, weighted};
use super::{ComputationHandle, ComputationKind, ContextKind, HandleArgs};

pub type HandleFactory = Arc<dyn Fn(HandleArgs<'_>) -> Result<Box<dyn ComputationHandle>> + Send + Sync>;

#[derive(Clone)]
pub struct HandleRegistry {
    factories: HashMap<(ComputationKind, ContextKind), HandleFactory>,
}

impl fmt::Debug for HandleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<String> = self
            .factories
            .keys()
            .map(|(kind, context)| format!("{kind}/{context}"))
            .collect();
        keys.sort();
        f.debug_struct("HandleRegistry").field("factories", &keys).finish()
    }
}

impl Default for HandleRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl HandleRegistry {
    /// A registry with no factories at all.
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        let aggregates: [(ComputationKind, fn(HandleArgs<'_>) -> Result<Box<dyn ComputationHandle>>); 6] = [
            (ComputationKind::Count, count::handle),
            (ComputationKind::Summation, summation::handle),
            (ComputationKind::Average, average::handle),
            (ComputationKind::Every, every::handle),
            (ComputationKind::Any, any::handle),
            (ComputationKind::WeightedSummation, weighted::handle),
        ];
        for (kind, factory) in aggregates {
            registry.register(kind, ContextKind::Global, factory);
            registry.register(kind, ContextKind::Property, factory);
        }
        for context in [
            ContextKind::Global,
            ContextKind::Property,
            ContextKind::Entity,
            ContextKind::Relation,
        ] {
            registry.register(ComputationKind::StateMachine, context, state_machine::handle);
        }
        registry.register(ComputationKind::Transform, ContextKind::Entity, transform::handle);
        registry.register(ComputationKind::Transform, ContextKind::Relation, transform::handle);
        registry.register(ComputationKind::Custom, ContextKind::Global, custom::handle);
        registry.register(ComputationKind::Custom, ContextKind::Property, custom::handle);
        registry
    }

    /// Register `factory`, replacing whatever was registered for the pair.
    pub fn register(
        &mut self,
        kind: ComputationKind,
        context: ContextKind,
        factory: impl Fn(HandleArgs<'_>) -> Result<Box<dyn ComputationHandle>> + Send + Sync + 'static,
    ) -> &mut Self {
        self.factories.insert((kind, context), Arc::new(factory));
        self
    }

    pub fn contains(&self, kind: ComputationKind, context: ContextKind) -> bool {
        self.factories.contains_key(&(kind, context))
    }

    pub fn build(&self, args: HandleArgs<'_>) -> Result<Box<dyn ComputationHandle>> {
        let key = (args.computation.kind(), args.context.kind());
        let factory = self.factories.get(&key).ok_or_else(|| EngineError::UnregisteredHandle {
            kind: key.0.to_string(),
            context: key.1.to_string(),
        })?;
        factory(args)
    }
}
