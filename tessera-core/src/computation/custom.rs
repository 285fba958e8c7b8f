//! Custom
//!
//! A computation written as closures. It declares its own data dependencies
//! and is the only built-in kind that may suspend with
//! [`ComputationResult::Async`].

use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;

use crate::error::{BoxError, EngineError, Result};
use crate::store::MutationEvent;

use super::{
    Callback, Computation, ComputationHandle, ComputationResult, ComputeContext, DataContext, DataDep, HandleArgs,
};

pub type ComputeFn =
    Callback<dyn Fn(&ComputeContext<'_>) -> std::result::Result<ComputationResult, BoxError> + Send + Sync>;

pub type IncrementalFn = Callback<
    dyn Fn(&ComputeContext<'_>, &Value, &MutationEvent) -> std::result::Result<ComputationResult, BoxError>
        + Send
        + Sync,
>;

/// Receives the external result and the arguments stored with the task.
pub type AsyncReturnFn =
    Callback<dyn Fn(&ComputeContext<'_>, Value, &Value) -> std::result::Result<ComputationResult, BoxError> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct Custom {
    pub deps: IndexMap<String, DataDep>,
    pub compute: Option<ComputeFn>,
    pub incremental: Option<IncrementalFn>,
    pub async_return: Option<AsyncReturnFn>,
    pub use_last_value: bool,
}

impl Default for Custom {
    fn default() -> Self {
        Self {
            deps: IndexMap::new(),
            compute: None,
            incremental: None,
            async_return: None,
            use_last_value: true,
        }
    }
}

impl Custom {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dep(mut self, name: impl Into<String>, dep: DataDep) -> Self {
        self.deps.insert(name.into(), dep);
        self
    }

    pub fn compute(
        mut self,
        f: impl Fn(&ComputeContext<'_>) -> std::result::Result<ComputationResult, BoxError> + Send + Sync + 'static,
    ) -> Self {
        let f: Arc<dyn Fn(&ComputeContext<'_>) -> std::result::Result<ComputationResult, BoxError> + Send + Sync> =
            Arc::new(f);
        self.compute = Some(Callback::from_arc(f));
        self
    }

    pub fn incremental(
        mut self,
        f: impl Fn(&ComputeContext<'_>, &Value, &MutationEvent) -> std::result::Result<ComputationResult, BoxError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        let f: Arc<
            dyn Fn(&ComputeContext<'_>, &Value, &MutationEvent) -> std::result::Result<ComputationResult, BoxError>
                + Send
                + Sync,
        > = Arc::new(f);
        self.incremental = Some(Callback::from_arc(f));
        self
    }

    pub fn on_async_return(
        mut self,
        f: impl Fn(&ComputeContext<'_>, Value, &Value) -> std::result::Result<ComputationResult, BoxError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        let f: Arc<
            dyn Fn(&ComputeContext<'_>, Value, &Value) -> std::result::Result<ComputationResult, BoxError> + Send + Sync,
        > = Arc::new(f);
        self.async_return = Some(Callback::from_arc(f));
        self
    }

    pub fn use_last_value(mut self, use_last_value: bool) -> Self {
        self.use_last_value = use_last_value;
        self
    }
}

struct CustomHandle {
    label: String,
    context: DataContext,
    def: Custom,
    compute: ComputeFn,
}

pub(crate) fn handle(args: HandleArgs<'_>) -> Result<Box<dyn ComputationHandle>> {
    let Computation::Custom(def) = args.computation else {
        return Err(args.wrong_kind());
    };
    let compute = def
        .compute
        .clone()
        .ok_or_else(|| EngineError::missing(args.label(), "Custom needs a compute closure"))?;
    Ok(Box::new(CustomHandle {
        label: args.label(),
        context: args.context.clone(),
        def: def.clone(),
        compute,
    }))
}

impl ComputationHandle for CustomHandle {
    fn data_context(&self) -> &DataContext {
        &self.context
    }

    fn data_deps(&self) -> &IndexMap<String, DataDep> {
        &self.def.deps
    }

    fn use_last_value(&self) -> bool {
        self.def.use_last_value
    }

    fn compute(&self, cx: &ComputeContext<'_>) -> Result<ComputationResult> {
        (self.compute)(cx).map_err(|err| EngineError::callback(self.label.clone(), err))
    }

    fn incremental_compute(
        &self,
        cx: &ComputeContext<'_>,
        last_value: &Value,
        event: &MutationEvent,
    ) -> Result<ComputationResult> {
        match &self.def.incremental {
            Some(incremental) => {
                incremental(cx, last_value, event).map_err(|err| EngineError::callback(self.label.clone(), err))
            }
            None => Ok(ComputationResult::full_recompute(format!(
                "{} has no incremental closure",
                self.label
            ))),
        }
    }

    fn async_return(&self, cx: &ComputeContext<'_>, result: Value, args: &Value) -> Result<ComputationResult> {
        let Some(async_return) = &self.def.async_return else {
            return Err(EngineError::AsyncUnsupported(self.label.clone()));
        };
        async_return(cx, result, args).map_err(|err| EngineError::callback(self.label.clone(), err))
    }
}
