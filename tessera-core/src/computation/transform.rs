//! Transform
//!
//! Derives records of the context's entity or relation from the records of a
//! source. Each source record maps to at most one derived record, which
//! carries the source id under `_source` so later changes can find it.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::store::{AttributeQuery, Fields, MatchExpr, Modifier, MutationEvent, MutationKind, Record, RecordId};

use super::{
    Callback, Computation, ComputationHandle, ComputationResult, ComputeContext, DataContext, DataDep, HandleArgs,
    RecordPatch,
};

/// Field of a derived record naming its source.
pub const SOURCE_FIELD: &str = "_source";

const SOURCE_DEP: &str = "source";

pub type TransformFn = Callback<dyn Fn(&Record) -> Option<Fields> + Send + Sync>;

#[derive(Debug, Clone, Default)]
pub struct Transform {
    pub record: Option<String>,
    pub attribute_query: AttributeQuery,
    pub callback: Option<TransformFn>,
}

impl Transform {
    pub fn record(record: impl Into<String>) -> Self {
        Self {
            record: Some(record.into()),
            ..Self::default()
        }
    }

    pub fn attribute_query(mut self, query: AttributeQuery) -> Self {
        self.attribute_query = query;
        self
    }

    /// Map a source record to the derived record's data, or to nothing.
    pub fn map(mut self, callback: impl Fn(&Record) -> Option<Fields> + Send + Sync + 'static) -> Self {
        let callback: Arc<dyn Fn(&Record) -> Option<Fields> + Send + Sync> = Arc::new(callback);
        self.callback = Some(Callback::from_arc(callback));
        self
    }
}

struct TransformHandle {
    label: String,
    context: DataContext,
    source: String,
    target: String,
    query: AttributeQuery,
    deps: IndexMap<String, DataDep>,
    callback: TransformFn,
}

pub(crate) fn handle(args: HandleArgs<'_>) -> Result<Box<dyn ComputationHandle>> {
    let Computation::Transform(def) = args.computation else {
        return Err(args.wrong_kind());
    };
    let target = match &args.context {
        DataContext::Entity { entity } => entity.clone(),
        DataContext::Relation { relation } => relation.clone(),
        _ => return Err(args.wrong_kind()),
    };
    let source = def
        .record
        .clone()
        .ok_or_else(|| EngineError::missing(args.label(), "Transform needs a source `record`"))?;
    let callback = def
        .callback
        .clone()
        .ok_or_else(|| EngineError::missing(args.label(), "Transform needs a mapping callback"))?;

    let query = if def.attribute_query.is_empty() {
        AttributeQuery::all()
    } else {
        def.attribute_query.clone()
    };
    let mut deps = IndexMap::new();
    deps.insert(
        SOURCE_DEP.to_string(),
        DataDep::Records {
            source: source.clone(),
            query: query.clone(),
        },
    );

    Ok(Box::new(TransformHandle {
        label: args.label(),
        context: args.context.clone(),
        source,
        target,
        query,
        deps,
        callback,
    }))
}

impl TransformHandle {
    fn derive(&self, source: &Record, id: RecordId) -> Option<Fields> {
        let mut data = (self.callback)(source)?;
        data.insert(SOURCE_FIELD.to_string(), id.into());
        Some(data)
    }

    /// Patch turning `existing` into `derived`.
    fn reconcile(&self, existing: Option<&Record>, derived: Option<Fields>) -> Option<RecordPatch> {
        match (existing, derived) {
            (None, None) => None,
            (None, Some(data)) => Some(RecordPatch::Create { data }),
            (Some(record), None) => record.id().map(|id| RecordPatch::Delete {
                matching: MatchExpr::id(id),
            }),
            (Some(record), Some(data)) => {
                let id = record.id()?;
                let changed = data.iter().any(|(key, value)| record.get(key) != Some(value));
                changed.then(|| RecordPatch::Update {
                    matching: MatchExpr::id(id),
                    data,
                })
            }
        }
    }

    fn derived_records(&self, cx: &ComputeContext<'_>, matcher: &MatchExpr) -> Result<Vec<Record>> {
        Ok(cx
            .store
            .find(&self.target, matcher, &Modifier::default(), &AttributeQuery::all())?)
    }
}

fn patches_or_skip(patches: Vec<RecordPatch>) -> ComputationResult {
    if patches.is_empty() {
        ComputationResult::Skip
    } else {
        ComputationResult::Patches(patches)
    }
}

impl ComputationHandle for TransformHandle {
    fn data_context(&self) -> &DataContext {
        &self.context
    }

    fn data_deps(&self) -> &IndexMap<String, DataDep> {
        &self.deps
    }

    fn use_last_value(&self) -> bool {
        false
    }

    fn compute(&self, cx: &ComputeContext<'_>) -> Result<ComputationResult> {
        let sources = cx.records(SOURCE_DEP)?;
        let mut existing: HashMap<RecordId, Record> = HashMap::new();
        let mut patches = Vec::new();

        for record in self.derived_records(cx, &MatchExpr::All)? {
            let Some(id) = record.id() else { continue };
            match record.get(SOURCE_FIELD).and_then(RecordId::from_value) {
                Some(source) if !existing.contains_key(&source) => {
                    existing.insert(source, record);
                }
                // Not ours, or a duplicate left behind.
                Some(_) => patches.push(RecordPatch::Delete {
                    matching: MatchExpr::id(id),
                }),
                None => {}
            }
        }

        for source in &sources {
            let Some(id) = source.id() else { continue };
            let derived = self.derive(source, id);
            if let Some(patch) = self.reconcile(existing.remove(&id).as_ref(), derived) {
                patches.push(patch);
            }
        }
        for orphan in existing.values() {
            if let Some(patch) = self.reconcile(Some(orphan), None) {
                patches.push(patch);
            }
        }
        Ok(patches_or_skip(patches))
    }

    fn incremental_compute(
        &self,
        cx: &ComputeContext<'_>,
        _last_value: &Value,
        event: &MutationEvent,
    ) -> Result<ComputationResult> {
        if event.record_name != self.source || !event.related_attribute.is_empty() {
            return Ok(ComputationResult::full_recompute(format!(
                "{} only follows direct changes to `{}`",
                self.label, self.source
            )));
        }
        let Some(id) = event.record.id() else {
            return Ok(ComputationResult::full_recompute("event record has no id"));
        };

        let existing = self.derived_records(cx, &MatchExpr::eq(SOURCE_FIELD, id))?;
        let derived = match event.kind {
            MutationKind::Delete => None,
            MutationKind::Create | MutationKind::Update => cx
                .store
                .find_one(&self.source, &MatchExpr::id(id), &self.query)?
                .and_then(|source| self.derive(&source, id)),
        };

        let mut patches: Vec<RecordPatch> = self.reconcile(existing.first(), derived).into_iter().collect();
        for duplicate in existing.iter().skip(1) {
            patches.extend(self.reconcile(Some(duplicate), None));
        }
        Ok(patches_or_skip(patches))
    }
}
