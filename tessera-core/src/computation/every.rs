//! Every
//!
//! True when every watched item satisfies the predicate. An empty set is
//! vacuously true unless `not_empty` is set.

use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::store::Record;

use super::aggregate::{self, source_builders, Accumulator, AggregateSource, Contribution, Totals};
use super::{predicate, Computation, ComputationHandle, HandleArgs, Predicate};

#[derive(Debug, Clone, Default)]
pub struct Every {
    pub source: AggregateSource,
    pub callback: Option<Predicate>,
    /// Report `false` instead of `true` for an empty set.
    pub not_empty: bool,
}

source_builders!(Every);

impl Every {
    pub fn matching(mut self, callback: impl Fn(&Record) -> bool + Send + Sync + 'static) -> Self {
        self.callback = Some(predicate(callback));
        self
    }

    pub fn not_empty(mut self, not_empty: bool) -> Self {
        self.not_empty = not_empty;
        self
    }
}

struct AllMatch {
    callback: Predicate,
    not_empty: bool,
}

impl Accumulator for AllMatch {
    fn contribute(&self, item: &Record) -> Contribution {
        Contribution {
            matched: (self.callback)(item),
            amount: 0.0,
        }
    }

    fn value(&self, totals: &Totals) -> Value {
        if totals.total == 0 {
            Value::Bool(!self.not_empty)
        } else {
            Value::Bool(totals.matched == totals.total)
        }
    }
}

pub(crate) fn handle(args: HandleArgs<'_>) -> Result<Box<dyn ComputationHandle>> {
    let Computation::Every(def) = args.computation else {
        return Err(args.wrong_kind());
    };
    let callback = def
        .callback
        .clone()
        .ok_or_else(|| EngineError::missing(args.label(), "Every needs a callback"))?;
    let all_match = AllMatch {
        callback,
        not_empty: def.not_empty,
    };
    aggregate::build(&args, &def.source, all_match)
}
