//! Any
//!
//! True when at least one watched item satisfies the predicate. An empty set
//! is false.

use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::store::Record;

use super::aggregate::{self, source_builders, Accumulator, AggregateSource, Contribution, Totals};
use super::{predicate, Computation, ComputationHandle, HandleArgs, Predicate};

#[derive(Debug, Clone, Default)]
pub struct Any {
    pub source: AggregateSource,
    pub callback: Option<Predicate>,
}

source_builders!(Any);

impl Any {
    pub fn matching(mut self, callback: impl Fn(&Record) -> bool + Send + Sync + 'static) -> Self {
        self.callback = Some(predicate(callback));
        self
    }
}

struct SomeMatch {
    callback: Predicate,
}

impl Accumulator for SomeMatch {
    fn contribute(&self, item: &Record) -> Contribution {
        Contribution {
            matched: (self.callback)(item),
            amount: 0.0,
        }
    }

    fn value(&self, totals: &Totals) -> Value {
        Value::Bool(totals.matched > 0)
    }
}

pub(crate) fn handle(args: HandleArgs<'_>) -> Result<Box<dyn ComputationHandle>> {
    let Computation::Any(def) = args.computation else {
        return Err(args.wrong_kind());
    };
    let callback = def
        .callback
        .clone()
        .ok_or_else(|| EngineError::missing(args.label(), "Any needs a callback"))?;
    aggregate::build(&args, &def.source, SomeMatch { callback })
}
