//! Count
//!
//! Number of watched items, optionally only those satisfying a predicate.

use serde_json::Value;

use crate::error::Result;
use crate::store::Record;

use super::aggregate::{self, source_builders, Accumulator, AggregateSource, Contribution, Totals};
use super::{predicate, Computation, ComputationHandle, HandleArgs, Predicate};

#[derive(Debug, Clone, Default)]
pub struct Count {
    pub source: AggregateSource,
    pub callback: Option<Predicate>,
}

source_builders!(Count);

impl Count {
    /// Count only the items for which `callback` holds.
    pub fn matching(mut self, callback: impl Fn(&Record) -> bool + Send + Sync + 'static) -> Self {
        self.callback = Some(predicate(callback));
        self
    }
}

struct Counting {
    callback: Option<Predicate>,
}

impl Accumulator for Counting {
    fn contribute(&self, item: &Record) -> Contribution {
        Contribution {
            matched: self.callback.as_ref().map_or(true, |callback| callback(item)),
            amount: 0.0,
        }
    }

    fn value(&self, totals: &Totals) -> Value {
        Value::from(totals.matched)
    }
}

pub(crate) fn handle(args: HandleArgs<'_>) -> Result<Box<dyn ComputationHandle>> {
    let Computation::Count(def) = args.computation else {
        return Err(args.wrong_kind());
    };
    let counting = Counting {
        callback: def.callback.clone(),
    };
    aggregate::build(&args, &def.source, counting)
}
