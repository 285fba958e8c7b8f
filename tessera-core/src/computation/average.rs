//! Average
//!
//! Mean of the numeric field at the end of `attribute_query`. Items whose field
//! is not a finite number are left out of both the sum and the count; an
//! empty set averages to `0`.

use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::store::Record;

use super::aggregate::{self, finite_at, number, source_builders, Accumulator, AggregateSource, Contribution, Totals};
use super::{Computation, ComputationHandle, HandleArgs};

#[derive(Debug, Clone, Default)]
pub struct Average {
    pub source: AggregateSource,
}

source_builders!(Average);

struct Averaging {
    path: Vec<String>,
}

impl Accumulator for Averaging {
    fn contribute(&self, item: &Record) -> Contribution {
        match finite_at(item, &self.path) {
            Some(amount) => Contribution { matched: true, amount },
            None => Contribution::default(),
        }
    }

    fn value(&self, totals: &Totals) -> Value {
        if totals.matched == 0 {
            Value::from(0)
        } else {
            number(totals.amount() / totals.matched as f64)
        }
    }
}

pub(crate) fn handle(args: HandleArgs<'_>) -> Result<Box<dyn ComputationHandle>> {
    let Computation::Average(def) = args.computation else {
        return Err(args.wrong_kind());
    };
    let path = def
        .source
        .attribute_query
        .leaf_path()
        .ok_or_else(|| EngineError::missing(args.label(), "Average needs an attribute query naming the averaged field"))?;
    aggregate::build(&args, &def.source, Averaging { path })
}
