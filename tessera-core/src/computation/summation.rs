//! Summation
//!
//! Sum of the numeric field at the end of `attribute_query`. Items whose field
//! is missing or not a finite number add `0`.

use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::store::Record;

use super::aggregate::{self, finite_at, number, source_builders, Accumulator, AggregateSource, Contribution, Totals};
use super::{Computation, ComputationHandle, HandleArgs};

#[derive(Debug, Clone, Default)]
pub struct Summation {
    pub source: AggregateSource,
}

source_builders!(Summation);

struct Summing {
    path: Vec<String>,
}

impl Accumulator for Summing {
    fn contribute(&self, item: &Record) -> Contribution {
        Contribution {
            matched: true,
            amount: finite_at(item, &self.path).unwrap_or(0.0),
        }
    }

    fn value(&self, totals: &Totals) -> Value {
        number(totals.amount())
    }
}

pub(crate) fn handle(args: HandleArgs<'_>) -> Result<Box<dyn ComputationHandle>> {
    let Computation::Summation(def) = args.computation else {
        return Err(args.wrong_kind());
    };
    let path = def
        .source
        .attribute_query
        .leaf_path()
        .ok_or_else(|| EngineError::missing(args.label(), "Summation needs an attribute query naming the summed field"))?;
    aggregate::build(&args, &def.source, Summing { path })
}
