//! WeightedSummation
//!
//! Sum of `weight * value` over the watched items, both produced by a callback.
//! A non-finite product adds `0`.

use std::sync::Arc;

use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::store::Record;

use super::aggregate::{self, number, source_builders, Accumulator, AggregateSource, Contribution, Totals};
use super::{Callback, Computation, ComputationHandle, HandleArgs};

/// One item's weight and value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Weighted {
    pub weight: f64,
    pub value: f64,
}

impl Weighted {
    pub fn new(weight: f64, value: f64) -> Self {
        Self { weight, value }
    }
}

pub type WeightFn = Callback<dyn Fn(&Record) -> Weighted + Send + Sync>;

#[derive(Debug, Clone, Default)]
pub struct WeightedSummation {
    pub source: AggregateSource,
    pub callback: Option<WeightFn>,
}

source_builders!(WeightedSummation);

impl WeightedSummation {
    pub fn weighing(mut self, callback: impl Fn(&Record) -> Weighted + Send + Sync + 'static) -> Self {
        let callback: Arc<dyn Fn(&Record) -> Weighted + Send + Sync> = Arc::new(callback);
        self.callback = Some(Callback::from_arc(callback));
        self
    }
}

struct Weighing {
    callback: WeightFn,
}

impl Accumulator for Weighing {
    fn contribute(&self, item: &Record) -> Contribution {
        let Weighted { weight, value } = (self.callback)(item);
        let amount = weight * value;
        Contribution {
            matched: true,
            amount: if amount.is_finite() { amount } else { 0.0 },
        }
    }

    fn value(&self, totals: &Totals) -> Value {
        number(totals.amount())
    }
}

pub(crate) fn handle(args: HandleArgs<'_>) -> Result<Box<dyn ComputationHandle>> {
    let Computation::WeightedSummation(def) = args.computation else {
        return Err(args.wrong_kind());
    };
    let callback = def
        .callback
        .clone()
        .ok_or_else(|| EngineError::missing(args.label(), "WeightedSummation needs a weight callback"))?;
    aggregate::build(&args, &def.source, Weighing { callback })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn non_finite_products_count_as_zero() {
        let weighing = Weighing {
            callback: WeightedSummation::default()
                .weighing(|r| Weighted::new(r.get("w").and_then(Value::as_f64).unwrap_or(f64::NAN), 2.0))
                .callback
                .unwrap(),
        };
        let heavy = Record::from_value(json!({"id": 1, "w": 3})).unwrap();
        let broken = Record::from_value(json!({"id": 2})).unwrap();
        assert_eq!(weighing.contribute(&heavy).amount, 6.0);
        assert_eq!(weighing.contribute(&broken).amount, 0.0);
    }
}
