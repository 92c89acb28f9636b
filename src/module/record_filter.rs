//! Row-level filtering: copies matching rows into fresh extents.

use std::sync::Arc;

use super::{ExtentModule, StageState};
use crate::error::Result;
use crate::extent::{Extent, ExtentSeries, FieldValue, GeneralField};
use crate::interfaces::{ExpressionEvaluator, RowExpression};
use crate::schema::ExtentSchema;

/// Predicate over the value of one field.
pub type RowPredicate = Arc<dyn for<'a> Fn(&FieldValue<'a>) -> bool + Send + Sync>;

enum Matcher {
    Field {
        field: GeneralField,
        predicate: RowPredicate,
    },
    Expression {
        evaluator: Arc<dyn ExpressionEvaluator>,
        text: String,
        compiled: Option<(Arc<ExtentSchema>, Box<dyn RowExpression>)>,
    },
}

impl Matcher {
    fn prepare(&mut self, schema: &Arc<ExtentSchema>) -> Result<()> {
        match self {
            Matcher::Field { field, .. } => field.bind(schema),
            Matcher::Expression {
                evaluator,
                text,
                compiled,
            } => {
                if !matches!(compiled, Some((bound, _)) if Arc::ptr_eq(bound, schema)) {
                    *compiled = Some((Arc::clone(schema), evaluator.compile(schema, text)?));
                }
                Ok(())
            }
        }
    }

    fn matches(&self, series: &ExtentSeries) -> bool {
        match self {
            Matcher::Field { field, predicate } => predicate(&field.get(series)),
            Matcher::Expression { compiled, .. } => compiled
                .as_ref()
                .is_some_and(|(_, expression)| expression.matches(series)),
        }
    }
}

/// Rows of `extent` whose `field` value satisfies `predicate`.
pub(crate) fn filter_rows(
    extent: &Extent,
    field: &GeneralField,
    predicate: &dyn for<'a> Fn(&FieldValue<'a>) -> bool,
) -> Extent {
    let mut out = Extent::new(Arc::clone(extent.schema()));
    for row in 0..extent.row_count() {
        if predicate(&field.get_at(extent, row)) {
            out.copy_row_from(extent, row);
        }
    }
    out
}

pub struct RecordFilterModule {
    upstream: Box<dyn ExtentModule>,
    matcher: Matcher,
    state: StageState,
}

impl RecordFilterModule {
    pub fn new<F>(upstream: Box<dyn ExtentModule>, field: &str, predicate: F) -> Self
    where
        F: for<'a> Fn(&FieldValue<'a>) -> bool + Send + Sync + 'static,
    {
        Self {
            upstream,
            matcher: Matcher::Field {
                field: GeneralField::new(field),
                predicate: Arc::new(predicate),
            },
            state: StageState::Unstarted,
        }
    }

    /// Filter with an expression compiled once per upstream schema.
    pub fn with_expression(
        upstream: Box<dyn ExtentModule>,
        evaluator: Arc<dyn ExpressionEvaluator>,
        text: &str,
    ) -> Self {
        Self {
            upstream,
            matcher: Matcher::Expression {
                evaluator,
                text: text.to_string(),
                compiled: None,
            },
            state: StageState::Unstarted,
        }
    }

    pub fn state(&self) -> StageState {
        self.state
    }

    fn next_match(&mut self) -> Result<Option<Extent>> {
        while let Some(extent) = self.upstream.get_extent()? {
            self.matcher.prepare(extent.schema())?;
            let schema = Arc::clone(extent.schema());
            let mut series = ExtentSeries::with_extent(extent);
            let mut out = Extent::new(schema);
            while series.more() {
                if self.matcher.matches(&series) {
                    if let Some(src) = series.extent() {
                        out.copy_row_from(src, series.pos());
                    }
                }
                series.next_row();
            }
            if !out.is_empty() {
                return Ok(Some(out));
            }
        }
        Ok(None)
    }
}

impl ExtentModule for RecordFilterModule {
    fn get_extent(&mut self) -> Result<Option<Extent>> {
        if self.state == StageState::Exhausted {
            return Ok(None);
        }
        let next = self.next_match();
        self.state.observe(&next);
        next
    }

    fn abort_handle(&self) -> Option<super::AbortHandle> {
        self.upstream.abort_handle()
    }
}
