//! Row cursor over one extent at a time.

use std::sync::Arc;

use super::Extent;
use crate::error::{ExtentError, Result};
use crate::schema::ExtentSchema;

/// How a series treats extents of a schema other than the first one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TypeCompat {
    /// Every extent must share the first extent's schema identity.
    #[default]
    Exact,
    /// Any schema is accepted; fields rebind by name.
    Loose,
}

/// Holds the current extent and the row position field accessors read.
#[derive(Debug, Default)]
pub struct ExtentSeries {
    extent: Option<Extent>,
    first_schema: Option<Arc<ExtentSchema>>,
    row: usize,
    compat: TypeCompat,
}

impl ExtentSeries {
    pub fn new(compat: TypeCompat) -> Self {
        Self {
            compat,
            ..Self::default()
        }
    }

    /// Exact-mode series positioned on the first row of `extent`.
    pub fn with_extent(extent: Extent) -> Self {
        Self {
            first_schema: Some(Arc::clone(extent.schema())),
            extent: Some(extent),
            row: 0,
            compat: TypeCompat::Exact,
        }
    }

    /// Series over a new, empty extent of `schema`, ready for `new_row`.
    pub fn for_schema(schema: Arc<ExtentSchema>) -> Self {
        Self::with_extent(Extent::new(schema))
    }

    pub fn compat(&self) -> TypeCompat {
        self.compat
    }

    /// Replace the current extent and rewind; returns the previous one.
    pub fn set_extent(&mut self, extent: Extent) -> Result<Option<Extent>> {
        if let (Some(first), TypeCompat::Exact) = (&self.first_schema, self.compat) {
            if !Arc::ptr_eq(first, extent.schema()) {
                return Err(ExtentError::Schema(format!(
                    "series expects extents of type '{}', got '{}'",
                    first.name(),
                    extent.type_name()
                )));
            }
        }
        if self.first_schema.is_none() {
            self.first_schema = Some(Arc::clone(extent.schema()));
        }
        self.row = 0;
        Ok(self.extent.replace(extent))
    }

    pub fn take_extent(&mut self) -> Option<Extent> {
        self.row = 0;
        self.extent.take()
    }

    pub fn extent(&self) -> Option<&Extent> {
        self.extent.as_ref()
    }

    pub fn schema(&self) -> Option<&Arc<ExtentSchema>> {
        self.extent.as_ref().map(|e| e.schema())
    }

    pub fn row_count(&self) -> usize {
        self.extent.as_ref().map_or(0, |e| e.row_count())
    }

    pub fn pos(&self) -> usize {
        self.row
    }

    /// True while the cursor is on a valid row.
    pub fn more(&self) -> bool {
        self.row < self.row_count()
    }

    pub fn next_row(&mut self) {
        self.row += 1;
    }

    pub fn reset(&mut self) {
        self.row = 0;
    }

    /// # Panics
    /// If `row` is past the end of the current extent.
    pub fn set_pos(&mut self, row: usize) {
        assert!(
            row <= self.row_count(),
            "row {} is past the end of a {}-row extent",
            row,
            self.row_count()
        );
        self.row = row;
    }

    /// Append a zero-initialized row and move the cursor onto it.
    ///
    /// # Panics
    /// If the series holds no extent.
    pub fn new_row(&mut self) -> usize {
        let extent = self
            .extent
            .as_mut()
            .expect("new_row called on a series without an extent");
        self.row = extent.append_row();
        self.row
    }

    pub(crate) fn current(&self) -> Option<(&Extent, usize)> {
        self.extent
            .as_ref()
            .filter(|e| self.row < e.row_count())
            .map(|e| (e, self.row))
    }

    pub(crate) fn current_mut(&mut self) -> Option<(&mut Extent, usize)> {
        let row = self.row;
        self.extent
            .as_mut()
            .filter(|e| row < e.row_count())
            .map(|e| (e, row))
    }
}
