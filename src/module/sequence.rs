use super::{AbortHandle, ExtentModule};
use crate::error::Result;
use crate::extent::Extent;

/// A linear chain of stages built source first.
///
/// ```ignore
/// let chain = SequenceModule::new(FileSourceModule::new(registry, files))
///     .then(|up| PrefetchBufferModule::new(up, 64 << 20))
///     .then(|up| RecordFilterModule::new(up, "bytes", |v| v.as_i64() > Some(0)));
/// ```
///
/// Pulls go to the last stage. Each stage owns its upstream, so dropping
/// the chain releases the stages from the tail back to the source.
pub struct SequenceModule {
    tail: Box<dyn ExtentModule>,
    stages: usize,
}

impl SequenceModule {
    pub fn new<M: ExtentModule + 'static>(source: M) -> Self {
        Self {
            tail: Box::new(source),
            stages: 1,
        }
    }

    /// Append a stage built around the current tail.
    pub fn then<M, F>(self, build: F) -> Self
    where
        M: ExtentModule + 'static,
        F: FnOnce(Box<dyn ExtentModule>) -> M,
    {
        Self {
            tail: Box::new(build(self.tail)),
            stages: self.stages + 1,
        }
    }

    /// Stages in the chain, the source included.
    pub fn stage_count(&self) -> usize {
        self.stages
    }

    pub fn into_inner(self) -> Box<dyn ExtentModule> {
        self.tail
    }
}

impl ExtentModule for SequenceModule {
    fn get_extent(&mut self) -> Result<Option<Extent>> {
        self.tail.get_extent()
    }

    fn abort_handle(&self) -> Option<AbortHandle> {
        self.tail.abort_handle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{collect_extents, RecordFilterModule, VecModule};
    use crate::schema::TypeRegistry;
    use std::sync::Arc;

    #[test]
    fn test_chain_delegates_to_tail() {
        let schema = TypeRegistry::new()
            .register(r#"<ExtentType name="Seq"><field type="byte" name="b"/></ExtentType>"#)
            .unwrap();
        let mut empty_then_full = vec![Extent::new(Arc::clone(&schema))];
        let mut full = Extent::new(schema);
        full.create_rows(3);
        empty_then_full.push(full);

        let mut chain = SequenceModule::new(VecModule::new(empty_then_full))
            .then(|up| RecordFilterModule::new(up, "b", |_| true));
        assert_eq!(chain.stage_count(), 2);
        let out = collect_extents(&mut chain).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].row_count(), 3);
    }
}
