//! Closure-backed processor.

use std::marker::PhantomData;

use crate::context::RunContext;
use crate::error::HarvesterResult;
use crate::pipeline::ItemProcessor;

/// Adapts a closure into an [`ItemProcessor`]
pub struct FnProcessor<I, O, F> {
    func: F,
    _types: PhantomData<fn(I) -> O>,
}

impl<I, O, F> FnProcessor<I, O, F>
where
    F: Fn(I, &RunContext) -> HarvesterResult<O> + Send + Sync,
{
    pub fn new(func: F) -> Self {
        Self {
            func,
            _types: PhantomData,
        }
    }
}

impl<I, O, F> ItemProcessor<I, O> for FnProcessor<I, O, F>
where
    F: Fn(I, &RunContext) -> HarvesterResult<O> + Send + Sync,
{
    fn process(&self, item: I, context: &RunContext) -> HarvesterResult<O> {
        (self.func)(item, context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SharedParameter;

    #[test]
    fn test_closure_sees_run_context() {
        let processor = FnProcessor::new(|name: String, ctx: &RunContext| {
            let source = ctx.get_str(SharedParameter::SourceFileId).unwrap_or("unknown");
            Ok(format!("{source}:{name}"))
        });
        let ctx = RunContext::builder()
            .with(SharedParameter::SourceFileId, "vascan")
            .build();
        assert_eq!(
            processor.process("Carex".to_string(), &ctx).unwrap(),
            "vascan:Carex"
        );
    }
}
