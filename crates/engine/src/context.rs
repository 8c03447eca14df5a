//! The handle a rule body uses to issue Gets.

use crate::error::Failure;
use crate::fs::{PathGlobs, Snapshot};
use crate::nodes::{GlobNode, NodeKey, ProcessNode, resolve};
use crate::process::{FallibleProcessResult, Process};
use crate::scheduler::Core;
use crate::value::{Param, Params, Value};
use cairn_graph::Context;
use cairn_rule_graph::{EntryKey, GetDeclaration};
use cairn_store::Store;
use futures::future::join_all;
use std::sync::Arc;

/// Passed to every rule body.
///
/// Each [`get`](Self::get) is resolved through the compiled rule graph and
/// the memo graph, so identical requests from different rules share one
/// computation.
#[derive(Clone)]
pub struct RuleContext {
    context: Context<NodeKey>,
    caller: EntryKey,
    rule: Arc<str>,
    params: Params,
}

impl RuleContext {
    pub(crate) const fn new(
        context: Context<NodeKey>,
        caller: EntryKey,
        rule: Arc<str>,
        params: Params,
    ) -> Self {
        Self {
            context,
            caller,
            rule,
            params,
        }
    }

    /// Request a `P` computed from `input`
    ///
    /// # Errors
    ///
    /// Returns [`Failure::UndeclaredGet`] if the rule did not declare
    /// `.get::<P, I>()`, or the failure of the requested computation
    pub async fn get<P: Param, I: Param>(&self, input: I) -> Result<P, Failure> {
        let declaration = GetDeclaration::new::<P, I>();
        let core = self.context.data();
        let Some((target, _)) = core.rule_graph.get_target(&self.caller, &declaration) else {
            return Err(Failure::UndeclaredGet {
                rule: self.rule.to_string(),
                get: declaration.to_string(),
            });
        };
        let mut params = self.params.clone();
        params.insert(Value::new(input)?);
        resolve(&self.context, target, &params).await?.downcast::<P>()
    }

    /// Request a `P` for each input concurrently. Results are in input order.
    ///
    /// # Errors
    ///
    /// Returns every failure, aggregated into [`Failure::Multiple`] when
    /// more than one request failed
    pub async fn get_all<P: Param, I: Param>(
        &self,
        inputs: impl IntoIterator<Item = I>,
    ) -> Result<Vec<P>, Failure> {
        collect_all(join_all(inputs.into_iter().map(|input| self.get::<P, I>(input))).await)
    }

    /// Run a process, memoized by its request
    pub(crate) async fn execute_process(
        &self,
        process: Process,
    ) -> Result<FallibleProcessResult, Failure> {
        self.context
            .get(NodeKey::Process(ProcessNode::new(process)))
            .await?
            .downcast::<FallibleProcessResult>()
    }

    /// Snapshot the workspace paths matching `globs`, memoized by the globs
    pub(crate) async fn snapshot_globs(&self, globs: PathGlobs) -> Result<Snapshot, Failure> {
        self.context
            .get(NodeKey::Glob(GlobNode::new(globs)))
            .await?
            .downcast::<Snapshot>()
    }

    /// The content-addressed store
    #[must_use]
    pub fn store(&self) -> &Store {
        &self.core().store
    }

    /// Name of the running rule
    #[must_use]
    pub fn rule_name(&self) -> &str {
        &self.rule
    }

    /// Params in scope for the running rule
    #[must_use]
    pub const fn params(&self) -> &Params {
        &self.params
    }

    pub(crate) fn core(&self) -> &Arc<Core> {
        self.context.data()
    }
}

/// Collect results, aggregating every failure.
pub(crate) fn collect_all<T>(results: Vec<Result<T, Failure>>) -> Result<Vec<T>, Failure> {
    let mut values = Vec::with_capacity(results.len());
    let mut failures = Vec::new();
    for result in results {
        match result {
            Ok(value) => values.push(value),
            Err(failure) => failures.push(failure),
        }
    }
    if failures.is_empty() {
        Ok(values)
    } else {
        Err(Failure::aggregate(failures))
    }
}

/// Tuples of Get results that [`multi_get!`](crate::multi_get) can combine.
pub trait MultiGetResults {
    /// The tuple of successful values
    type Output;

    /// All values, or every failure aggregated
    ///
    /// # Errors
    ///
    /// Returns the failure, or [`Failure::Multiple`] if several Gets failed
    fn into_result(self) -> Result<Self::Output, Failure>;
}

macro_rules! impl_multi_get_results {
    ($($t:ident $v:ident),+) => {
        impl<$($t),+> MultiGetResults for ($(Result<$t, Failure>,)+) {
            type Output = ($($t,)+);

            fn into_result(self) -> Result<Self::Output, Failure> {
                let ($($v,)+) = self;
                let mut failures = Vec::new();
                $(
                    let $v = match $v {
                        Ok(value) => Some(value),
                        Err(failure) => {
                            failures.push(failure);
                            None
                        }
                    };
                )+
                match ($($v,)+) {
                    ($(Some($v),)+) => Ok(($($v,)+)),
                    _ => Err(Failure::aggregate(failures)),
                }
            }
        }
    };
}

impl_multi_get_results!(A a);
impl_multi_get_results!(A a, B b);
impl_multi_get_results!(A a, B b, C c);
impl_multi_get_results!(A a, B b, C c, D d);
impl_multi_get_results!(A a, B b, C c, D d, E e);
impl_multi_get_results!(A a, B b, C c, D d, E e, F f);

/// Await several Gets of different types concurrently.
///
/// Evaluates to `Result<(A, B, ..), Failure>`, aggregating every failure.
///
/// ```rust,ignore
/// let (sources, config) = multi_get!(
///     ctx.get::<Sources, Target>(target.clone()),
///     ctx.get::<Config, ConfigRequest>(ConfigRequest::default()),
/// )?;
/// ```
#[macro_export]
macro_rules! multi_get {
    ($($get:expr),+ $(,)?) => {
        $crate::MultiGetResults::into_result($crate::__private::futures::join!($($get),+))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_all_keeps_order() {
        let values = collect_all(vec![Ok(1), Ok(2), Ok(3)]).unwrap();
        assert_eq!(values, vec![1, 2, 3]);
    }

    #[test]
    fn test_collect_all_aggregates_failures() {
        let err = collect_all(vec![
            Ok(1),
            Err(Failure::rule("a", "one")),
            Err(Failure::rule("b", "two")),
        ])
        .unwrap_err();
        assert_eq!(err.flatten().len(), 2);
    }

    #[test]
    fn test_multi_get_results() {
        let ok: (Result<u8, Failure>, Result<&str, Failure>) = (Ok(1), Ok("x"));
        assert_eq!(ok.into_result().unwrap(), (1, "x"));

        let single_failure: (Result<u8, Failure>, Result<u8, Failure>) =
            (Ok(1), Err(Failure::rule("r", "boom")));
        assert!(matches!(
            single_failure.into_result(),
            Err(Failure::Rule { .. })
        ));

        let both: (Result<u8, Failure>, Result<u8, Failure>) =
            (Err(Failure::Cancelled), Err(Failure::rule("r", "boom")));
        assert!(matches!(both.into_result(), Err(Failure::Multiple { .. })));
    }
}
