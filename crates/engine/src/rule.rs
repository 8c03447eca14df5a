//! Rule registration.
//!
//! A rule is an async function taking a [`RuleContext`] and its positional
//! params, and returning its product. Bodies are type-erased once, when the
//! [`Rule`] is built, so the executor only ever handles [`Value`]s.
//!
//! ```rust,ignore
//! async fn compile(ctx: RuleContext, sources: Sources) -> Result<Binary, Failure> {
//!     let result: ProcessResult = ctx.get(sources.compile_process()).await?;
//!     Ok(Binary(result.output_digest))
//! }
//!
//! let rules = RuleSet::builder()
//!     .rule(Rule::new("compile", compile).get::<ProcessResult, Process>())
//!     .query::<Binary>([TypeKey::of::<Sources>()])
//!     .build();
//! ```

use crate::context::RuleContext;
use crate::error::Failure;
use crate::value::{Param, Value};
use cairn_rule_graph::{GetDeclaration, Query, RuleNodeData, TypeKey};
use futures::FutureExt;
use futures::future::BoxFuture;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// A typed rule body. Implemented for async functions and closures taking a
/// [`RuleContext`] followed by up to six params.
pub trait RuleFn<Args>: Send + Sync + 'static {
    /// The type the rule produces
    type Product: Param;

    /// Types of the positional params, in order
    fn dependency_types() -> Vec<TypeKey>;

    /// Start the body with type-erased args
    ///
    /// # Errors
    ///
    /// Returns [`Failure::TypeMismatch`] if an arg is not of the declared type
    fn call(
        &self,
        context: RuleContext,
        args: Vec<Value>,
    ) -> Result<BoxFuture<'static, Result<Self::Product, Failure>>, Failure>;
}

fn next_arg<T: Param>(args: &mut impl Iterator<Item = Value>) -> Result<T, Failure> {
    args.next()
        .ok_or_else(|| Failure::TypeMismatch {
            expected: TypeKey::of::<T>().name(),
            actual: "nothing".to_string(),
        })?
        .downcast::<T>()
}

macro_rules! impl_rule_fn {
    ($($arg:ident),*) => {
        impl<F, Fut, P, $($arg,)*> RuleFn<($($arg,)*)> for F
        where
            F: Fn(RuleContext, $($arg),*) -> Fut + Send + Sync + 'static,
            Fut: Future<Output = Result<P, Failure>> + Send + 'static,
            P: Param,
            $($arg: Param,)*
        {
            type Product = P;

            fn dependency_types() -> Vec<TypeKey> {
                vec![$(TypeKey::of::<$arg>()),*]
            }

            #[allow(non_snake_case, unused_mut, unused_variables)]
            fn call(
                &self,
                context: RuleContext,
                args: Vec<Value>,
            ) -> Result<BoxFuture<'static, Result<P, Failure>>, Failure> {
                let mut args = args.into_iter();
                $(let $arg = next_arg::<$arg>(&mut args)?;)*
                Ok((self)(context, $($arg),*).boxed())
            }
        }
    };
}

impl_rule_fn!();
impl_rule_fn!(A1);
impl_rule_fn!(A1, A2);
impl_rule_fn!(A1, A2, A3);
impl_rule_fn!(A1, A2, A3, A4);
impl_rule_fn!(A1, A2, A3, A4, A5);
impl_rule_fn!(A1, A2, A3, A4, A5, A6);

type ErasedBody =
    dyn Fn(RuleContext, Vec<Value>) -> Result<BoxFuture<'static, Result<Value, Failure>>, Failure>
        + Send
        + Sync;

/// A registered rule.
#[derive(Clone)]
pub struct Rule {
    name: String,
    product: TypeKey,
    dependencies: Vec<TypeKey>,
    gets: Vec<GetDeclaration>,
    body: Arc<ErasedBody>,
    intrinsic: bool,
}

impl Rule {
    /// Register `body` under `name`
    #[must_use]
    pub fn new<Args, F: RuleFn<Args>>(name: impl Into<String>, body: F) -> Self {
        let erased = move |context: RuleContext,
                           args: Vec<Value>|
              -> Result<BoxFuture<'static, Result<Value, Failure>>, Failure> {
            let running = body.call(context, args)?;
            Ok(async move { Value::new(running.await?) }.boxed())
        };
        Self {
            name: name.into(),
            product: TypeKey::of::<F::Product>(),
            dependencies: F::dependency_types(),
            gets: Vec::new(),
            body: Arc::new(erased),
            intrinsic: false,
        }
    }

    /// Declare that the rule may request `P` from an `I`
    #[must_use]
    pub fn get<P: 'static, I: 'static>(mut self) -> Self {
        self.gets.push(GetDeclaration::new::<P, I>());
        self
    }

    pub(crate) const fn intrinsic(mut self) -> Self {
        self.intrinsic = true;
        self
    }

    /// The rule's name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The type the rule produces
    #[must_use]
    pub const fn product(&self) -> TypeKey {
        self.product
    }

    pub(crate) fn run(
        &self,
        context: RuleContext,
        args: Vec<Value>,
    ) -> Result<BoxFuture<'static, Result<Value, Failure>>, Failure> {
        (self.body)(context, args)
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("name", &self.name)
            .field("product", &self.product)
            .field("dependencies", &self.dependencies)
            .field("gets", &self.gets)
            .finish_non_exhaustive()
    }
}

impl RuleNodeData for Rule {
    fn name(&self) -> &str {
        &self.name
    }

    fn product(&self) -> TypeKey {
        self.product
    }

    fn dependencies(&self) -> &[TypeKey] {
        &self.dependencies
    }

    fn gets(&self) -> &[GetDeclaration] {
        &self.gets
    }

    fn is_intrinsic(&self) -> bool {
        self.intrinsic
    }
}

/// Rules and root queries, ready to be compiled by a scheduler.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    pub(crate) rules: Vec<Rule>,
    pub(crate) queries: Vec<Query>,
}

impl RuleSet {
    /// Start building a rule set
    #[must_use]
    pub fn builder() -> RuleSetBuilder {
        RuleSetBuilder::default()
    }

    /// Registered rules
    #[must_use]
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Declared queries
    #[must_use]
    pub fn queries(&self) -> &[Query] {
        &self.queries
    }
}

/// Builder for [`RuleSet`].
#[derive(Debug, Default)]
pub struct RuleSetBuilder {
    set: RuleSet,
}

impl RuleSetBuilder {
    /// Register a rule
    #[must_use]
    pub fn rule(mut self, rule: Rule) -> Self {
        self.set.rules.push(rule);
        self
    }

    /// Register several rules
    #[must_use]
    pub fn rules(mut self, rules: impl IntoIterator<Item = Rule>) -> Self {
        self.set.rules.extend(rules);
        self
    }

    /// Declare a root query for `P` given params of the listed types
    #[must_use]
    pub fn query<P: 'static>(mut self, params: impl IntoIterator<Item = TypeKey>) -> Self {
        self.set.queries.push(Query::new(TypeKey::of::<P>(), params));
        self
    }

    /// Finish building
    #[must_use]
    pub fn build(self) -> RuleSet {
        self.set
    }
}
