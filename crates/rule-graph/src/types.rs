//! Type identities, Get declarations, queries and entry keys.

use std::any::TypeId;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Identity of a Rust type used as a param or product.
#[derive(Clone, Copy)]
pub struct TypeKey {
    id: TypeId,
    name: &'static str,
}

impl TypeKey {
    /// The key for `T`
    #[must_use]
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// The underlying [`TypeId`]
    #[must_use]
    pub const fn id(&self) -> TypeId {
        self.id
    }

    /// Fully qualified type name
    #[must_use]
    pub const fn full_name(&self) -> &'static str {
        self.name
    }

    /// Type name with module paths stripped, e.g. `Vec<Target>`
    #[must_use]
    pub fn name(&self) -> String {
        short_name(self.name)
    }
}

fn short_name(full: &str) -> String {
    fn last(segment: &str) -> &str {
        segment.rsplit("::").next().unwrap_or(segment)
    }

    let mut out = String::with_capacity(full.len());
    let mut segment = String::new();
    for c in full.chars() {
        if c.is_alphanumeric() || c == '_' || c == ':' {
            segment.push(c);
        } else {
            out.push_str(last(&segment));
            segment.clear();
            out.push(c);
        }
    }
    out.push_str(last(&segment));
    out
}

impl PartialEq for TypeKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeKey {}

impl Hash for TypeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl PartialOrd for TypeKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TypeKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name
            .cmp(other.name)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl fmt::Debug for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// The set of param types in scope for an entry.
pub type ParamTypes = BTreeSet<TypeKey>;

/// Render a param set as `(A, B)`.
#[must_use]
pub fn display_params(params: &ParamTypes) -> String {
    let names: Vec<String> = params.iter().map(TypeKey::name).collect();
    format!("({})", names.join(", "))
}

/// A `Get` a rule may issue: compute `product` given a value of type `input`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GetDeclaration {
    /// Product type requested
    pub product: TypeKey,
    /// Type of the value supplied with the request
    pub input: TypeKey,
}

impl GetDeclaration {
    /// Declare `Get(P, I)`
    #[must_use]
    pub fn new<P: 'static, I: 'static>() -> Self {
        Self {
            product: TypeKey::of::<P>(),
            input: TypeKey::of::<I>(),
        }
    }
}

impl fmt::Display for GetDeclaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Get({}, {})", self.product, self.input)
    }
}

/// A root request shape: compute `product` from values of the `params` types.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Query {
    /// Product type requested
    pub product: TypeKey,
    /// Param types the caller will supply
    pub params: ParamTypes,
}

impl Query {
    /// Create a query
    #[must_use]
    pub fn new(product: TypeKey, params: impl IntoIterator<Item = TypeKey>) -> Self {
        Self {
            product,
            params: params.into_iter().collect(),
        }
    }

    /// The entry this query resolves to
    #[must_use]
    pub fn entry_key(&self) -> EntryKey {
        EntryKey {
            product: self.product,
            params: self.params.clone(),
        }
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Query({} for {})", self.product, display_params(&self.params))
    }
}

/// A product requested in a particular param scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryKey {
    /// Product type
    pub product: TypeKey,
    /// Every param type in scope (not only the used ones)
    pub params: ParamTypes,
}

impl EntryKey {
    /// The scope a `Get` issued from this entry resolves in
    #[must_use]
    pub fn for_get(&self, get: &GetDeclaration) -> Self {
        let mut params = self.params.clone();
        params.insert(get.input);
        Self {
            product: get.product,
            params,
        }
    }

    /// A positional dependency resolved in the same scope
    #[must_use]
    pub fn for_dependency(&self, product: TypeKey) -> Self {
        Self {
            product,
            params: self.params.clone(),
        }
    }
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} for {}", self.product, display_params(&self.params))
    }
}
