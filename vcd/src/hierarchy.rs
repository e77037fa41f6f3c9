use derive_more::{From, Into};
use typed_index_collections::TiVec;

use crate::signal::SignalId;

#[derive(From, Into, Debug, Default, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ScopeId(pub usize);

/// Name of the implicit scope at the top of every hierarchy.
pub const ROOT_SCOPE_NAME: &str = "definition";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    /// The words between `$scope` and `$end`, e.g. `module tb`.
    pub name: String,
    pub parent: Option<ScopeId>,
    pub children: Vec<ScopeId>,
    /// Signals declared directly in this scope. The registry owns them.
    pub signals: Vec<SignalId>,
}

impl Scope {
    fn new(name: String, parent: Option<ScopeId>) -> Self {
        Self {
            name,
            parent,
            children: Vec::new(),
            signals: Vec::new(),
        }
    }

    /// The last word of the name, which is the instance name for the usual
    /// `<kind> <name>` form.
    pub fn instance_name(&self) -> &str {
        self.name.split_whitespace().last().unwrap_or("")
    }
}

/// The scope tree, stored flat. Scopes point at their parent and children by
/// id so there are no reference cycles. `ScopeId(0)` is always the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hierarchy {
    scopes: TiVec<ScopeId, Scope>,
}

impl Default for Hierarchy {
    fn default() -> Self {
        Self::new()
    }
}

impl Hierarchy {
    pub fn new() -> Self {
        let mut scopes = TiVec::new();
        scopes.push(Scope::new(ROOT_SCOPE_NAME.to_owned(), None));
        Self { scopes }
    }

    pub fn root(&self) -> ScopeId {
        ScopeId(0)
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        // There is always a root.
        false
    }

    pub fn get(&self, id: ScopeId) -> Option<&Scope> {
        self.scopes.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ScopeId, &Scope)> {
        self.scopes.iter_enumerated()
    }

    pub(crate) fn push_child(&mut self, parent: ScopeId, name: String) -> ScopeId {
        let id = self.scopes.push_and_get_key(Scope::new(name, Some(parent)));
        self.scopes[parent].children.push(id);
        id
    }

    pub(crate) fn add_signal(&mut self, scope: ScopeId, signal: SignalId) {
        self.scopes[scope].signals.push(signal);
    }

    pub fn parent(&self, id: ScopeId) -> Option<ScopeId> {
        self.get(id)?.parent
    }

    pub fn children(&self, id: ScopeId) -> impl Iterator<Item = (ScopeId, &Scope)> {
        self.get(id)
            .map(|scope| scope.children.as_slice())
            .unwrap_or_default()
            .iter()
            .map(move |&child| (child, &self.scopes[child]))
    }

    /// Number of `$scope`s above this one; the root is 0.
    pub fn depth(&self, id: ScopeId) -> usize {
        std::iter::successors(self.parent(id), |&p| self.parent(p)).count()
    }

    /// Instance names from the top, joined with `.`. The root itself is not
    /// included.
    pub fn path(&self, id: ScopeId) -> String {
        let mut names: Vec<&str> = std::iter::successors(Some(id), |&s| self.parent(s))
            .filter(|&s| s != self.root())
            .filter_map(|s| self.get(s).map(Scope::instance_name))
            .collect();
        names.reverse();
        names.join(".")
    }

    /// Depth first, parents before children, children in declaration order.
    pub fn walk(&self) -> impl Iterator<Item = (ScopeId, usize)> + '_ {
        let mut stack = vec![(self.root(), 0)];
        std::iter::from_fn(move || {
            let (id, depth) = stack.pop()?;
            if let Some(scope) = self.get(id) {
                stack.extend(scope.children.iter().rev().map(|&c| (c, depth + 1)));
            }
            Some((id, depth))
        })
    }
}

impl std::ops::Index<ScopeId> for Hierarchy {
    type Output = Scope;

    fn index(&self, id: ScopeId) -> &Scope {
        &self.scopes[id]
    }
}
