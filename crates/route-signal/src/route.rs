//! Route definitions, route filling, and the indexed route tree.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::RouteTreeError;
use crate::operation::RouteOperation;

/// Stable, unique identifier of a route.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RouteId(String);

impl RouteId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RouteId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for RouteId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl Borrow<str> for RouteId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for RouteId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A route node as declared by the caller, before filling.
pub struct RouteDefinition<T> {
    pub id: RouteId,
    pub operation: Option<Arc<dyn RouteOperation<T>>>,
    pub children: Vec<RouteDefinition<T>>,
}

impl<T> RouteDefinition<T> {
    /// A route without operation or children.
    pub fn new(id: impl Into<RouteId>) -> Self {
        Self {
            id: id.into(),
            operation: None,
            children: Vec::new(),
        }
    }

    pub fn with_operation<O>(mut self, operation: O) -> Self
    where
        O: RouteOperation<T> + 'static,
    {
        self.operation = Some(Arc::new(operation));
        self
    }

    pub fn with_child(mut self, child: RouteDefinition<T>) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_children(mut self, children: impl IntoIterator<Item = RouteDefinition<T>>) -> Self {
        self.children.extend(children);
        self
    }
}

impl<T> Clone for RouteDefinition<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            operation: self.operation.clone(),
            children: self.children.clone(),
        }
    }
}

impl<T> fmt::Debug for RouteDefinition<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteDefinition")
            .field("id", &self.id)
            .field("operation", &self.operation.is_some())
            .field("children", &self.children)
            .finish()
    }
}

/// Whether a filled route carries real work.
///
/// `Absent` routes still take part in reconciliation: they get a controller
/// and can be cancelled, but nothing is invoked for them.
pub enum OperationSlot<T> {
    Present(Arc<dyn RouteOperation<T>>),
    Absent,
}

impl<T> OperationSlot<T> {
    pub fn is_present(&self) -> bool {
        matches!(self, Self::Present(_))
    }

    pub fn operation(&self) -> Option<&Arc<dyn RouteOperation<T>>> {
        match self {
            Self::Present(operation) => Some(operation),
            Self::Absent => None,
        }
    }
}

impl<T> Clone for OperationSlot<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Present(operation) => Self::Present(Arc::clone(operation)),
            Self::Absent => Self::Absent,
        }
    }
}

impl<T> fmt::Debug for OperationSlot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Present(_) => f.write_str("Present(..)"),
            Self::Absent => f.write_str("Absent"),
        }
    }
}

impl<T> From<Option<Arc<dyn RouteOperation<T>>>> for OperationSlot<T> {
    fn from(operation: Option<Arc<dyn RouteOperation<T>>>) -> Self {
        operation.map_or(Self::Absent, Self::Present)
    }
}

/// A filled route node: every node has an explicit operation slot.
pub struct Route<T> {
    pub id: RouteId,
    pub operation: OperationSlot<T>,
    pub children: Vec<Route<T>>,
}

impl<T> Clone for Route<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            operation: self.operation.clone(),
            children: self.children.clone(),
        }
    }
}

impl<T> fmt::Debug for Route<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("id", &self.id)
            .field("operation", &self.operation)
            .field("children", &self.children)
            .finish()
    }
}

/// Fill every route node with an explicit operation slot.
///
/// Walks the definitions depth-first and returns a new tree with the same
/// shape. Operations are shared, not copied; the definitions are left as they
/// were.
pub fn fill_operations<T>(definitions: &[RouteDefinition<T>]) -> Vec<Route<T>> {
    definitions.iter().map(fill_route).collect()
}

fn fill_route<T>(definition: &RouteDefinition<T>) -> Route<T> {
    Route {
        id: definition.id.clone(),
        operation: OperationSlot::from(definition.operation.clone()),
        children: fill_operations(&definition.children),
    }
}

struct RouteNode<T> {
    operation: OperationSlot<T>,
    parent: Option<RouteId>,
}

/// Filled routes indexed by id.
pub struct RouteTree<T> {
    routes: Vec<Route<T>>,
    nodes: HashMap<RouteId, RouteNode<T>>,
}

impl<T> RouteTree<T> {
    /// Index filled routes, rejecting duplicate ids.
    pub fn new(routes: Vec<Route<T>>) -> Result<Self, RouteTreeError> {
        let mut nodes = HashMap::new();
        for route in &routes {
            index_route(&mut nodes, route, None)?;
        }
        Ok(Self { routes, nodes })
    }

    /// Fill and index caller definitions.
    pub fn from_definitions(definitions: &[RouteDefinition<T>]) -> Result<Self, RouteTreeError> {
        Self::new(fill_operations(definitions))
    }

    /// The filled top-level routes, in declaration order.
    pub fn routes(&self) -> &[Route<T>] {
        &self.routes
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn operation(&self, id: &str) -> Option<&OperationSlot<T>> {
        self.nodes.get(id).map(|node| &node.operation)
    }

    pub fn parent(&self, id: &str) -> Option<&RouteId> {
        self.nodes.get(id).and_then(|node| node.parent.as_ref())
    }

    /// Ids from the top-level ancestor down to `id`, inclusive.
    pub fn branch(&self, id: &str) -> Result<Vec<RouteId>, RouteTreeError> {
        let Some((leaf, _)) = self.nodes.get_key_value(id) else {
            return Err(RouteTreeError::UnknownRoute {
                route_id: RouteId::from(id),
            });
        };

        let mut branch = vec![leaf.clone()];
        let mut current = self.parent(id);
        while let Some(parent) = current {
            branch.push(parent.clone());
            current = self.parent(parent.as_str());
        }
        branch.reverse();
        Ok(branch)
    }

    /// All route ids, sorted.
    pub fn ids(&self) -> Vec<RouteId> {
        let mut ids: Vec<RouteId> = self.nodes.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl<T> fmt::Debug for RouteTree<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteTree")
            .field("routes", &self.routes)
            .finish_non_exhaustive()
    }
}

fn index_route<T>(
    nodes: &mut HashMap<RouteId, RouteNode<T>>,
    route: &Route<T>,
    parent: Option<&RouteId>,
) -> Result<(), RouteTreeError> {
    if nodes.contains_key(&route.id) {
        return Err(RouteTreeError::DuplicateRouteId {
            route_id: route.id.clone(),
        });
    }
    nodes.insert(
        route.id.clone(),
        RouteNode {
            operation: route.operation.clone(),
            parent: parent.cloned(),
        },
    );
    for child in &route.children {
        index_route(nodes, child, Some(&route.id))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OperationContext;

    fn noop(_ctx: OperationContext) -> std::future::Ready<anyhow::Result<()>> {
        std::future::ready(Ok(()))
    }

    fn sample() -> Vec<RouteDefinition<()>> {
        vec![
            RouteDefinition::new("/A1").with_operation(noop).with_children([
                RouteDefinition::new("/A1/B1").with_operation(noop),
                RouteDefinition::new("/A1/B2"),
            ]),
            RouteDefinition::new("/A2"),
        ]
    }

    #[test]
    fn test_fill_preserves_shape() {
        let definitions = sample();
        let routes = fill_operations(&definitions);

        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].id.as_str(), "/A1");
        assert_eq!(routes[0].children.len(), 2);
        assert_eq!(routes[0].children[1].id.as_str(), "/A1/B2");
        assert!(routes[1].children.is_empty());
    }

    #[test]
    fn test_fill_marks_missing_operations_absent() {
        let definitions = sample();
        let routes = fill_operations(&definitions);

        assert!(routes[0].operation.is_present());
        assert!(routes[0].children[0].operation.is_present());
        assert!(!routes[0].children[1].operation.is_present());
        assert!(!routes[1].operation.is_present());
    }

    #[test]
    fn test_fill_leaves_definitions_untouched() {
        let definitions = sample();
        let _routes = fill_operations(&definitions);

        assert!(definitions[0].children[1].operation.is_none());
        assert!(definitions[1].operation.is_none());
    }

    #[test]
    fn test_fill_shares_operations() {
        let definitions = sample();
        let routes = fill_operations(&definitions);

        let original = definitions[0].operation.as_ref().unwrap();
        let filled = routes[0].operation.operation().unwrap();
        assert!(Arc::ptr_eq(original, filled));
    }

    #[test]
    fn test_tree_rejects_duplicate_ids() {
        let definitions: Vec<RouteDefinition<()>> = vec![
            RouteDefinition::new("/a").with_child(RouteDefinition::new("/a/b")),
            RouteDefinition::new("/a/b"),
        ];

        let err = RouteTree::from_definitions(&definitions).unwrap_err();
        assert!(matches!(
            err,
            RouteTreeError::DuplicateRouteId { ref route_id } if route_id.as_str() == "/a/b"
        ));
    }

    #[test]
    fn test_tree_branch() {
        let tree = RouteTree::from_definitions(&sample()).unwrap();

        let branch = tree.branch("/A1/B2").unwrap();
        assert_eq!(branch, vec![RouteId::from("/A1"), RouteId::from("/A1/B2")]);
        assert_eq!(tree.branch("/A2").unwrap(), vec![RouteId::from("/A2")]);
        assert!(tree.branch("/missing").is_err());
        assert_eq!(tree.len(), 4);
        assert_eq!(tree.parent("/A1/B1"), Some(&RouteId::from("/A1")));
    }
}
