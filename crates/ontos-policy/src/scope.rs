//! Data-scope resolution over an organisation tree.
//!
//! Scope never raises: it only narrows which rows a user sees or may touch.

use std::collections::{BTreeSet, HashMap};

use ontos_protocol::{
    DataScopeContext, DataScopeType, EntityMetadata, Row, RowFilter, ScopeLevel, UserContext,
};
use serde_json::Value;

/// Parent links between organisational units (e.g. HQ -> branches).
#[derive(Debug, Clone, Default)]
pub struct OrgTree {
    parents: HashMap<String, Option<String>>,
}

impl OrgTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_unit(&mut self, id: impl Into<String>, parent: Option<&str>) {
        self.parents.insert(id.into(), parent.map(str::to_owned));
    }

    /// `id` and every unit beneath it.
    pub fn subtree(&self, id: &str) -> BTreeSet<String> {
        let mut out = BTreeSet::from([id.to_owned()]);
        let mut frontier = vec![id.to_owned()];
        while let Some(current) = frontier.pop() {
            for (child, parent) in &self.parents {
                if parent.as_deref() == Some(current.as_str()) && out.insert(child.clone()) {
                    frontier.push(child.clone());
                }
            }
        }
        out
    }
}

pub fn resolve_scope(
    tree: &OrgTree,
    user: &UserContext,
    level: ScopeLevel,
    entity: Option<&EntityMetadata>,
) -> DataScopeContext {
    let visible_scope_ids = match (level, user.scope_id.as_deref()) {
        (ScopeLevel::All, _) | (_, None) => BTreeSet::new(),
        (ScopeLevel::ScopeAndBelow, Some(scope)) => tree.subtree(scope),
        (ScopeLevel::ScopeOnly | ScopeLevel::SelfOnly, Some(scope)) => BTreeSet::from([scope.to_owned()]),
    };
    DataScopeContext {
        level,
        visible_scope_ids,
        user_id: user.user_id.clone(),
        owner_column: entity.and_then(|e| e.owner_column.clone()),
    }
}

fn column_str<'a>(row: &'a Row, column: &str) -> Option<&'a str> {
    row.get(column).and_then(Value::as_str)
}

/// Whether `row` of `entity` is visible under `scope`.
///
/// Self-only visibility applies to entities that declare an owner column;
/// for the others it falls back to the user's own scope partition.
pub fn row_visible(scope: &DataScopeContext, entity: &EntityMetadata, row: &Row) -> bool {
    if scope.is_unrestricted() {
        return true;
    }
    if scope.level == ScopeLevel::SelfOnly {
        if let Some(owner) = &entity.owner_column {
            return column_str(row, owner) == Some(scope.user_id.as_str());
        }
    }
    match (entity.data_scope_type, &entity.scope_column) {
        (DataScopeType::Scoped, Some(column)) => {
            column_str(row, column).is_some_and(|id| scope.visible_scope_ids.contains(id))
        }
        _ => true,
    }
}

/// Store filters equivalent to [`row_visible`].
pub fn scope_filters(scope: &DataScopeContext, entity: &EntityMetadata) -> Vec<RowFilter> {
    if scope.is_unrestricted() {
        return Vec::new();
    }
    if scope.level == ScopeLevel::SelfOnly {
        if let Some(owner) = &entity.owner_column {
            return vec![RowFilter::eq(owner.clone(), scope.user_id.clone())];
        }
    }
    match (entity.data_scope_type, &entity.scope_column) {
        (DataScopeType::Scoped, Some(column)) => vec![RowFilter::one_of(
            column.clone(),
            scope.visible_scope_ids.iter().cloned().map(Value::String).collect(),
        )],
        _ => Vec::new(),
    }
}
