use ontos_actions::Dispatcher;
use ontos_protocol::{EntityMetadata, OntosResult, Row, RowFilter, UserContext};
use ontos_registry::OntologyRegistry;
use ontos_rules::Vocabulary;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub entity: String,
    pub filters: Vec<RowFilter>,
    /// Visible matches before the row limit.
    pub total: usize,
    pub rows: Vec<Row>,
}

fn entity_terms(entity: &EntityMetadata) -> Vec<String> {
    let mut terms = vec![entity.name.to_lowercase()];
    terms.extend(
        entity
            .description
            .split(|c: char| c.is_whitespace() || ",，、/;；".contains(c))
            .map(|t| t.trim().to_lowercase())
            .filter(|t| t.chars().count() >= 2),
    );
    terms.sort();
    terms.dedup();
    terms
}

/// The entity whose name and description terms cover the most of the text.
pub fn detect_entity<'a>(registry: &'a OntologyRegistry, text: &str) -> Option<&'a EntityMetadata> {
    let lowered = text.to_lowercase();
    let mut best: Option<(&EntityMetadata, usize)> = None;
    for entity in registry.entities() {
        let len: usize = entity_terms(entity)
            .iter()
            .filter(|t| lowered.contains(t.as_str()))
            .map(|t| t.chars().count())
            .sum();
        if len > 0 && best.is_none_or(|(_, current)| len > current) {
            best = Some((entity, len));
        }
    }
    best.map(|(entity, _)| entity)
}

/// Filtered read of one entity through the full security pipeline:
/// `read` permission, data scope, then attribute ACL and masking per row.
/// Vocabulary terms in the text become `in` filters.
pub fn run_query(
    dispatcher: &Dispatcher,
    vocabulary: &Vocabulary,
    user: &UserContext,
    entity: &EntityMetadata,
    text: &str,
    limit: usize,
) -> OntosResult<QueryResult> {
    let services = dispatcher.services();
    services.security.check_action(user, &entity.name, "read")?;

    let filters: Vec<RowFilter> = vocabulary
        .find_terms(&entity.name, text)
        .into_iter()
        .map(|m| RowFilter::one_of(m.field, m.values.into_iter().map(Value::String).collect()))
        .collect();
    let mut scoped = filters.clone();
    scoped.extend(services.security.scope_filters(user, entity));

    let rows: Vec<Row> = services
        .store
        .query(&entity.name, &scoped)?
        .into_iter()
        .filter(|row| services.security.row_visible(user, entity, row))
        .collect();
    let total = rows.len();
    debug!(entity = %entity.name, total, filters = filters.len(), "query executed");
    let rows = rows
        .into_iter()
        .take(limit)
        .map(|row| services.security.project_row(user, entity, row))
        .collect();
    Ok(QueryResult {
        entity: entity.name.clone(),
        filters,
        total,
        rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ontos_protocol::{EntityMetadata, PropertyMetadata, PropertyType};

    #[test]
    fn best_covering_entity_wins() -> anyhow::Result<()> {
        let mut registry = OntologyRegistry::new();
        registry.register_entity(
            EntityMetadata::new("Room", "rooms")
                .describe("房间 room")
                .property(PropertyMetadata::new("status", PropertyType::String)),
        )?;
        registry.register_entity(EntityMetadata::new("RoomType", "room_types").describe("房型 room type"))?;
        assert_eq!(detect_entity(&registry, "查询空闲房间").map(|e| e.name.as_str()), Some("Room"));
        assert_eq!(detect_entity(&registry, "list room types").map(|e| e.name.as_str()), Some("RoomType"));
        assert!(detect_entity(&registry, "今天天气").is_none());
        Ok(())
    }
}
