//! Presence context
//!
//! Derives what the user is looking at from the current location, for the
//! collaboration presence channel. Pure and deterministic.

use serde::{Deserialize, Serialize};

/// Whether the user is reading or editing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceMode {
    #[default]
    View,
    Edit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceContext {
    pub module: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    /// Normalized route pattern, ids replaced by `:id`
    pub route: String,
    pub mode: PresenceMode,
}

/// Root path segment → module
const MODULES: &[(&str, &str)] = &[
    ("projects", "projects"),
    ("clients", "clients"),
    ("materials", "materials"),
    ("warehouses", "warehouses"),
    ("documents", "documents"),
    ("drafts", "drafts"),
    ("users", "users"),
    ("roles", "users"),
    ("acts", "delivery"),
    ("worklogs", "delivery"),
    ("invoices", "finance"),
    ("orders", "finance"),
    ("settings", "settings"),
];

/// Root segments whose next segment is a record id
const FLAT_ENTITIES: &[(&str, &str)] = &[
    ("clients", "client"),
    ("materials", "material"),
    ("warehouses", "warehouse"),
    ("documents", "document"),
    ("drafts", "draft"),
    ("users", "user"),
    ("roles", "role"),
    ("acts", "act"),
    ("worklogs", "worklog"),
    ("invoices", "invoice"),
    ("orders", "order"),
];

/// Sections under `/projects/<id>/`
const PROJECT_SECTIONS: &[(&str, &str)] = &[
    ("acts", "act"),
    ("stages", "stage"),
    ("materials", "material"),
    ("worklogs", "worklog"),
    ("documents", "document"),
    ("estimates", "estimate"),
    ("warehouses", "warehouse"),
];

/// Segments that name a page, never a record
const RESERVED: &[&str] = &["new", "edit", "settings"];

fn lookup(table: &[(&str, &'static str)], key: &str) -> Option<&'static str> {
    table.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
}

fn is_record_segment(segment: &str) -> bool {
    !RESERVED.contains(&segment)
}

/// Build the presence context for a location.
///
/// `query` is the raw query string, with or without the leading `?`.
pub fn build_presence(pathname: &str, query: &str, mode: PresenceMode) -> PresenceContext {
    let segments: Vec<&str> = pathname.split('/').filter(|s| !s.is_empty()).collect();
    let root = segments.first().copied().unwrap_or("");

    let module = match root {
        "" => "dashboard".to_string(),
        other => lookup(MODULES, other).unwrap_or(other).to_string(),
    };

    let mut route: Vec<&str> = Vec::with_capacity(segments.len());
    let mut project_id = None;
    let mut entity_type = None;
    let mut entity_id = None;
    let mut consumed = 0;

    if let Some(&root) = segments.first() {
        route.push(root);
        consumed = 1;

        if root == "projects" {
            if let Some(id) = segments.get(1).and_then(|s| s.parse::<u64>().ok()) {
                project_id = Some(id);
                entity_type = Some("project".to_string());
                entity_id = Some(id.to_string());
                route.push(":id");
                consumed = 2;

                if let Some((section, kind)) = segments
                    .get(2)
                    .and_then(|s| lookup(PROJECT_SECTIONS, s).map(|kind| (*s, kind)))
                {
                    entity_type = Some(kind.to_string());
                    entity_id = None;
                    route.push(section);
                    consumed = 3;

                    if let Some(id) = segments.get(3).filter(|s| is_record_segment(s)) {
                        entity_id = Some(id.to_string());
                        route.push(":id");
                        consumed = 4;
                    }
                }
            }
        } else if let Some(kind) = lookup(FLAT_ENTITIES, root) {
            entity_type = Some(kind.to_string());
            if let Some(id) = segments.get(1).filter(|s| is_record_segment(s)) {
                entity_id = Some(id.to_string());
                route.push(":id");
                consumed = 2;
            }
        }
    }
    route.extend(segments.iter().skip(consumed));

    let params = parse_query(query);

    if project_id.is_none() {
        project_id = param(&params, "projectId").and_then(|v| v.parse().ok());
    }
    if entity_id.is_none() {
        entity_id = param(&params, "entityId").map(str::to_string);
    }
    if entity_type.is_none() {
        entity_type = param(&params, "entityType").map(str::to_string);
    }

    PresenceContext {
        module,
        project_id,
        entity_type,
        entity_id,
        route: format!("/{}", route.join("/")),
        mode,
    }
}

fn parse_query(query: &str) -> Vec<(String, String)> {
    serde_urlencoded::from_str(query.trim_start_matches('?')).unwrap_or_default()
}

fn param<'a>(params: &'a [(String, String)], name: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
        .filter(|v| !v.is_empty())
}
