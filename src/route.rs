//! Route definitions, sync events and the in-memory route table

use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use crate::error::{GatewayError, GatewayResult};

/// Maximum route id length (matches the `id varchar(64)` column)
pub const MAX_ROUTE_ID_LEN: usize = 64;

/// Name + arguments of a route predicate or filter.
///
/// Accepts the shortcut text form `"Path=/svc-a/**,/legacy/**"` as well as
/// the object form `{"name": "Path", "args": {...}}`; always serializes as
/// the object form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RouteRuleRepr")]
pub struct RouteRule {
    pub name: String,
    #[serde(default)]
    pub args: BTreeMap<String, String>,
}

pub type PredicateDefinition = RouteRule;
pub type FilterDefinition = RouteRule;

impl RouteRule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: BTreeMap::new(),
        }
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }

    /// Argument values in key order
    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.args.values().map(String::as_str)
    }
}

impl FromStr for RouteRule {
    type Err = GatewayError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let (name, args) = match text.split_once('=') {
            Some((name, args)) => (name.trim(), args),
            None => (text.trim(), ""),
        };
        if name.is_empty() {
            return Err(GatewayError::InvalidRoute(format!(
                "rule '{}' has no name",
                text
            )));
        }

        let mut rule = RouteRule::new(name);
        for (i, value) in args
            .split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .enumerate()
        {
            rule.args.insert(format!("_genkey_{}", i), value.to_string());
        }
        Ok(rule)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RouteRuleRepr {
    Shortcut(String),
    Full {
        name: String,
        #[serde(default)]
        args: BTreeMap<String, String>,
    },
}

impl TryFrom<RouteRuleRepr> for RouteRule {
    type Error = GatewayError;

    fn try_from(repr: RouteRuleRepr) -> Result<Self, Self::Error> {
        match repr {
            RouteRuleRepr::Shortcut(text) => text.parse(),
            RouteRuleRepr::Full { name, args } => Ok(RouteRule { name, args }),
        }
    }
}

/// A rule mapping inbound request predicates to an upstream destination
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteDefinition {
    pub id: String,
    pub uri: String,
    #[serde(default)]
    pub predicates: Vec<PredicateDefinition>,
    #[serde(default)]
    pub filters: Vec<FilterDefinition>,
    #[serde(default)]
    pub order: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Optimistic lock counter, bumped on every persisted update
    #[serde(default)]
    pub version: i64,
}

impl RouteDefinition {
    pub fn new(id: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            uri: uri.into(),
            predicates: Vec::new(),
            filters: Vec::new(),
            order: 0,
            created_at: None,
            updated_at: None,
            version: 0,
        }
    }

    pub fn with_predicate(mut self, predicate: PredicateDefinition) -> Self {
        self.predicates.push(predicate);
        self
    }

    pub fn with_filter(mut self, filter: FilterDefinition) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    pub fn validate(&self) -> GatewayResult<()> {
        if self.id.is_empty() {
            return Err(GatewayError::InvalidRoute("id must not be empty".into()));
        }
        if self.id.chars().count() > MAX_ROUTE_ID_LEN {
            return Err(GatewayError::InvalidRoute(format!(
                "id '{}' exceeds {} characters",
                self.id, MAX_ROUTE_ID_LEN
            )));
        }
        if self.id.chars().any(char::is_whitespace) {
            return Err(GatewayError::InvalidRoute(format!(
                "id '{}' contains whitespace",
                self.id
            )));
        }
        if self.uri.trim().is_empty() || !self.uri.contains("://") {
            return Err(GatewayError::InvalidRoute(format!(
                "uri '{}' must be absolute (scheme://...)",
                self.uri
            )));
        }
        Ok(())
    }

    /// Whether any `Path` predicate of this route accepts `path`.
    ///
    /// A route without `Path` predicates matches nothing.
    pub fn matches_path(&self, path: &str) -> bool {
        self.predicates
            .iter()
            .filter(|p| p.name.eq_ignore_ascii_case("Path"))
            .flat_map(|p| p.values())
            .any(|pattern| path_matches(pattern, path))
    }
}

/// Ant-style path matching: `*` matches one segment, `**` any number
fn path_matches(pattern: &str, path: &str) -> bool {
    let pattern_segments: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
    let path_segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    segments_match(&pattern_segments, &path_segments)
}

fn segments_match(pattern: &[&str], path: &[&str]) -> bool {
    match pattern.split_first() {
        None => path.is_empty(),
        Some((&"**", rest)) => (0..=path.len()).any(|skip| segments_match(rest, &path[skip..])),
        Some((&segment, rest)) => match path.split_first() {
            Some((&head, tail)) => (segment == "*" || segment == head) && segments_match(rest, tail),
            None => false,
        },
    }
}

/// Kind of route change carried by a broadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteOp {
    Reload = 0,
    Add = 1,
    Update = 2,
    Delete = 3,
}

impl fmt::Display for RouteOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RouteOp::Reload => "RELOAD",
            RouteOp::Add => "ADD",
            RouteOp::Update => "UPDATE",
            RouteOp::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

impl Serialize for RouteOp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for RouteOp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match u8::deserialize(deserializer)? {
            0 => Ok(RouteOp::Reload),
            1 => Ok(RouteOp::Add),
            2 => Ok(RouteOp::Update),
            3 => Ok(RouteOp::Delete),
            other => Err(de::Error::custom(format!("unknown opType {}", other))),
        }
    }
}

/// Broadcast payload: `{opType, routeId?, routeDefinition?}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteUpdateEvent {
    pub op_type: RouteOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_definition: Option<RouteDefinition>,
}

impl RouteUpdateEvent {
    pub fn reload() -> Self {
        Self {
            op_type: RouteOp::Reload,
            route_id: None,
            route_definition: None,
        }
    }

    pub fn add(definition: RouteDefinition) -> Self {
        Self {
            op_type: RouteOp::Add,
            route_id: None,
            route_definition: Some(definition),
        }
    }

    pub fn update(definition: RouteDefinition) -> Self {
        Self {
            op_type: RouteOp::Update,
            route_id: None,
            route_definition: Some(definition),
        }
    }

    pub fn delete(route_id: impl Into<String>) -> Self {
        Self {
            op_type: RouteOp::Delete,
            route_id: Some(route_id.into()),
            route_definition: None,
        }
    }

    /// Check that the populated field matches the op type
    pub fn validate(&self) -> Result<(), String> {
        let has_id = self.route_id.is_some();
        let has_definition = self.route_definition.is_some();
        let ok = match self.op_type {
            RouteOp::Reload => !has_id && !has_definition,
            RouteOp::Add | RouteOp::Update => !has_id && has_definition,
            RouteOp::Delete => has_id && !has_definition,
        };
        if ok {
            Ok(())
        } else {
            Err(format!(
                "{} event with routeId={} routeDefinition={}",
                self.op_type, has_id, has_definition
            ))
        }
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode and validate a broadcast payload
    pub fn from_json(json: &[u8]) -> anyhow::Result<Self> {
        let event: RouteUpdateEvent = serde_json::from_slice(json)?;
        event.validate().map_err(anyhow::Error::msg)?;
        Ok(event)
    }
}

/// Immutable snapshot of the active routes, keyed by id
///
/// Match order (`order`, then id) is computed once per snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouteTable {
    routes: HashMap<String, RouteDefinition>,
    ordered: Vec<RouteDefinition>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_routes(routes: impl IntoIterator<Item = RouteDefinition>) -> Self {
        Self::from_map(routes.into_iter().map(|r| (r.id.clone(), r)).collect())
    }

    fn from_map(routes: HashMap<String, RouteDefinition>) -> Self {
        let mut ordered: Vec<RouteDefinition> = routes.values().cloned().collect();
        ordered.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)));
        Self { routes, ordered }
    }

    pub fn get(&self, id: &str) -> Option<&RouteDefinition> {
        self.routes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.routes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Copy of this table with `route` inserted or replaced
    pub fn with_upserted(&self, route: RouteDefinition) -> Self {
        let mut routes = self.routes.clone();
        routes.insert(route.id.clone(), route);
        Self::from_map(routes)
    }

    /// Copy of this table without `id`
    pub fn without(&self, id: &str) -> Self {
        let mut routes = self.routes.clone();
        routes.remove(id);
        Self::from_map(routes)
    }

    /// Routes in match order
    pub fn ordered(&self) -> &[RouteDefinition] {
        &self.ordered
    }

    /// Owned copy of [`ordered`](Self::ordered)
    pub fn sorted(&self) -> Vec<RouteDefinition> {
        self.ordered.clone()
    }

    /// First route, in match order, whose `Path` predicate accepts `path`
    pub fn find_for_path(&self, path: &str) -> Option<&RouteDefinition> {
        self.ordered.iter().find(|r| r.matches_path(path))
    }
}
