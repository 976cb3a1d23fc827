//! Query request/response types shared by the executor, the async query
//! lifecycle and the HTTP surface.

use crate::WideEvent;
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// Error returned when parsing a filter operator from its wire name.
#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(display("'{}' is not a valid filter operator", value))]
pub struct InvalidOperator {
    /// The offending input.
    pub value: String,
}

/// Comparison operator of an [`EventFilter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    /// String-coerced equality.
    Eq,
    /// String-coerced inequality; matches absent attributes.
    Neq,
    /// Case-insensitive substring match on strings.
    Contains,
    /// Case-insensitive prefix match on strings.
    StartsWith,
    /// Numeric greater-than.
    Gt,
    /// Numeric greater-or-equal.
    Gte,
    /// Numeric less-than.
    Lt,
    /// Numeric less-or-equal.
    Lte,
    /// Membership in a list value.
    In,
}

impl FilterOp {
    /// The wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Neq => "neq",
            Self::Contains => "contains",
            Self::StartsWith => "starts_with",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::In => "in",
        }
    }
}

impl Display for FilterOp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FilterOp {
    type Err = InvalidOperator;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "eq" => Ok(Self::Eq),
            "neq" => Ok(Self::Neq),
            "contains" => Ok(Self::Contains),
            "starts_with" => Ok(Self::StartsWith),
            "gt" => Ok(Self::Gt),
            "gte" => Ok(Self::Gte),
            "lt" => Ok(Self::Lt),
            "lte" => Ok(Self::Lte),
            "in" => Ok(Self::In),
            other => Err(InvalidOperator {
                value: other.to_string(),
            }),
        }
    }
}

/// One predicate over a wide-event attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFilter {
    /// Column name the predicate applies to.
    pub attribute: String,
    /// Comparison operator.
    pub op: FilterOp,
    /// Comparand; a list for `in`, a scalar otherwise.
    pub value: serde_json::Value,
}

impl EventFilter {
    /// Convenience constructor for scalar predicates.
    pub fn new(attribute: impl Into<String>, op: FilterOp, value: impl Into<serde_json::Value>) -> Self {
        Self {
            attribute: attribute.into(),
            op,
            value: value.into(),
        }
    }
}

fn default_page() -> i64 {
    1
}

fn default_limit() -> i64 {
    50
}

/// An exploratory query over the event store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    /// Restrict to one project; `None` queries the whole organization.
    #[serde(default)]
    pub project_id: Option<String>,
    /// Conjunctive predicates.
    #[serde(default)]
    pub filters: Vec<EventFilter>,
    /// Attribute to group by instead of returning raw rows.
    #[serde(default)]
    pub group_by: Option<String>,
    /// 1-based result page.
    #[serde(default = "default_page")]
    pub page: i64,
    /// Page size.
    #[serde(default = "default_limit")]
    pub limit: i64,
    /// Inclusive range start, ms since epoch.
    #[serde(default)]
    pub start_date: Option<i64>,
    /// Inclusive range end, ms since epoch.
    #[serde(default)]
    pub end_date: Option<i64>,
    /// Export mode: full rows, no facets or grouping.
    #[serde(default)]
    pub export: bool,
}

impl Default for QueryRequest {
    fn default() -> Self {
        Self {
            project_id: None,
            filters: vec![],
            group_by: None,
            page: default_page(),
            limit: default_limit(),
            start_date: None,
            end_date: None,
            export: false,
        }
    }
}

impl QueryRequest {
    /// Page clamped to at least 1.
    pub fn page(&self) -> u64 {
        self.page.max(1) as u64
    }

    /// Limit clamped to at least 1.
    pub fn limit(&self) -> u64 {
        self.limit.max(1) as u64
    }

    /// Row offset of the first row on the requested page.
    pub fn offset(&self) -> u64 {
        (self.page() - 1) * self.limit()
    }
}

/// One ranked value of a facet distribution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacetValue {
    /// The attribute value, rendered as a string.
    pub value: String,
    /// How many matching rows carry the value.
    pub count: u64,
    /// Whether the value is part of the active `eq`/`in` filter for the attribute.
    pub selected: bool,
}

/// Ranked distribution of values for one attribute over the result set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Facet {
    /// Column name.
    pub attribute: String,
    /// Top values by count (desc), at most the configured cap.
    pub values: Vec<FacetValue>,
}

/// One bucket of a grouped query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupedResult {
    /// The group-by attribute value.
    pub value: String,
    /// Rows in the bucket.
    pub count: u64,
    /// Distinct user identities in the bucket.
    pub users: u64,
}

/// Result of one query execution.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    /// The page of matching rows (empty in grouped mode).
    pub events: Vec<WideEvent>,
    /// Total matching rows before pagination.
    pub total: u64,
    /// Facet distributions.
    pub facets: Vec<Facet>,
    /// Grouped buckets (empty unless `group_by` was set).
    pub grouped_results: Vec<GroupedResult>,
    /// Echo of the clamped page.
    pub page: u64,
    /// Echo of the clamped limit.
    pub limit: u64,
}

/// Authenticated caller identity passed explicitly into every core call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    /// Acting user.
    pub user_id: String,
    /// Organization scope; every query is bounded by this.
    pub organization_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operators_round_trip() {
        for op in [
            FilterOp::Eq,
            FilterOp::Neq,
            FilterOp::Contains,
            FilterOp::StartsWith,
            FilterOp::Gt,
            FilterOp::Gte,
            FilterOp::Lt,
            FilterOp::Lte,
            FilterOp::In,
        ] {
            assert_eq!(op.as_str().parse::<FilterOp>().unwrap(), op);
        }
        assert!("like".parse::<FilterOp>().is_err());
    }

    #[test]
    fn negative_page_and_limit_clamp_to_one() {
        let request = QueryRequest {
            page: -3,
            limit: -10,
            ..Default::default()
        };
        assert_eq!(request.page(), 1);
        assert_eq!(request.limit(), 1);
        assert_eq!(request.offset(), 0);

        let request = QueryRequest {
            page: 3,
            limit: 25,
            ..Default::default()
        };
        assert_eq!(request.offset(), 50);
    }

    #[test]
    fn request_deserializes_with_defaults() {
        let request: QueryRequest = serde_json::from_str(r#"{"filters": []}"#).unwrap();
        assert_eq!(request.page, 1);
        assert_eq!(request.limit, 50);
        assert!(!request.export);
    }
}
