//! Filter AST for record queries
//!
//! A filter is a recursive tree of groups. Each group combines its
//! conditions and nested groups with AND, OR or NOT:
//!
//! ```json
//! {
//!   "operator": "AND",
//!   "conditions": [
//!     {"field": "Category", "operator": "=", "value": "decision"},
//!     {"field": "Importance", "operator": ">=", "value": 75}
//!   ],
//!   "groups": [
//!     {"operator": "OR", "conditions": [
//!       {"field": "Tags", "operator": "CONTAINS", "value": "billing"},
//!       {"field": "Metadata", "operator": "CONTAINS", "value": {"team": "payments"}}
//!     ]}
//!   ]
//! }
//! ```
//!
//! Conditions are validated when they are built: the field must be a known
//! record attribute and the operator/value pair must make sense for that
//! field's kind. An invalid condition never reaches a backend.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

use crate::error::{KnowledgeError, Result};
use crate::types::{Record, Reference};

/// Record attributes that can be filtered and sorted on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Id,
    Category,
    ContentType,
    Content,
    Importance,
    CreatedAt,
    UpdatedAt,
    ExpiresAt,
    SourceId,
    SourceType,
    OwnerId,
    OwnerType,
    SubjectIds,
    SubjectType,
    Tags,
    References,
    Metadata,
}

/// How a field is compared
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// String-coerced generic comparison
    Scalar,
    /// Chronological comparison
    Time,
    /// Byte payload
    Bytes,
    /// Ordered list of strings, membership only
    List,
    /// List of references, membership by ID
    References,
    /// String map, key/value containment
    Map,
}

/// A borrowed view of one field of a record
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue<'a> {
    Text(&'a str),
    Int(i64),
    Time(Option<DateTime<Utc>>),
    Bytes(&'a [u8]),
    List(&'a [String]),
    References(&'a [Reference]),
    Map(&'a HashMap<String, String>),
}

impl Field {
    pub const ALL: [Field; 17] = [
        Field::Id,
        Field::Category,
        Field::ContentType,
        Field::Content,
        Field::Importance,
        Field::CreatedAt,
        Field::UpdatedAt,
        Field::ExpiresAt,
        Field::SourceId,
        Field::SourceType,
        Field::OwnerId,
        Field::OwnerType,
        Field::SubjectIds,
        Field::SubjectType,
        Field::Tags,
        Field::References,
        Field::Metadata,
    ];

    /// Parse a field name. Accepts `CreatedAt`, `created_at` and `createdat`.
    pub fn parse(name: &str) -> Result<Self> {
        Self::lookup(name).ok_or_else(|| {
            KnowledgeError::InvalidArgument(format!(
                "Unknown filter field: {}. Valid fields: {}",
                name,
                Field::ALL
                    .iter()
                    .map(|f| f.name())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
        })
    }

    /// Parse a field name, `None` when unknown
    pub fn lookup(name: &str) -> Option<Self> {
        let key: String = name
            .trim()
            .chars()
            .filter(|c| *c != '_')
            .flat_map(char::to_lowercase)
            .collect();

        let field = match key.as_str() {
            "id" => Field::Id,
            "category" => Field::Category,
            "contenttype" => Field::ContentType,
            "content" => Field::Content,
            "importance" => Field::Importance,
            "createdat" => Field::CreatedAt,
            "updatedat" => Field::UpdatedAt,
            "expiresat" => Field::ExpiresAt,
            "sourceid" => Field::SourceId,
            "sourcetype" => Field::SourceType,
            "ownerid" => Field::OwnerId,
            "ownertype" => Field::OwnerType,
            "subjectids" => Field::SubjectIds,
            "subjecttype" => Field::SubjectType,
            "tags" => Field::Tags,
            "references" => Field::References,
            "metadata" => Field::Metadata,
            _ => return None,
        };
        Some(field)
    }

    /// Canonical attribute name
    pub fn name(&self) -> &'static str {
        match self {
            Field::Id => "ID",
            Field::Category => "Category",
            Field::ContentType => "ContentType",
            Field::Content => "Content",
            Field::Importance => "Importance",
            Field::CreatedAt => "CreatedAt",
            Field::UpdatedAt => "UpdatedAt",
            Field::ExpiresAt => "ExpiresAt",
            Field::SourceId => "SourceID",
            Field::SourceType => "SourceType",
            Field::OwnerId => "OwnerID",
            Field::OwnerType => "OwnerType",
            Field::SubjectIds => "SubjectIDs",
            Field::SubjectType => "SubjectType",
            Field::Tags => "Tags",
            Field::References => "References",
            Field::Metadata => "Metadata",
        }
    }

    pub fn kind(&self) -> FieldKind {
        match self {
            Field::CreatedAt | Field::UpdatedAt | Field::ExpiresAt => FieldKind::Time,
            Field::Content => FieldKind::Bytes,
            Field::Tags | Field::SubjectIds => FieldKind::List,
            Field::References => FieldKind::References,
            Field::Metadata => FieldKind::Map,
            _ => FieldKind::Scalar,
        }
    }

    /// Read this field from a record
    pub fn value_of<'a>(&self, record: &'a Record) -> FieldValue<'a> {
        match self {
            Field::Id => FieldValue::Text(&record.id),
            Field::Category => FieldValue::Text(record.category.as_str()),
            Field::ContentType => FieldValue::Text(&record.content_type),
            Field::Content => FieldValue::Bytes(&record.content),
            Field::Importance => FieldValue::Int(i64::from(record.importance)),
            Field::CreatedAt => FieldValue::Time(record.created_at),
            Field::UpdatedAt => FieldValue::Time(record.updated_at),
            Field::ExpiresAt => FieldValue::Time(record.expires_at),
            Field::SourceId => FieldValue::Text(&record.source_id),
            Field::SourceType => FieldValue::Text(&record.source_type),
            Field::OwnerId => FieldValue::Text(&record.owner_id),
            Field::OwnerType => FieldValue::Text(&record.owner_type),
            Field::SubjectIds => FieldValue::List(&record.subject_ids),
            Field::SubjectType => FieldValue::Text(&record.subject_type),
            Field::Tags => FieldValue::List(&record.tags),
            Field::References => FieldValue::References(&record.references),
            Field::Metadata => FieldValue::Map(&record.metadata),
        }
    }
}

impl std::fmt::Display for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Comparison operator of a condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComparisonOperator {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    /// Substring, element membership or key/value containment depending on the field
    Contains,
}

impl ComparisonOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComparisonOperator::Eq => "=",
            ComparisonOperator::Ne => "!=",
            ComparisonOperator::Gt => ">",
            ComparisonOperator::Lt => "<",
            ComparisonOperator::Ge => ">=",
            ComparisonOperator::Le => "<=",
            ComparisonOperator::Contains => "CONTAINS",
        }
    }

    pub fn is_ordering(&self) -> bool {
        matches!(
            self,
            ComparisonOperator::Gt
                | ComparisonOperator::Lt
                | ComparisonOperator::Ge
                | ComparisonOperator::Le
        )
    }
}

impl std::fmt::Display for ComparisonOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ComparisonOperator {
    type Err = KnowledgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "=" | "==" | "EQ" => Ok(ComparisonOperator::Eq),
            "!=" | "<>" | "NE" | "NEQ" => Ok(ComparisonOperator::Ne),
            ">" | "GT" => Ok(ComparisonOperator::Gt),
            "<" | "LT" => Ok(ComparisonOperator::Lt),
            ">=" | "GTE" | "GE" => Ok(ComparisonOperator::Ge),
            "<=" | "LTE" | "LE" => Ok(ComparisonOperator::Le),
            "CONTAINS" => Ok(ComparisonOperator::Contains),
            _ => Err(KnowledgeError::InvalidArgument(format!(
                "Unknown comparison operator: {}",
                s
            ))),
        }
    }
}

/// Logical operator of a group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
pub enum LogicalOperator {
    #[default]
    #[serde(rename = "AND", alias = "and", alias = "")]
    And,
    #[serde(rename = "OR", alias = "or")]
    Or,
    /// None of the children may match
    #[serde(rename = "NOT", alias = "not")]
    Not,
}

/// Comparison value of a condition
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    String(String),
    Number(f64),
    Time(DateTime<Utc>),
    Bytes(Vec<u8>),
    Map(BTreeMap<String, String>),
}

impl FilterValue {
    /// String coercion used by the generic comparator
    pub fn to_text(&self) -> Option<String> {
        match self {
            FilterValue::String(s) => Some(s.clone()),
            FilterValue::Number(n) => Some(format_number(*n)),
            _ => None,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            FilterValue::String(_) => "string",
            FilterValue::Number(_) => "number",
            FilterValue::Time(_) => "time",
            FilterValue::Bytes(_) => "bytes",
            FilterValue::Map(_) => "map",
        }
    }

    /// Convert a JSON value. Objects become maps of strings.
    pub fn from_json(value: &Value) -> Result<Self> {
        match value {
            Value::String(s) => Ok(FilterValue::String(s.clone())),
            Value::Number(n) => n.as_f64().map(FilterValue::Number).ok_or_else(|| {
                KnowledgeError::InvalidArgument(format!("Invalid number value: {}", n))
            }),
            Value::Bool(b) => Ok(FilterValue::String(b.to_string())),
            Value::Object(obj) => {
                let mut map = BTreeMap::new();
                for (k, v) in obj {
                    let text = match v {
                        Value::String(s) => s.clone(),
                        Value::Number(n) => n.to_string(),
                        Value::Bool(b) => b.to_string(),
                        other => {
                            return Err(KnowledgeError::InvalidArgument(format!(
                                "Unsupported metadata value for key {}: {}",
                                k, other
                            )))
                        }
                    };
                    map.insert(k.clone(), text);
                }
                Ok(FilterValue::Map(map))
            }
            Value::Array(items) => {
                let bytes: Option<Vec<u8>> = items
                    .iter()
                    .map(|v| v.as_u64().and_then(|b| u8::try_from(b).ok()))
                    .collect();
                bytes.map(FilterValue::Bytes).ok_or_else(|| {
                    KnowledgeError::InvalidArgument(
                        "Array filter values must be byte sequences".to_string(),
                    )
                })
            }
            Value::Null => Err(KnowledgeError::InvalidArgument(
                "Null filter values are not supported".to_string(),
            )),
        }
    }
}

/// Integral numbers print without a fractional part, so 50.0 coerces to "50"
pub(crate) fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

impl From<&str> for FilterValue {
    fn from(s: &str) -> Self {
        FilterValue::String(s.to_string())
    }
}

impl From<String> for FilterValue {
    fn from(s: String) -> Self {
        FilterValue::String(s)
    }
}

impl From<f64> for FilterValue {
    fn from(n: f64) -> Self {
        FilterValue::Number(n)
    }
}

impl From<i32> for FilterValue {
    fn from(n: i32) -> Self {
        FilterValue::Number(f64::from(n))
    }
}

impl From<i64> for FilterValue {
    fn from(n: i64) -> Self {
        FilterValue::Number(n as f64)
    }
}

impl From<DateTime<Utc>> for FilterValue {
    fn from(t: DateTime<Utc>) -> Self {
        FilterValue::Time(t)
    }
}

impl From<Vec<u8>> for FilterValue {
    fn from(b: Vec<u8>) -> Self {
        FilterValue::Bytes(b)
    }
}

impl From<&[u8]> for FilterValue {
    fn from(b: &[u8]) -> Self {
        FilterValue::Bytes(b.to_vec())
    }
}

impl From<BTreeMap<String, String>> for FilterValue {
    fn from(m: BTreeMap<String, String>) -> Self {
        FilterValue::Map(m)
    }
}

impl<const N: usize> From<[(&str, &str); N]> for FilterValue {
    fn from(pairs: [(&str, &str); N]) -> Self {
        FilterValue::Map(
            pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

/// A single validated condition
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawCondition")]
pub struct Condition {
    field: Field,
    operator: ComparisonOperator,
    value: FilterValue,
}

impl Condition {
    /// Build a condition, rejecting unknown fields and unsupported operator/value pairs
    pub fn new(
        field: &str,
        operator: ComparisonOperator,
        value: impl Into<FilterValue>,
    ) -> Result<Self> {
        Self::for_field(Field::parse(field)?, operator, value.into())
    }

    pub fn for_field(field: Field, operator: ComparisonOperator, value: FilterValue) -> Result<Self> {
        let value = validate(field, operator, value)?;
        Ok(Self {
            field,
            operator,
            value,
        })
    }

    pub fn eq(field: &str, value: impl Into<FilterValue>) -> Result<Self> {
        Self::new(field, ComparisonOperator::Eq, value)
    }

    pub fn ne(field: &str, value: impl Into<FilterValue>) -> Result<Self> {
        Self::new(field, ComparisonOperator::Ne, value)
    }

    pub fn gt(field: &str, value: impl Into<FilterValue>) -> Result<Self> {
        Self::new(field, ComparisonOperator::Gt, value)
    }

    pub fn lt(field: &str, value: impl Into<FilterValue>) -> Result<Self> {
        Self::new(field, ComparisonOperator::Lt, value)
    }

    pub fn ge(field: &str, value: impl Into<FilterValue>) -> Result<Self> {
        Self::new(field, ComparisonOperator::Ge, value)
    }

    pub fn le(field: &str, value: impl Into<FilterValue>) -> Result<Self> {
        Self::new(field, ComparisonOperator::Le, value)
    }

    pub fn contains(field: &str, value: impl Into<FilterValue>) -> Result<Self> {
        Self::new(field, ComparisonOperator::Contains, value)
    }

    pub fn field(&self) -> Field {
        self.field
    }

    pub fn operator(&self) -> ComparisonOperator {
        self.operator
    }

    pub fn value(&self) -> &FilterValue {
        &self.value
    }
}

fn validate(field: Field, op: ComparisonOperator, value: FilterValue) -> Result<FilterValue> {
    use ComparisonOperator::*;

    let reject = |why: &str| -> Result<FilterValue> {
        Err(KnowledgeError::InvalidArgument(format!(
            "{} {} {}: {}",
            field,
            op,
            value.type_name(),
            why
        )))
    };

    match field.kind() {
        FieldKind::Map => match (op, &value) {
            (Eq | Ne, FilterValue::Map(_)) => Ok(value),
            (Contains, FilterValue::Map(_) | FilterValue::String(_)) => Ok(value),
            (Eq | Ne | Contains, _) => reject("metadata conditions take a key/value map"),
            _ => reject("metadata supports =, != and CONTAINS only"),
        },
        FieldKind::List => match (op, &value) {
            (Contains, FilterValue::String(_) | FilterValue::Number(_)) => Ok(value),
            (Contains, _) => reject("list membership takes a string"),
            _ => reject("list fields support CONTAINS only"),
        },
        FieldKind::References => match (op, &value) {
            (Contains, FilterValue::String(_)) => Ok(value),
            (Contains, _) => reject("reference membership takes a record ID"),
            _ => reject("references support CONTAINS only"),
        },
        FieldKind::Bytes => match (op, &value) {
            (Eq | Ne | Contains, FilterValue::Bytes(_) | FilterValue::String(_)) => Ok(value),
            (Eq | Ne | Contains, _) => reject("content compares against bytes or text"),
            _ => reject("content supports =, != and CONTAINS only"),
        },
        FieldKind::Time => {
            if op == Contains {
                return reject("time fields cannot use CONTAINS");
            }
            match value {
                FilterValue::Time(_) => Ok(value),
                FilterValue::String(ref s) => DateTime::parse_from_rfc3339(s)
                    .map(|t| FilterValue::Time(t.with_timezone(&Utc)))
                    .map_err(|e| {
                        KnowledgeError::InvalidArgument(format!(
                            "{} expects an RFC 3339 timestamp, got {:?}: {}",
                            field, s, e
                        ))
                    }),
                _ => reject("time fields compare against timestamps"),
            }
        }
        FieldKind::Scalar => match value {
            FilterValue::String(_) | FilterValue::Number(_) => Ok(value),
            _ => reject("compare against a string or number"),
        },
    }
}

/// Wire form of a condition
#[derive(Debug, Deserialize)]
struct RawCondition {
    field: String,
    operator: String,
    value: Value,
}

impl TryFrom<RawCondition> for Condition {
    type Error = KnowledgeError;

    fn try_from(raw: RawCondition) -> Result<Self> {
        let field = Field::parse(&raw.field)?;
        let operator: ComparisonOperator = raw.operator.parse()?;
        let value = FilterValue::from_json(&raw.value)?;
        Condition::for_field(field, operator, value)
    }
}

/// A group of conditions and nested groups joined by one logical operator
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct FilterGroup {
    #[serde(default)]
    pub operator: LogicalOperator,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub groups: Vec<FilterGroup>,
}

impl FilterGroup {
    fn with_operator(operator: LogicalOperator, conditions: Vec<Condition>) -> Self {
        Self {
            operator,
            conditions,
            groups: Vec::new(),
        }
    }

    pub fn and(conditions: Vec<Condition>) -> Self {
        Self::with_operator(LogicalOperator::And, conditions)
    }

    pub fn or(conditions: Vec<Condition>) -> Self {
        Self::with_operator(LogicalOperator::Or, conditions)
    }

    pub fn not(conditions: Vec<Condition>) -> Self {
        Self::with_operator(LogicalOperator::Not, conditions)
    }

    pub fn with_group(mut self, group: FilterGroup) -> Self {
        self.groups.push(group);
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// No conditions and no subgroups: matches everything
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty() && self.groups.is_empty()
    }
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    /// Anything other than "DESC" (any case) is ascending
    pub fn parse(s: &str) -> Self {
        if s.trim().eq_ignore_ascii_case("desc") {
            SortDirection::Desc
        } else {
            SortDirection::Asc
        }
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

impl<'de> Deserialize<'de> for SortDirection {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(SortDirection::parse(&s))
    }
}

/// A complete query: filter tree plus sorting, paging and partition selection
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct Filter {
    pub root_group: FilterGroup,
    /// 0 = unlimited
    pub limit: usize,
    pub offset: usize,
    /// Field name; unknown names leave the order unchanged
    pub order_by: Option<String>,
    pub order_dir: SortDirection,
    /// Search live and deleted records
    pub include_deleted: bool,
    /// Search deleted records only
    pub only_deleted: bool,
}

impl Filter {
    pub fn new(root_group: FilterGroup) -> Self {
        Self {
            root_group,
            ..Default::default()
        }
    }

    /// Match every live record
    pub fn all() -> Self {
        Self::default()
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn order_by(mut self, field: &str, dir: SortDirection) -> Self {
        self.order_by = Some(field.to_string());
        self.order_dir = dir;
        self
    }

    pub fn include_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    pub fn only_deleted(mut self) -> Self {
        self.only_deleted = true;
        self
    }

    pub fn scans_live(&self) -> bool {
        !self.only_deleted
    }

    pub fn scans_deleted(&self) -> bool {
        self.include_deleted || self.only_deleted
    }

    /// Sort field, if `order_by` names a known one
    pub fn sort_field(&self) -> Option<Field> {
        self.order_by.as_deref().and_then(Field::lookup)
    }
}

/// Parse a filter from JSON
pub fn parse_filter(json: &Value) -> Result<Filter> {
    serde_json::from_value(json.clone())
        .map_err(|e| KnowledgeError::InvalidArgument(format!("Invalid filter syntax: {}", e)))
}

/// Parse a filter group from JSON
pub fn parse_group(json: &Value) -> Result<FilterGroup> {
    serde_json::from_value(json.clone())
        .map_err(|e| KnowledgeError::InvalidArgument(format!("Invalid filter syntax: {}", e)))
}
