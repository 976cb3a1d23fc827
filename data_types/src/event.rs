//! The wide-event record and its enumerated dimensions.

use chrono::{NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// Error returned when parsing an enumerated dimension from a string.
#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(display("'{}' is not a valid {}", value, domain))]
pub struct InvalidEnumValue {
    /// The offending input.
    pub value: String,
    /// Which domain the input failed to parse into.
    pub domain: &'static str,
}

/// The kind of telemetry a [`WideEvent`] carries.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    /// A fatal application crash.
    Crash,
    /// A handled error.
    #[default]
    Error,
    /// A log record.
    Log,
    /// A metric data point.
    Metric,
    /// A trace span.
    Span,
}

impl EventType {
    /// All members of the domain, in partition-path order.
    pub const ALL: [Self; 5] = [
        Self::Crash,
        Self::Error,
        Self::Log,
        Self::Metric,
        Self::Span,
    ];

    /// The lowercase wire/path representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Crash => "crash",
            Self::Error => "error",
            Self::Log => "log",
            Self::Metric => "metric",
            Self::Span => "span",
        }
    }
}

impl Display for EventType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = InvalidEnumValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "crash" => Ok(Self::Crash),
            "error" => Ok(Self::Error),
            "log" => Ok(Self::Log),
            "metric" => Ok(Self::Metric),
            "span" => Ok(Self::Span),
            other => Err(InvalidEnumValue {
                value: other.to_string(),
                domain: "event_type",
            }),
        }
    }
}

/// Severity of an event, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Finest-grained diagnostic output.
    Trace,
    /// Diagnostic output.
    Debug,
    /// Normal operational messages.
    Info,
    /// Something unexpected but survivable.
    Warning,
    /// A failure of an operation.
    Error,
    /// A failure of the process.
    Fatal,
}

impl Severity {
    /// The lowercase wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Fatal => "fatal",
        }
    }
}

impl Display for Severity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = InvalidEnumValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "fatal" => Ok(Self::Fatal),
            other => Err(InvalidEnumValue {
                value: other.to_string(),
                domain: "severity",
            }),
        }
    }
}

/// One row of the columnar store: a flat record carrying every potential
/// telemetry attribute, with unused columns `None`.
///
/// Field order matches the on-disk column order.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct WideEvent {
    /// UUIDv7 identity of the event.
    pub event_id: String,
    /// Milliseconds since the Unix epoch, UTC.
    pub timestamp: i64,
    /// Owning organization (lowercase hyphenated UUID).
    pub organization_id: Option<String>,
    /// Owning project (lowercase hyphenated UUID).
    pub project_id: String,
    /// Telemetry kind.
    pub event_type: EventType,
    /// Stable grouping hash; see `event_schema::fingerprint`.
    pub fingerprint: Option<String>,
    /// Severity classification.
    pub severity: Option<Severity>,
    /// Human-readable message.
    pub message: Option<String>,
    /// Exception class/type name for crashes and errors.
    pub exception_type: Option<String>,
    /// JSON-encoded stack trace.
    pub stack_trace: Option<String>,
    /// Application version string.
    pub app_version: Option<String>,
    /// Application build identifier.
    pub app_build: Option<String>,
    /// Bundle / service identifier.
    pub bundle_id: Option<String>,
    /// Deployment environment name.
    pub environment: Option<String>,
    /// Device hardware model.
    pub device_model: Option<String>,
    /// Pseudonymous device identity.
    pub device_id: Option<String>,
    /// Operating system name.
    pub os_name: Option<String>,
    /// Operating system version.
    pub os_version: Option<String>,
    /// BCP-47 locale.
    pub locale: Option<String>,
    /// IANA timezone name.
    pub timezone: Option<String>,
    /// Bytes of memory in use at capture time.
    pub memory_used: Option<i64>,
    /// Bytes of memory installed.
    pub memory_total: Option<i64>,
    /// Bytes of free disk.
    pub disk_free: Option<i64>,
    /// Battery level in `[0, 1]`.
    pub battery_level: Option<f64>,
    /// Distributed trace identity (lowercase hex).
    pub trace_id: Option<String>,
    /// Span identity (lowercase hex).
    pub span_id: Option<String>,
    /// Parent span identity (lowercase hex).
    pub parent_span_id: Option<String>,
    /// Span operation name.
    pub operation: Option<String>,
    /// Span duration in milliseconds.
    pub duration_ms: Option<f64>,
    /// Span status string.
    pub span_status: Option<String>,
    /// Metric name.
    pub metric_name: Option<String>,
    /// Metric value.
    pub metric_value: Option<f64>,
    /// Metric unit.
    pub metric_unit: Option<String>,
    /// End-user identity.
    pub user_id: Option<String>,
    /// Session identity.
    pub session_id: Option<String>,
    /// JSON-encoded tag map.
    pub tags: Option<String>,
    /// JSON-encoded context map.
    pub context: Option<String>,
    /// JSON-encoded breadcrumb list.
    pub breadcrumbs: Option<String>,
}

/// A borrowed, typed view of a single [`WideEvent`] attribute.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue<'a> {
    /// A UTF-8 attribute.
    Str(&'a str),
    /// A 64-bit integer attribute.
    Int(i64),
    /// A 64-bit float attribute.
    Float(f64),
}

impl FieldValue<'_> {
    /// String-equivalent rendering used by `eq`/`neq` coercion and faceting.
    pub fn render(&self) -> String {
        match self {
            Self::Str(s) => (*s).to_string(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
        }
    }

    /// Numeric view, if the attribute is (or parses as) a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Str(s) => s.parse().ok(),
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
        }
    }
}

impl WideEvent {
    /// The UTC calendar date of the event's millisecond timestamp.
    pub fn date(&self) -> NaiveDate {
        date_of_timestamp_millis(self.timestamp)
    }

    /// Look up an attribute by its column name.
    ///
    /// Returns `None` both for unknown names and for null-valued columns, which
    /// is exactly the "absent attribute" the filter semantics are defined over.
    pub fn field(&self, name: &str) -> Option<FieldValue<'_>> {
        fn s(v: &Option<String>) -> Option<FieldValue<'_>> {
            v.as_deref().map(FieldValue::Str)
        }
        fn i(v: &Option<i64>) -> Option<FieldValue<'static>> {
            v.map(FieldValue::Int)
        }
        fn f(v: &Option<f64>) -> Option<FieldValue<'static>> {
            v.map(FieldValue::Float)
        }

        match name {
            "event_id" => Some(FieldValue::Str(&self.event_id)),
            "timestamp" => Some(FieldValue::Int(self.timestamp)),
            "organization_id" => s(&self.organization_id),
            "project_id" => Some(FieldValue::Str(&self.project_id)),
            "event_type" => Some(FieldValue::Str(self.event_type.as_str())),
            "fingerprint" => s(&self.fingerprint),
            "severity" => self.severity.map(|v| FieldValue::Str(v.as_str())),
            "message" => s(&self.message),
            "exception_type" => s(&self.exception_type),
            "stack_trace" => s(&self.stack_trace),
            "app_version" => s(&self.app_version),
            "app_build" => s(&self.app_build),
            "bundle_id" => s(&self.bundle_id),
            "environment" => s(&self.environment),
            "device_model" => s(&self.device_model),
            "device_id" => s(&self.device_id),
            "os_name" => s(&self.os_name),
            "os_version" => s(&self.os_version),
            "locale" => s(&self.locale),
            "timezone" => s(&self.timezone),
            "memory_used" => i(&self.memory_used),
            "memory_total" => i(&self.memory_total),
            "disk_free" => i(&self.disk_free),
            "battery_level" => f(&self.battery_level),
            "trace_id" => s(&self.trace_id),
            "span_id" => s(&self.span_id),
            "parent_span_id" => s(&self.parent_span_id),
            "operation" => s(&self.operation),
            "duration_ms" => f(&self.duration_ms),
            "span_status" => s(&self.span_status),
            "metric_name" => s(&self.metric_name),
            "metric_value" => f(&self.metric_value),
            "metric_unit" => s(&self.metric_unit),
            "user_id" => s(&self.user_id),
            "session_id" => s(&self.session_id),
            "tags" => s(&self.tags),
            "context" => s(&self.context),
            "breadcrumbs" => s(&self.breadcrumbs),
            _ => None,
        }
    }

    /// The identity used for "distinct users" aggregation: the user if known,
    /// else the device.
    pub fn user_identity(&self) -> Option<&str> {
        self.user_id.as_deref().or(self.device_id.as_deref())
    }
}

/// The UTC calendar date a millisecond timestamp falls on.
pub fn date_of_timestamp_millis(millis: i64) -> NaiveDate {
    Utc.timestamp_millis_opt(millis)
        .single()
        .map(|dt| dt.date_naive())
        .unwrap_or_else(|| NaiveDate::from_ymd_opt(1970, 1, 1).expect("epoch date"))
}

/// The `(organization, project, event type, day)` tuple that places an event
/// into exactly one partition directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    /// Organization segment value.
    pub organization_id: String,
    /// Project segment value.
    pub project_id: String,
    /// Event-type segment value.
    pub event_type: EventType,
    /// The `dt=` day, derived from the event timestamp in UTC.
    pub date: NaiveDate,
}

impl PartitionKey {
    /// The partition an event belongs to.
    pub fn for_event(event: &WideEvent) -> Self {
        Self {
            organization_id: event.organization_id.clone().unwrap_or_default(),
            project_id: event.project_id.clone(),
            event_type: event.event_type,
            date: event.date(),
        }
    }
}

impl Display for PartitionKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.organization_id, self.project_id, self.event_type, self.date
        )
    }
}
