//! Validation and enrichment of API records.
use anyhow::bail;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

/// A single JSON object as returned by the API.
pub type Record = Map<String, Value>;

/// Fields a web traffic record is expected to carry, at least four of them.
const WEB_FIELDS: [&str; 6] = [
    "session_id",
    "page",
    "device_type",
    "browser",
    "event_type",
    "timestamp",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum Service {
    Crm,
    Web,
}

impl Service {
    pub fn as_str(&self) -> &'static str {
        match self {
            Service::Crm => "crm",
            Service::Web => "web",
        }
    }

    pub fn default_api_url(&self) -> &'static str {
        match self {
            Service::Crm => "http://3.248.199.26:8000/api/customer-interaction/",
            Service::Web => "http://3.248.199.26:8000/api/web-traffic/",
        }
    }

    /// Name reported by the health endpoint.
    pub fn producer_name(&self) -> String {
        format!("{self}-producer")
    }

    fn source(&self) -> String {
        format!("{self}-api")
    }

    fn pipeline(&self) -> String {
        format!("{self}-processor")
    }

    /// Whether `record` carries the fields downstream consumers rely on.
    pub fn is_valid(&self, record: &Record) -> bool {
        if record.contains_key("error") {
            return false;
        }
        match self {
            Service::Crm => {
                let customer_id = record
                    .get("customer_id")
                    .is_some_and(|id| id.is_i64() || id.is_u64());
                let interaction_type = record
                    .get("interaction_type")
                    .is_some_and(Value::is_string);
                customer_id && interaction_type && record.contains_key("timestamp")
            }
            Service::Web => {
                let present = WEB_FIELDS
                    .iter()
                    .filter(|field| record.contains_key(**field))
                    .count();
                present >= 4 && record.get("timestamp").is_some_and(|ts| !ts.is_null())
            }
        }
    }
}

impl core::fmt::Display for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Turn an API response body into a list of items.
///
/// An object with an `error` key means there is no data this cycle. Any other
/// object is a single record.
pub fn normalize(body: Value) -> anyhow::Result<Vec<Value>> {
    match body {
        Value::Object(object) if object.contains_key("error") => {
            log::warn!("API returned error: {}", object["error"]);
            Ok(vec![])
        }
        Value::Object(object) => Ok(vec![Value::Object(object)]),
        Value::Array(items) => Ok(items),
        other => bail!("Unexpected response format: {other}"),
    }
}

/// Add processing metadata to a record.
pub fn enrich(service: Service, region: &str, mut record: Record, now: DateTime<Utc>) -> Record {
    record.insert(
        "processed_at".to_owned(),
        now.to_rfc3339_opts(SecondsFormat::Micros, true).into(),
    );
    record.insert("source".to_owned(), service.source().into());
    record.insert("pipeline".to_owned(), service.pipeline().into());
    record.insert("region".to_owned(), region.into());
    record
}

/// Keep the valid records of `items`, enriched.
pub fn process(
    service: Service,
    region: &str,
    items: Vec<Value>,
    now: DateTime<Utc>,
) -> Vec<Record> {
    items
        .into_iter()
        .filter_map(|item| match item {
            Value::Object(record) if service.is_valid(&record) => {
                Some(enrich(service, region, record, now))
            }
            other => {
                log::debug!("skipping invalid record: {other}");
                None
            }
        })
        .collect()
}

/// One newline-terminated JSON document.
pub fn encode(record: &Record) -> anyhow::Result<Vec<u8>> {
    let mut data = serde_json::to_vec(record)?;
    data.push(b'\n');
    Ok(data)
}

#[cfg(test)]
mod test {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn record(value: Value) -> Record {
        match value {
            Value::Object(record) => record,
            other => panic!("not an object: {other}"),
        }
    }

    #[test]
    fn crm_requires_typed_fields() {
        let crm = Service::Crm;
        assert!(crm.is_valid(&record(json!({
            "customer_id": 42,
            "interaction_type": "call",
            "timestamp": "2024-01-01T00:00:00"
        }))));
        assert!(!crm.is_valid(&record(json!({
            "customer_id": "42",
            "interaction_type": "call",
            "timestamp": "2024-01-01T00:00:00"
        }))));
        assert!(!crm.is_valid(&record(json!({
            "customer_id": 42,
            "interaction_type": 7,
            "timestamp": "2024-01-01T00:00:00"
        }))));
        assert!(!crm.is_valid(&record(json!({
            "customer_id": 42,
            "interaction_type": "call"
        }))));
    }

    #[test]
    fn web_requires_most_fields_and_a_timestamp() {
        let web = Service::Web;
        assert!(web.is_valid(&record(json!({
            "session_id": "s1",
            "page": "/pricing",
            "browser": "firefox",
            "timestamp": 1700000000,
            "user_id": null
        }))));
        assert!(!web.is_valid(&record(json!({
            "session_id": "s1",
            "page": "/pricing",
            "browser": "firefox",
            "timestamp": null
        }))));
        assert!(!web.is_valid(&record(json!({
            "session_id": "s1",
            "page": "/pricing",
            "timestamp": 1700000000
        }))));
        assert!(!web.is_valid(&record(json!({
            "session_id": "s1",
            "page": "/pricing",
            "browser": "firefox",
            "timestamp": 1700000000,
            "error": "upstream"
        }))));
    }

    #[test]
    fn normalizes_response_shapes() {
        assert_eq!(1, normalize(json!({"customer_id": 1})).unwrap().len());
        assert_eq!(2, normalize(json!([{"a": 1}, {"b": 2}])).unwrap().len());
        assert!(normalize(json!({"error": "rate limited"})).unwrap().is_empty());
        assert!(normalize(json!("nope")).is_err());
        assert!(normalize(json!(12)).is_err());
    }

    #[test]
    fn enriches_valid_records_only() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let items = vec![
            json!({"customer_id": 7, "interaction_type": "email", "timestamp": "t"}),
            json!({"customer_id": 8}),
            json!("not a record"),
        ];
        let records = process(Service::Crm, "eu-west-1", items, now);
        assert_eq!(1, records.len());
        let enriched = &records[0];
        assert_eq!(json!(7), enriched["customer_id"]);
        assert_eq!(json!("2024-05-01T12:00:00.000000Z"), enriched["processed_at"]);
        assert_eq!(json!("crm-api"), enriched["source"]);
        assert_eq!(json!("crm-processor"), enriched["pipeline"]);
        assert_eq!(json!("eu-west-1"), enriched["region"]);
    }

    #[test]
    fn encodes_newline_delimited_json() {
        let data = encode(&record(json!({"page": "/"}))).unwrap();
        assert_eq!(b"{\"page\":\"/\"}\n".to_vec(), data);
    }
}
