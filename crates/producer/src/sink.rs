//! Source API and Firehose sink of the poll loop.
use std::time::Duration;

use anyhow::{bail, Context};
use aws_sdk_firehose::{primitives::Blob, types::Record as FirehoseRecord};
use serde_json::Value;

use crate::records::{self, Record};

/// Firehose accepts at most this many records per `PutRecordBatch`.
pub const MAX_BATCH: usize = 500;

pub struct Api {
    client: reqwest::Client,
    url: String,
}

impl Api {
    pub fn new(url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("data-pipeline-producer/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Fetch the current items from the API.
    pub async fn fetch(&self) -> anyhow::Result<Vec<Value>> {
        let body: Value = self
            .client
            .get(&self.url)
            .send()
            .await
            .with_context(|| format!("API request to {} failed", self.url))?
            .error_for_status()
            .context("API returned an error status")?
            .json()
            .await
            .context("Failed to parse API response")?;
        records::normalize(body)
    }
}

pub struct Firehose {
    client: aws_sdk_firehose::Client,
    stream: String,
}

impl Firehose {
    pub fn new(client: aws_sdk_firehose::Client, stream: impl Into<String>) -> Self {
        Self {
            client,
            stream: stream.into(),
        }
    }

    /// Put `records` in batches of at most [`MAX_BATCH`].
    ///
    /// ## Errors
    /// Errs on the first batch Firehose fails to accept completely.
    pub async fn send(&self, records: &[Record]) -> anyhow::Result<usize> {
        let mut sent = 0;
        for entries in batches(records)? {
            let len = entries.len();
            log::info!("sending {len} records to Firehose stream {}", self.stream);
            let out = self
                .client
                .put_record_batch()
                .delivery_stream_name(&self.stream)
                .set_records(Some(entries))
                .send()
                .await
                .context("Firehose PutRecordBatch failed")?;
            for (i, response) in out.request_responses().iter().enumerate() {
                if let Some(code) = response.error_code() {
                    log::error!(
                        "record {i} failed: {code} - {}",
                        response.error_message().unwrap_or_default()
                    );
                }
            }
            ensure_delivered(out.failed_put_count(), len)?;
            sent += len;
        }
        Ok(sent)
    }
}

/// Encode `records` as newline-delimited JSON, grouped into batches of at
/// most [`MAX_BATCH`].
pub fn batches(records: &[Record]) -> anyhow::Result<Vec<Vec<FirehoseRecord>>> {
    records
        .chunks(MAX_BATCH)
        .map(|chunk| {
            chunk
                .iter()
                .map(|record| {
                    FirehoseRecord::builder()
                        .data(Blob::new(records::encode(record)?))
                        .build()
                        .context("Failed to build Firehose record")
                })
                .collect::<anyhow::Result<Vec<_>>>()
        })
        .collect()
}

/// A batch only counts as delivered when Firehose accepted every record.
pub fn ensure_delivered(failed: i32, batch_len: usize) -> anyhow::Result<()> {
    if failed > 0 {
        bail!("Failed to send {failed} of {batch_len} records");
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn records(n: usize) -> Vec<Record> {
        (0..n)
            .map(|i| match json!({"session_id": format!("s{i}"), "page": "/"}) {
                Value::Object(record) => record,
                _ => unreachable!(),
            })
            .collect()
    }

    fn sizes(n: usize) -> Vec<usize> {
        batches(&records(n)).unwrap().iter().map(Vec::len).collect()
    }

    #[test]
    fn batches_hold_at_most_500_records() {
        assert_eq!(Vec::<usize>::new(), sizes(0));
        assert_eq!(vec![1], sizes(1));
        assert_eq!(vec![500], sizes(500));
        assert_eq!(vec![500, 1], sizes(501));
        assert_eq!(vec![500, 500, 200], sizes(1200));
    }

    #[test]
    fn batched_records_are_newline_terminated_json() {
        let batch = batches(&records(2)).unwrap().remove(0);
        let data: &[u8] = batch[1].data().as_ref();
        assert_eq!(b"{\"page\":\"/\",\"session_id\":\"s1\"}\n".to_vec(), data);
    }

    #[test]
    fn any_failed_record_fails_the_batch() {
        assert!(ensure_delivered(0, 500).is_ok());
        let err = ensure_delivered(3, 500).unwrap_err();
        assert_eq!("Failed to send 3 of 500 records", err.to_string());
    }
}
