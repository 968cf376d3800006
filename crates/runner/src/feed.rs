//! Line-delimited batch input.
//!
//! Each line is one gateway batch with its write key alongside:
//! `{"writeKey": "wk", "batch": [{...}, {...}]}`. The whole line is handed to
//! the ingestion queue; the extra `writeKey` field is ignored there.

use anyhow::Result;
use event_schemas::IngestHandle;
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "writeKey", alias = "write_key")]
    write_key: String,
}

/// What a feed run saw.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedStats {
    pub submitted: u64,
    pub skipped: u64,
}

/// Read batches until EOF or cancellation.
pub async fn feed_lines<R>(
    reader: R,
    ingest: &IngestHandle,
    cancel: &CancellationToken,
) -> Result<FeedStats>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut stats = FeedStats::default();

    loop {
        let line = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            debug!("input closed");
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match serde_json::from_str::<Envelope>(line) {
            Ok(env) => {
                ingest.record_event_schema(&env.write_key, line);
                stats.submitted += 1;
            }
            Err(e) => {
                stats.skipped += 1;
                warn!(error = %e, "skipping input line without a writeKey");
            }
        }
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use event_schemas::pipeline;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn submits_lines_with_a_write_key() {
        let cancel = CancellationToken::new();
        let (handle, _queue) = pipeline::channel(16, cancel.clone());
        let input = concat!(
            r#"{"writeKey": "wk", "batch": [{"type": "page"}]}"#,
            "\n\n",
            r#"{"batch": [{"type": "page"}]}"#,
            "\n",
            "not json\n",
            r#"{"write_key": "wk2", "Batch": []}"#,
            "\n",
        );

        let stats = feed_lines(input.as_bytes(), &handle, &cancel).await.unwrap();
        assert_eq!(
            stats,
            FeedStats {
                submitted: 2,
                skipped: 2
            }
        );
        assert_eq!(handle.dropped_batches(), 0);
    }

    #[tokio::test]
    async fn stops_when_cancelled() {
        let cancel = CancellationToken::new();
        let (handle, _queue) = pipeline::channel(16, cancel.clone());
        cancel.cancel();
        let stats = feed_lines(
            r#"{"writeKey": "wk", "batch": []}"#.as_bytes(),
            &handle,
            &cancel,
        )
        .await
        .unwrap();
        assert_eq!(stats.submitted, 0);
    }
}
