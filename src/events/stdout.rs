//! Standard output event sink for development and demos.

use crate::core::errors::ReplicationResult;
use crate::events::EventSink;
use async_trait::async_trait;
use std::io::{self, Write};
use tracing::debug;

/// Writes one JSON line per change event to stdout.
#[derive(Debug, Default)]
pub struct StdoutSink;

impl StdoutSink {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EventSink for StdoutSink {
    async fn on_change(&self, table_name: &str, payload: &[u8]) -> ReplicationResult<()> {
        debug!(table = table_name, bytes = payload.len(), "change event");

        let line = serde_json::json!({
            "table": table_name,
            "payload": String::from_utf8_lossy(payload),
        });

        let mut stdout = io::stdout();
        writeln!(stdout, "{line}")?;
        stdout.flush()?;

        Ok(())
    }

    async fn on_shutdown(&self) -> ReplicationResult<()> {
        io::stdout().flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn accepts_binary_payloads() {
        let sink = StdoutSink::new();
        sink.on_change("public.users", b"I\x00\x00\x40\x39N\x00\x00")
            .await
            .unwrap();
        sink.on_shutdown().await.unwrap();
    }
}
