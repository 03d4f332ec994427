//! Intent log - writes notification intents to file
//!
//! Intents are written in JSONL format (one JSON object per line) to the
//! file specified in config. This is the default consumer of the intent
//! channel; an external notifier can tail the file.

use crate::io::intent_channel::NotificationIntent;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

/// Intent log writer actor
///
/// Receives intents from the channel and appends them to the log file.
pub struct IntentLogWriter {
    file_path: String,
    rx: mpsc::Receiver<NotificationIntent>,
}

impl IntentLogWriter {
    pub fn new(file_path: &str, rx: mpsc::Receiver<NotificationIntent>) -> Self {
        info!(file_path = %file_path, "intent_log_initialized");
        Self { file_path: file_path.to_string(), rx }
    }

    /// Run the writer loop until shutdown or until every sender is gone.
    /// Pending intents are drained before returning.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(file_path = %self.file_path, "intent_log_started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        let mut drained = 0usize;
                        while let Ok(intent) = self.rx.try_recv() {
                            self.write_intent(&intent);
                            drained += 1;
                        }
                        info!(drained = %drained, "intent_log_shutdown");
                        return;
                    }
                }
                msg = self.rx.recv() => {
                    match msg {
                        Some(intent) => {
                            self.write_intent(&intent);
                        }
                        None => {
                            info!("intent_log_channel_closed");
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Append one intent. Returns true if successful.
    pub fn write_intent(&self, intent: &NotificationIntent) -> bool {
        let json = match serde_json::to_string(intent) {
            Ok(json) => json,
            Err(e) => {
                error!(token_id = %intent.token_id, error = %e, "intent_serialize_failed");
                return false;
            }
        };

        match self.append_line(&json) {
            Ok(()) => {
                debug!(
                    token_id = %intent.token_id,
                    kind = %intent.kind.as_str(),
                    "intent_logged"
                );
                true
            }
            Err(e) => {
                error!(
                    token_id = %intent.token_id,
                    error = %e,
                    "intent_log_write_failed"
                );
                false
            }
        }
    }

    /// Append a line to the log file
    fn append_line(&self, line: &str) -> std::io::Result<()> {
        let path = Path::new(&self.file_path);

        // Create parent directories if they don't exist
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }
}
