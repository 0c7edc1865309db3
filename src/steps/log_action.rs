use super::{events, unknown_function, DOCUMENT_PARAM};
use crate::error::Result;
use crate::services::{HistoryRecord, HistoryWriter};
use crate::step::{Access, BoxFut, Emissions, Step, StepCall, StepFunction};
use std::sync::Arc;

const FUNCTIONS: &[StepFunction] = &[StepFunction {
    name: "log",
    parameters: &[DOCUMENT_PARAM],
    access: Access::NONE,
}];

/// Records the action in the conversation history.
pub struct LogActionStep {
    name: String,
    history: Arc<dyn HistoryWriter>,
    action: String,
}

impl LogActionStep {
    pub fn new(name: impl Into<String>, history: Arc<dyn HistoryWriter>, action: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            history,
            action: action.into(),
        }
    }

    async fn log(&self, call: StepCall) -> Result<Emissions> {
        let entry = {
            let record = call.record.read().await;
            HistoryRecord {
                conversation_id: record.conversation_id().to_string(),
                session_id: record.session_id().to_string(),
                file_id: record.file_id().to_string(),
                action: self.action.clone(),
                source_uri: record.uri().map(str::to_string),
                timestamp: chrono::Utc::now(),
            }
        };
        tracing::debug!(step = %self.name, action = %entry.action, file_id = %entry.file_id, "logging action");
        self.history.append(entry).await?;
        Ok(Emissions::one(events::ACTION_LOG_SAVED))
    }
}

impl Step for LogActionStep {
    fn kind(&self) -> &'static str {
        "log_action"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn functions(&self) -> &[StepFunction] {
        FUNCTIONS
    }

    fn invoke<'a>(&'a self, function: &'a str, call: StepCall) -> BoxFut<'a, Result<Emissions>> {
        Box::pin(async move {
            match function {
                "log" => self.log(call).await,
                other => Err(unknown_function(&self.name, other)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::MemoryHistory;
    use crate::steps::testing::{call, shared, text_record};

    #[tokio::test]
    async fn test_log_appends_history() {
        let history = Arc::new(MemoryHistory::new());
        let step = LogActionStep::new("log", history.clone(), "upload");
        let record = shared(text_record("x"));
        record.write().await.set_uri("memory://docs/a.txt");

        let out = step.invoke("log", call(&record, "Uploaded")).await.unwrap();
        assert_eq!(out, Emissions::one(events::ACTION_LOG_SAVED));

        let records = history.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].conversation_id, "conv-1");
        assert_eq!(records[0].session_id, "sess-1");
        assert_eq!(records[0].action, "upload");
        assert_eq!(records[0].source_uri.as_deref(), Some("memory://docs/a.txt"));
    }

    #[tokio::test]
    async fn test_unknown_function() {
        let step = LogActionStep::new("log", Arc::new(MemoryHistory::new()), "upload");
        let record = shared(text_record("x"));
        let err = step.invoke("write", call(&record, "Uploaded")).await.unwrap_err();
        assert!(err.is_configuration());
    }
}
