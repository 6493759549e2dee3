//! The summary log: one record per transaction with the result of every call.
//!
//! Results are grouped into blocks keyed by `(node, cmd)`. The first result
//! for a pair creates its block; later results append to it, so repeated
//! calls to the same command are visible as a sequence with a count.
//!
//! A summary ends exactly once. The second [`SummaryLog::end`] returns
//! [`LogError::SummaryAlreadyEnded`] and writes nothing.

use crate::detail::{format_millis, format_timestamp, RecordHeader};
use crate::environment::Clock;
use crate::error::LogError;
use crate::sink::{LogKind, Sinks};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// One recorded result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryResult {
    /// Result code (e.g. `"200"`, `"500"`).
    pub code: String,
    /// Short description.
    pub desc: String,
}

/// All results recorded for one `(node, cmd)` pair, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryBlock {
    /// Node (downstream system) name.
    pub node: String,
    /// Command executed on the node.
    pub cmd: String,
    /// Results in the order they were recorded.
    pub results: Vec<SummaryResult>,
}

impl SummaryBlock {
    /// Number of results in the block.
    #[must_use]
    pub fn count(&self) -> usize {
        self.results.len()
    }
}

#[derive(Debug, Default)]
struct SummaryState {
    blocks: Vec<SummaryBlock>,
    custom: Map<String, Value>,
    ended: bool,
}

/// The summary log of one transaction.
pub struct SummaryLog {
    header: RecordHeader,
    sinks: Sinks,
    clock: Arc<dyn Clock>,
    started_at: DateTime<Utc>,
    started: Instant,
    state: Mutex<SummaryState>,
}

impl std::fmt::Debug for SummaryLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SummaryLog")
            .field("init_invoke", &self.header.init_invoke)
            .field("ended", &self.is_end())
            .finish_non_exhaustive()
    }
}

impl SummaryLog {
    pub(crate) fn new(header: RecordHeader, sinks: Sinks, clock: Arc<dyn Clock>) -> Self {
        let started_at = clock.now();
        Self {
            header,
            sinks,
            clock,
            started_at,
            started: Instant::now(),
            state: Mutex::new(SummaryState::default()),
        }
    }

    /// Record a successful call.
    pub fn add_success_block(&self, node: &str, cmd: &str, code: &str, desc: &str) {
        self.add_block(node, cmd, code, desc);
    }

    /// Record a failed call.
    pub fn add_error_block(&self, node: &str, cmd: &str, code: &str, desc: &str) {
        tracing::debug!(node, cmd, code, desc, "Summary error block");
        self.add_block(node, cmd, code, desc);
    }

    fn add_block(&self, node: &str, cmd: &str, code: &str, desc: &str) {
        let result = SummaryResult {
            code: code.to_string(),
            desc: desc.to_string(),
        };
        let mut state = self.lock();
        if let Some(block) = state
            .blocks
            .iter_mut()
            .find(|b| b.node == node && b.cmd == cmd)
        {
            block.results.push(result);
        } else {
            state.blocks.push(SummaryBlock {
                node: node.to_string(),
                cmd: cmd.to_string(),
                results: vec![result],
            });
        }
    }

    /// Attach a custom field written under `CustomDesc`.
    ///
    /// Setting the same name twice keeps the last value.
    pub fn add_field(&self, name: &str, value: impl Serialize) {
        let value = serde_json::to_value(value).unwrap_or_else(|e| Value::String(e.to_string()));
        self.lock().custom.insert(name.to_string(), value);
    }

    /// Whether the summary has been ended.
    #[must_use]
    pub fn is_end(&self) -> bool {
        self.lock().ended
    }

    /// Snapshot of the recorded blocks.
    #[must_use]
    pub fn blocks(&self) -> Vec<SummaryBlock> {
        self.lock().blocks.clone()
    }

    /// Write the record with the transaction's overall result.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::SummaryAlreadyEnded`] if the summary was already
    /// ended, or [`LogError::Serialize`] if the record could not be serialized.
    pub fn end(&self, code: &str, desc: &str) -> Result<(), LogError> {
        let (blocks, custom) = {
            let mut state = self.lock();
            if state.ended {
                return Err(LogError::SummaryAlreadyEnded);
            }
            state.ended = true;
            (state.blocks.clone(), state.custom.clone())
        };

        let record = SummaryRecord {
            log_type: "Summary",
            input_time_stamp: format_timestamp(self.started_at),
            host: &self.header.host,
            app_name: &self.header.app_name,
            instance: &self.header.instance,
            session: &self.header.session,
            init_invoke: &self.header.init_invoke,
            scenario: &self.header.scenario,
            response_result: code,
            response_desc: desc,
            sequences: blocks.iter().map(SequenceRecord::from_block).collect(),
            end_process_time_stamp: format_timestamp(self.clock.now()),
            process_time: format_millis(self.started.elapsed()),
            custom_desc: (!custom.is_empty()).then_some(custom),
        };

        let line = serde_json::to_string(&record)?;
        self.sinks.write(LogKind::Summary, &line);
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, SummaryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct SummaryRecord<'a> {
    log_type: &'static str,
    input_time_stamp: String,
    host: &'a str,
    app_name: &'a str,
    instance: &'a str,
    session: &'a str,
    init_invoke: &'a str,
    scenario: &'a str,
    response_result: &'a str,
    response_desc: &'a str,
    sequences: Vec<SequenceRecord<'a>>,
    end_process_time_stamp: String,
    process_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    custom_desc: Option<Map<String, Value>>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct SequenceRecord<'a> {
    node: &'a str,
    cmd: &'a str,
    result: Vec<ResultRecord<'a>>,
}

impl<'a> SequenceRecord<'a> {
    fn from_block(block: &'a SummaryBlock) -> Self {
        Self {
            node: &block.node,
            cmd: &block.cmd,
            result: block
                .results
                .iter()
                .map(|r| ResultRecord {
                    result: &r.code,
                    desc: &r.desc,
                })
                .collect(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct ResultRecord<'a> {
    result: &'a str,
    desc: &'a str,
}
