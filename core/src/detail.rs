//! The detail log: a verbatim trace of every request and response of a transaction.
//!
//! Events are appended to an arena owned by the log and referenced from two
//! ordered index lists, `Input` and `Output`. Nothing is ever removed from
//! the arena until [`DetailLog::end`] serializes the record and starts a new,
//! empty one.
//!
//! # Request/response pairing
//!
//! An output request starts a timer keyed by its `invoke`. The next input
//! event carrying the same `invoke` stops the timer and records the elapsed
//! time in `ResTime`. Input events without a running timer carry no `ResTime`.
//!
//! # Concurrency
//!
//! All state sits behind one mutex. Fan-out HTTP workers record their
//! responses from several tasks at once; the relative order of events
//! recorded by a single task is preserved.

use crate::environment::Clock;
use crate::masking::Masker;
use crate::payload::Payload;
use crate::sink::{LogKind, Sinks};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Direction of a detail event, seen from this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// The inbound request/message that opened the transaction, or any other
    /// request received by this process.
    RequestIn,
    /// The result of an outbound call.
    ResponseIn,
    /// An outbound call about to be made.
    RequestOut,
    /// The final response sent back to the original caller.
    ResponseOut,
}

impl Direction {
    /// Value written into the `Type` field.
    #[must_use]
    pub const fn type_tag(self) -> &'static str {
        match self {
            Self::RequestIn | Self::RequestOut => "req",
            Self::ResponseIn | Self::ResponseOut => "res",
        }
    }

    /// Whether the event lands in the `Input` list.
    #[must_use]
    pub const fn is_input(self) -> bool {
        matches!(self, Self::RequestIn | Self::ResponseIn)
    }
}

/// Position of an event in the detail arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventIndex(usize);

/// One recorded event.
#[derive(Debug, Clone, PartialEq)]
pub struct DetailEvent {
    /// Per-call correlation id.
    pub invoke: String,
    /// `node.command`.
    pub event: String,
    /// Direction of the event.
    pub direction: Direction,
    /// Protocol tag (e.g. `kafka`, `HTTP/1.1.POST`).
    pub protocol: Option<String>,
    /// Verbatim payload, masked.
    pub raw: Option<Payload>,
    /// Structured payload, masked.
    pub data: Payload,
    /// Time since the matching output request.
    pub elapsed: Option<Duration>,
}

/// Arguments of [`DetailLog::record`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    /// Direction of the event.
    pub direction: Direction,
    /// Node (downstream system) name.
    pub node: String,
    /// Command executed on the node.
    pub cmd: String,
    /// Per-call correlation id.
    pub invoke: String,
    /// Optional protocol tag.
    pub protocol: Option<String>,
    /// Verbatim payload; written only when raw data is enabled.
    pub raw: Option<Payload>,
    /// Structured payload.
    pub data: Payload,
}

impl NewEvent {
    /// Create an event without protocol tag.
    #[must_use]
    pub fn new(
        direction: Direction,
        node: impl Into<String>,
        cmd: impl Into<String>,
        invoke: impl Into<String>,
        raw: Option<Payload>,
        data: Payload,
    ) -> Self {
        Self {
            direction,
            node: node.into(),
            cmd: cmd.into(),
            invoke: invoke.into(),
            protocol: None,
            raw,
            data,
        }
    }

    /// Set the protocol tag.
    #[must_use]
    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }
}

/// Identity fields shared by every record of a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RecordHeader {
    pub(crate) host: String,
    pub(crate) app_name: String,
    pub(crate) instance: String,
    pub(crate) session: String,
    pub(crate) init_invoke: String,
    pub(crate) scenario: String,
    pub(crate) identity: String,
}

#[derive(Debug, Default)]
struct DetailState {
    arena: Vec<DetailEvent>,
    input: Vec<EventIndex>,
    output: Vec<EventIndex>,
    timers: HashMap<String, Instant>,
    started: Option<Instant>,
    input_at: Option<DateTime<Utc>>,
    output_at: Option<DateTime<Utc>>,
}

impl DetailState {
    const fn is_empty(&self) -> bool {
        self.started.is_none()
    }
}

/// The detail log of one transaction.
pub struct DetailLog {
    header: RecordHeader,
    raw_data: bool,
    masker: Masker,
    sinks: Sinks,
    clock: Arc<dyn Clock>,
    state: Mutex<DetailState>,
}

impl std::fmt::Debug for DetailLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetailLog")
            .field("init_invoke", &self.header.init_invoke)
            .field("scenario", &self.header.scenario)
            .field("events", &self.event_count())
            .finish_non_exhaustive()
    }
}

impl DetailLog {
    pub(crate) fn new(
        header: RecordHeader,
        raw_data: bool,
        masker: Masker,
        sinks: Sinks,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            header,
            raw_data,
            masker,
            sinks,
            clock,
            state: Mutex::new(DetailState::default()),
        }
    }

    /// Whether verbatim payloads are written.
    #[must_use]
    pub const fn is_raw_data_enabled(&self) -> bool {
        self.raw_data
    }

    /// Root correlation id of the transaction.
    #[must_use]
    pub fn init_invoke(&self) -> &str {
        &self.header.init_invoke
    }

    /// Record a request received by this process.
    pub fn add_input_request(
        &self,
        node: &str,
        cmd: &str,
        invoke: &str,
        raw: Option<Payload>,
        data: Payload,
    ) {
        self.record(NewEvent::new(Direction::RequestIn, node, cmd, invoke, raw, data));
    }

    /// Record the result of an outbound call.
    pub fn add_input_response(
        &self,
        node: &str,
        cmd: &str,
        invoke: &str,
        raw: Option<Payload>,
        data: Payload,
    ) {
        self.record(NewEvent::new(Direction::ResponseIn, node, cmd, invoke, raw, data));
    }

    /// Record an outbound call about to be made and start its timer.
    pub fn add_output_request(
        &self,
        node: &str,
        cmd: &str,
        invoke: &str,
        raw: Option<Payload>,
        data: Payload,
    ) {
        self.record(NewEvent::new(Direction::RequestOut, node, cmd, invoke, raw, data));
    }

    /// Record the final response sent back to the original caller.
    pub fn add_output_response(
        &self,
        node: &str,
        cmd: &str,
        invoke: &str,
        raw: Option<Payload>,
        data: Payload,
    ) {
        self.record(NewEvent::new(Direction::ResponseOut, node, cmd, invoke, raw, data));
    }

    /// Append an event, returning its arena index.
    pub fn record(&self, new: NewEvent) -> EventIndex {
        let now = Instant::now();
        let timestamp = self.clock.now();
        let raw = new.raw.map(|raw| self.masker.mask_payload(raw));
        let data = self.masker.mask_payload(new.data);

        let mut state = self.lock();
        state.started.get_or_insert(now);

        let mut elapsed = None;
        if new.direction.is_input() {
            state.input_at = Some(timestamp);
            if let Some(started) = state.timers.remove(&new.invoke) {
                elapsed = Some(now.saturating_duration_since(started));
            }
        } else {
            state.output_at = Some(timestamp);
            if new.direction == Direction::RequestOut && !new.invoke.is_empty() {
                state.timers.insert(new.invoke.clone(), now);
            }
        }

        let index = EventIndex(state.arena.len());
        state.arena.push(DetailEvent {
            invoke: new.invoke,
            event: format!("{}.{}", new.node, new.cmd),
            direction: new.direction,
            protocol: new.protocol,
            raw,
            data,
            elapsed,
        });
        if new.direction.is_input() {
            state.input.push(index);
        } else {
            state.output.push(index);
        }
        index
    }

    /// Number of events recorded since the last [`end`](Self::end).
    #[must_use]
    pub fn event_count(&self) -> usize {
        self.lock().arena.len()
    }

    /// Snapshot of the `Input` list.
    #[must_use]
    pub fn input_events(&self) -> Vec<DetailEvent> {
        let state = self.lock();
        state.input.iter().map(|i| state.arena[i.0].clone()).collect()
    }

    /// Snapshot of the `Output` list.
    #[must_use]
    pub fn output_events(&self) -> Vec<DetailEvent> {
        let state = self.lock();
        state.output.iter().map(|i| state.arena[i.0].clone()).collect()
    }

    /// Serialize the record to the detail sinks and clear all events.
    ///
    /// # Panics
    ///
    /// Panics if no event was recorded since the log was opened or last
    /// ended. That is a programming error in the caller, not a runtime
    /// condition; use [`auto_end`](Self::auto_end) when the log may be empty.
    pub fn end(&self) {
        let state = std::mem::take(&mut *self.lock());
        assert!(!state.is_empty(), "DetailLog::end called without any input/output");
        self.flush(state);
    }

    /// End the log if at least one event was recorded; returns whether it did.
    pub fn auto_end(&self) -> bool {
        let state = {
            let mut guard = self.lock();
            if guard.is_empty() {
                return false;
            }
            std::mem::take(&mut *guard)
        };
        self.flush(state);
        true
    }

    fn flush(&self, state: DetailState) {
        let processing = state
            .started
            .map(|started| started.elapsed())
            .unwrap_or_default();

        let render = |indices: &[EventIndex]| -> Vec<EventRecord> {
            indices
                .iter()
                .map(|i| EventRecord::from_event(&state.arena[i.0], self.raw_data))
                .collect()
        };

        let record = DetailRecord {
            log_type: "Detail",
            host: &self.header.host,
            app_name: &self.header.app_name,
            instance: &self.header.instance,
            session: &self.header.session,
            init_invoke: &self.header.init_invoke,
            scenario: &self.header.scenario,
            identity: &self.header.identity,
            input_time_stamp: state.input_at.map(format_timestamp),
            input: render(&state.input),
            output_time_stamp: state.output_at.map(format_timestamp),
            output: render(&state.output),
            processing_time: format_millis(processing),
        };

        match serde_json::to_string(&record) {
            Ok(line) => self.sinks.write(LogKind::Detail, &line),
            Err(e) => tracing::error!(
                init_invoke = %self.header.init_invoke,
                error = %e,
                "Failed to serialize detail record"
            ),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DetailState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct DetailRecord<'a> {
    log_type: &'static str,
    host: &'a str,
    app_name: &'a str,
    instance: &'a str,
    session: &'a str,
    init_invoke: &'a str,
    scenario: &'a str,
    identity: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    input_time_stamp: Option<String>,
    input: Vec<EventRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_time_stamp: Option<String>,
    output: Vec<EventRecord>,
    processing_time: String,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct EventRecord {
    invoke: String,
    event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    protocol: Option<String>,
    #[serde(rename = "Type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    raw_data: Option<Value>,
    data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    res_time: Option<String>,
}

impl EventRecord {
    fn from_event(event: &DetailEvent, raw_data: bool) -> Self {
        Self {
            invoke: event.invoke.clone(),
            event: event.event.clone(),
            protocol: event.protocol.clone(),
            kind: event.direction.type_tag(),
            raw_data: event
                .raw
                .as_ref()
                .filter(|raw| raw_data && !raw.is_empty())
                .map(Payload::to_value),
            data: event.data.to_value(),
            res_time: event.elapsed.map(format_millis),
        }
    }
}

/// Render a duration the way records carry them: `"<millis> ms"`.
#[must_use]
pub fn format_millis(duration: Duration) -> String {
    format!("{} ms", duration.as_millis())
}

/// Render a timestamp the way records carry them (RFC 3339, milliseconds, UTC).
#[must_use]
pub fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::environment::SystemClock;
    use crate::sink::LogSink;
    use serde_json::json;

    #[derive(Default)]
    struct Capture(Mutex<Vec<String>>);

    impl LogSink for Capture {
        fn write_line(&self, line: &str) -> std::io::Result<()> {
            self.0.lock().unwrap().push(line.to_string());
            Ok(())
        }
    }

    impl Capture {
        fn records(&self) -> Vec<Value> {
            self.0
                .lock()
                .unwrap()
                .iter()
                .map(|l| serde_json::from_str(l).unwrap())
                .collect()
        }
    }

    fn header() -> RecordHeader {
        RecordHeader {
            host: "host".into(),
            app_name: "app".into(),
            instance: "1".into(),
            session: "s".into(),
            init_invoke: "x-tid:root".into(),
            scenario: "service.register".into(),
            identity: "anonymous".into(),
        }
    }

    fn detail(raw_data: bool) -> (DetailLog, Arc<Capture>) {
        let capture = Arc::new(Capture::default());
        let sinks = Sinks::shared(Arc::clone(&capture) as Arc<dyn LogSink>);
        let log = DetailLog::new(
            header(),
            raw_data,
            Masker::default(),
            sinks,
            Arc::new(SystemClock),
        );
        (log, capture)
    }

    #[test]
    fn paired_input_carries_elapsed_time() {
        let (log, _) = detail(false);
        log.add_output_request("mongo", "insertOne", "inv-1", None, Payload::Empty);
        std::thread::sleep(Duration::from_millis(5));
        log.add_input_response("mongo", "insertOne", "inv-1", None, Payload::Empty);

        let input = log.input_events();
        assert_eq!(input.len(), 1);
        assert!(input[0].elapsed.unwrap() >= Duration::from_millis(5));
    }

    #[test]
    fn unpaired_input_has_no_elapsed_time() {
        let (log, _) = detail(false);
        log.add_output_request("mongo", "insertOne", "inv-1", None, Payload::Empty);
        log.add_input_request("mongo", "insertOne", "inv-2", None, Payload::Empty);

        assert!(log.input_events()[0].elapsed.is_none());
    }

    #[test]
    fn timer_is_consumed_by_first_matching_input() {
        let (log, _) = detail(false);
        log.add_output_request("db", "select", "inv", None, Payload::Empty);
        log.add_input_response("db", "select", "inv", None, Payload::Empty);
        log.add_input_response("db", "select", "inv", None, Payload::Empty);

        let input = log.input_events();
        assert!(input[0].elapsed.is_some());
        assert!(input[1].elapsed.is_none());
    }

    #[test]
    fn end_writes_one_record_and_clears() {
        let (log, capture) = detail(false);
        let (cmd, invoke) = ("service.register", "x-tid:root");
        log.add_input_request("client", cmd, invoke, None, json!({"a": 1}).into());
        log.add_output_response("client", cmd, invoke, None, json!({"ok": true}).into());
        log.end();

        assert_eq!(log.event_count(), 0);
        let records = capture.records();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record["LogType"], "Detail");
        assert_eq!(record["Scenario"], "service.register");
        assert_eq!(record["Input"][0]["Event"], "client.service.register");
        assert_eq!(record["Input"][0]["Type"], "req");
        assert_eq!(record["Output"][0]["Type"], "res");
        assert!(record["Input"][0].get("ResTime").is_none());
        assert!(record["ProcessingTime"].as_str().unwrap().ends_with(" ms"));
    }

    #[test]
    fn raw_data_is_suppressed_unless_enabled() {
        let (log, capture) = detail(false);
        let raw = Some(Payload::raw("wire"));
        log.add_input_request("client", "cmd", "i", raw, json!({"k": "v"}).into());
        log.end();
        let record = &capture.records()[0];
        assert!(record["Input"][0].get("RawData").is_none());
        assert_eq!(record["Input"][0]["Data"], json!({"k": "v"}));

        let (log, capture) = detail(true);
        log.add_input_request("client", "cmd", "i", Some(Payload::raw("wire")), Payload::Empty);
        log.end();
        assert_eq!(capture.records()[0]["Input"][0]["RawData"], "wire");
    }

    #[test]
    fn payloads_are_masked() {
        let (log, capture) = detail(true);
        let body = json!({"password": "secret", "email": "annabel@example.com"});
        log.add_input_request(
            "client",
            "cmd",
            "i",
            Some(Payload::raw(body.to_string())),
            body.into(),
        );
        log.end();
        let record = &capture.records()[0];
        assert_eq!(record["Input"][0]["Data"]["password"], "******");
        assert_eq!(record["Input"][0]["Data"]["email"], "ann****@example.com");
        assert!(!record["Input"][0]["RawData"].as_str().unwrap().contains("secret"));
    }

    #[test]
    fn auto_end_skips_empty_log() {
        let (log, capture) = detail(false);
        assert!(!log.auto_end());
        assert!(capture.records().is_empty());

        log.add_output_request("mail_server", "send_mail", "i", None, Payload::Empty);
        assert!(log.auto_end());
        assert_eq!(capture.records().len(), 1);
    }

    #[test]
    #[should_panic(expected = "without any input/output")]
    fn end_without_events_is_a_contract_violation() {
        let (log, _) = detail(false);
        log.end();
    }
}
