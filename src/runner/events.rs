//! Line-JSON event output for the isolation runner.
//!
//! The runner's standard output is a protocol surface: every line is one
//! JSON object with a `type` tag and an RFC3339 `timestamp`. Container
//! output wraps `data`, diagnostics wrap `message`, and lifecycle events
//! carry a `data` map. The supervisor on the other end of the pipe parses
//! these lines and forwards them to the client stream.
//!
//! Writes are flushed per event so a crash never strands a buffered line.

use std::io::Write;
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};

/// Shared event emitter.
///
/// Cloning is cheap; all clones serialize onto one writer, which keeps
/// events in emission order across the runner's tasks.
#[derive(Clone)]
pub struct Events {
    out: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl Events {
    /// Emits to the process's standard output.
    #[must_use]
    pub fn stdout() -> Self {
        Self::with_writer(Box::new(std::io::stdout()))
    }

    /// Emits to an arbitrary writer (used by tests).
    #[must_use]
    pub fn with_writer(writer: Box<dyn Write + Send>) -> Self {
        Self {
            out: Arc::new(Mutex::new(writer)),
        }
    }

    fn timestamp() -> String {
        Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
    }

    fn emit(&self, value: Value) {
        let Ok(mut line) = serde_json::to_string(&value) else {
            eprintln!("failed to serialize output message");
            return;
        };
        line.push('\n');

        if let Ok(mut out) = self.out.lock() {
            let _ = out.write_all(line.as_bytes());
            let _ = out.flush();
        }
    }

    fn message(&self, kind: &str, message: &str) {
        self.emit(json!({
            "type": kind,
            "message": message,
            "timestamp": Self::timestamp(),
        }));
    }

    fn lifecycle(&self, kind: &str, data: Value) {
        self.emit(json!({
            "type": kind,
            "timestamp": Self::timestamp(),
            "data": data,
        }));
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    pub fn info(&self, message: impl AsRef<str>) {
        self.message("info", message.as_ref());
    }

    pub fn warning(&self, message: impl AsRef<str>) {
        self.message("warning", message.as_ref());
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.message("error", message.as_ref());
    }

    // =========================================================================
    // Container Output
    // =========================================================================

    pub fn container_stdout(&self, data: &str) {
        self.emit(json!({
            "type": "container:stdout",
            "timestamp": Self::timestamp(),
            "data": { "data": data },
        }));
    }

    pub fn container_stderr(&self, data: &str) {
        self.emit(json!({
            "type": "container:stderr",
            "timestamp": Self::timestamp(),
            "data": { "data": data },
        }));
    }

    // =========================================================================
    // Lifecycle Events
    // =========================================================================

    /// Terminal exit marker with the workload's exit code.
    pub fn container_exit(&self, exit_code: i32) {
        self.emit(json!({
            "type": "container_exited",
            "exit_code": exit_code,
            "timestamp": Self::timestamp(),
        }));
    }

    pub fn container_created(&self, container_id: &str, container_name: &str, image: &str) {
        self.lifecycle(
            "container_created",
            json!({
                "container_id": container_id,
                "container_name": container_name,
                "image": image,
            }),
        );
    }

    pub fn container_started(&self, container_id: &str, container_name: &str, pid: i64) {
        self.lifecycle(
            "container_started",
            json!({
                "container_id": container_id,
                "container_name": container_name,
                "pid": pid,
            }),
        );
    }

    pub fn image_pull_started(&self, image: &str, registry: &str, authenticated: bool) {
        self.lifecycle(
            "image_pull_started",
            json!({
                "image": image,
                "registry": registry,
                "authenticated": authenticated,
            }),
        );
    }

    pub fn image_pull_completed(&self, image: &str, registry: &str, already_present: bool) {
        self.lifecycle(
            "image_pull_completed",
            json!({
                "image": image,
                "registry": registry,
                "already_present": already_present,
            }),
        );
    }

    pub fn container_ip_ready(&self, container_id: &str, ip_address: &str, network: &str) {
        self.lifecycle(
            "container_ip_ready",
            json!({
                "container_id": container_id,
                "ip_address": ip_address,
                "network": network,
            }),
        );
    }

    pub fn network_isolation_ready(&self, container_id: &str, chain_name: &str, default_policy: &str) {
        self.lifecycle(
            "network_isolation_ready",
            json!({
                "container_id": container_id,
                "chain_name": chain_name,
                "default_policy": default_policy,
            }),
        );
    }

    pub fn container_terminating(&self, container_id: &str, reason: &str, force: bool) {
        self.lifecycle(
            "container_terminating",
            json!({
                "container_id": container_id,
                "reason": reason,
                "force": force,
            }),
        );
    }

    /// Detailed exit event carrying the run duration.
    pub fn container_exited(&self, container_id: &str, exit_code: i32, duration: &str) {
        self.lifecycle(
            "container_exited",
            json!({
                "container_id": container_id,
                "exit_code": exit_code,
                "duration": duration,
            }),
        );
    }

    /// Emitted once the container is started and network isolation holds.
    pub fn container_ready(&self, container_id: &str, ip_address: &str) {
        self.lifecycle(
            "container_ready",
            json!({
                "container_id": container_id,
                "ip_address": ip_address,
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Writer that appends into a shared buffer.
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn capture() -> (Events, Arc<Mutex<Vec<u8>>>) {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let events = Events::with_writer(Box::new(SharedBuf(Arc::clone(&buf))));
        (events, buf)
    }

    fn lines(buf: &Arc<Mutex<Vec<u8>>>) -> Vec<Value> {
        String::from_utf8(buf.lock().unwrap().clone())
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn every_event_is_one_json_line_with_timestamp() {
        let (events, buf) = capture();
        events.info("starting");
        events.container_stdout("hello\n");
        events.container_exit(0);

        let parsed = lines(&buf);
        assert_eq!(parsed.len(), 3);
        for value in &parsed {
            assert!(value["type"].is_string());
            assert!(value["timestamp"].is_string());
        }
    }

    #[test]
    fn container_output_nests_data() {
        let (events, buf) = capture();
        events.container_stdout("hello\n");
        events.container_stderr("oops\n");

        let parsed = lines(&buf);
        assert_eq!(parsed[0]["type"], "container:stdout");
        assert_eq!(parsed[0]["data"]["data"], "hello\n");
        assert_eq!(parsed[1]["type"], "container:stderr");
        assert_eq!(parsed[1]["data"]["data"], "oops\n");
    }

    #[test]
    fn exit_marker_carries_code_at_top_level() {
        let (events, buf) = capture();
        events.container_exit(124);

        let parsed = lines(&buf);
        assert_eq!(parsed[0]["type"], "container_exited");
        assert_eq!(parsed[0]["exit_code"], 124);
    }

    #[test]
    fn lifecycle_events_carry_data_maps() {
        let (events, buf) = capture();
        events.container_created("cid123", "hpod-ab12cd34", "alpine:latest");
        events.network_isolation_ready("cid123", "ISO-0123456789abcdef", "deny");
        events.container_exited("cid123", 0, "1.2s");

        let parsed = lines(&buf);
        assert_eq!(parsed[0]["data"]["image"], "alpine:latest");
        assert_eq!(parsed[1]["data"]["chain_name"], "ISO-0123456789abcdef");
        assert_eq!(parsed[2]["data"]["exit_code"], 0);
        assert_eq!(parsed[2]["data"]["duration"], "1.2s");
    }
}
