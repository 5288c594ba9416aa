//! Client for the external memory worker.
//!
//! The worker speaks newline-delimited JSON over `.memory.sock`: one
//! `{method, collection?, params?}` request, one `{ok, result | error}` reply.
//! Every call goes through the `memory_socket` service breaker so a dead
//! worker costs one connect attempt per recovery window rather than one per
//! hook.

use crate::breaker::{ServiceBreaker, ServiceThresholds};
use crate::config::{MemoryConfig, Paths};
use crate::events::{self, Event};
use crate::state::now_secs;
use serde_json::{json, Map, Value};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use thiserror::Error;

#[cfg(unix)]
use std::os::unix::net::UnixStream;

pub const SERVICE_NAME: &str = "memory_socket";

pub const MEMORY_THRESHOLDS: ServiceThresholds = ServiceThresholds {
    failure_threshold: 3,
    recovery_timeout: 30.0,
    success_threshold: 1,
};

const READ_CHUNK: u64 = 64 * 1024;

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Memory worker unavailable: {0}")]
    WorkerUnavailable(String),

    #[error("Circuit breaker open: {SERVICE_NAME} unavailable")]
    CircuitOpen,

    #[error("Memory worker error: {0}")]
    Remote(String),

    #[error("Response exceeded {0} bytes")]
    ResponseTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MemoryError {
    /// Failures that say nothing about worker health
    fn counts_against_breaker(&self) -> bool {
        !matches!(self, Self::CircuitOpen | Self::Remote(_))
    }
}

pub type Result<T> = std::result::Result<T, MemoryError>;

pub struct MemoryClient {
    socket: PathBuf,
    timeout: Duration,
    max_response_bytes: usize,
    breaker: ServiceBreaker,
}

impl MemoryClient {
    pub fn new(paths: &Paths, config: &MemoryConfig) -> Self {
        Self {
            socket: paths.memory_socket(),
            timeout: Duration::from_millis(config.timeout_ms),
            max_response_bytes: config.max_response_bytes,
            breaker: ServiceBreaker::new(paths),
        }
    }

    /// Send one request and return the worker's `result`
    pub fn request(
        &self,
        method: &str,
        collection: Option<&str>,
        params: Option<Value>,
    ) -> Result<Value> {
        let now = now_secs();
        if self.breaker.is_open(SERVICE_NAME, now) {
            return Err(MemoryError::CircuitOpen);
        }

        let mut req = Map::new();
        req.insert("method".into(), Value::String(method.to_string()));
        if let Some(c) = collection {
            req.insert("collection".into(), Value::String(c.to_string()));
        }
        if let Some(p) = params {
            req.insert("params".into(), p);
        }

        let start = Instant::now();
        let result = self.round_trip(&Value::Object(req));
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        events::emit(Event::memory_request(method, result.is_ok(), elapsed_ms));

        match &result {
            Ok(_) => self
                .breaker
                .record_success(SERVICE_NAME, MEMORY_THRESHOLDS, now_secs()),
            Err(e) if e.counts_against_breaker() => {
                tracing::debug!(method, error = %e, "memory request failed");
                self.breaker
                    .record_failure(SERVICE_NAME, MEMORY_THRESHOLDS, now_secs());
            }
            Err(_) => {}
        }
        result
    }

    #[cfg(unix)]
    fn round_trip(&self, req: &Value) -> Result<Value> {
        let mut stream = UnixStream::connect(&self.socket).map_err(|e| {
            MemoryError::WorkerUnavailable(format!("Cannot connect to memory worker: {}", e))
        })?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;

        let mut line = serde_json::to_vec(req)?;
        line.push(b'\n');
        stream.write_all(&line)?;

        let buf = read_line_capped(&mut stream, self.max_response_bytes)?;
        if buf.iter().all(u8::is_ascii_whitespace) {
            return Err(MemoryError::WorkerUnavailable(
                "Empty response from memory worker".into(),
            ));
        }
        let resp: Value = serde_json::from_slice(&buf)?;
        if resp.get("ok").and_then(Value::as_bool) != Some(true) {
            let message = resp
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("Unknown worker error");
            return Err(MemoryError::Remote(message.to_string()));
        }
        Ok(resp.get("result").cloned().unwrap_or(Value::Null))
    }

    #[cfg(not(unix))]
    fn round_trip(&self, _req: &Value) -> Result<Value> {
        Err(MemoryError::WorkerUnavailable(
            "Unix sockets are not supported on this platform".into(),
        ))
    }

    /// Connect without sending anything
    #[cfg(unix)]
    pub fn is_available(&self) -> bool {
        !self.breaker.is_open(SERVICE_NAME, now_secs()) && UnixStream::connect(&self.socket).is_ok()
    }

    #[cfg(not(unix))]
    pub fn is_available(&self) -> bool {
        false
    }

    pub fn ping(&self) -> Result<Value> {
        self.request("ping", None, None)
    }

    pub fn count(&self, collection: &str) -> Result<u64> {
        let result = self.request("count", Some(collection), None)?;
        Ok(result.as_u64().unwrap_or(0))
    }

    pub fn query(
        &self,
        collection: &str,
        query_texts: &[&str],
        n_results: u32,
        include: Option<&[&str]>,
    ) -> Result<Value> {
        let mut params = json!({"query_texts": query_texts, "n_results": n_results});
        if let Some(include) = include {
            params["include"] = json!(include);
        }
        self.request("query", Some(collection), Some(params))
    }

    pub fn get(
        &self,
        collection: &str,
        ids: Option<&[&str]>,
        limit: Option<u32>,
        include: Option<&[&str]>,
    ) -> Result<Value> {
        let mut params = json!({});
        if let Some(ids) = ids {
            params["ids"] = json!(ids);
        }
        if let Some(limit) = limit {
            params["limit"] = json!(limit);
        }
        if let Some(include) = include {
            params["include"] = json!(include);
        }
        self.request("get", Some(collection), Some(params))
    }

    pub fn delete(&self, collection: &str, ids: &[&str]) -> Result<Value> {
        self.request("delete", Some(collection), Some(json!({"ids": ids})))
    }

    /// Save a memory into the knowledge collection
    pub fn remember(&self, content: &str, context: &str, tags: &str) -> Result<Value> {
        self.request(
            "auto_remember",
            None,
            Some(json!({"content": content, "context": context, "tags": tags})),
        )
    }

    /// Ask the worker to ingest the observation capture queue
    pub fn flush_queue(&self) -> Result<Value> {
        self.request("flush_queue", None, None)
    }

    pub fn backup(&self) -> Result<Value> {
        self.request("backup", None, None)
    }
}

/// Read up to the first newline, failing once more than `max` bytes arrive
fn read_line_capped<R: Read>(reader: R, max: usize) -> Result<Vec<u8>> {
    let mut reader = BufReader::new(reader.take(max as u64 + READ_CHUNK));
    let mut buf = Vec::new();
    reader.read_until(b'\n', &mut buf)?;
    if buf.len() > max {
        return Err(MemoryError::ResponseTooLarge(max));
    }
    Ok(buf)
}


#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn client(dir: &TempDir) -> MemoryClient {
        let paths = Paths::under(dir.path());
        MemoryClient::new(&paths, &MemoryConfig::default())
    }

    fn serve(dir: &TempDir, replies: Vec<&'static str>) -> std::thread::JoinHandle<Vec<Value>> {
        test_support::serve(&Paths::under(dir.path()), replies)
    }

    #[test]
    fn test_request_round_trip() {
        let dir = TempDir::new().unwrap();
        let server = serve(
            &dir,
            vec![
                "{\"ok\":true,\"result\":\"pong\"}\n",
                "{\"ok\":true,\"result\":42}\n",
                "{\"ok\":true,\"result\":{\"id\":\"m1\"}}\n",
            ],
        );
        let client = client(&dir);
        assert_eq!(client.ping().unwrap(), json!("pong"));
        assert_eq!(client.count("knowledge").unwrap(), 42);
        assert_eq!(client.remember("fixed it", "ctx", "type:fix").unwrap()["id"], "m1");

        let seen = server.join().unwrap();
        assert_eq!(seen[0], json!({"method": "ping"}));
        assert_eq!(seen[1], json!({"method": "count", "collection": "knowledge"}));
        assert_eq!(seen[2]["method"], "auto_remember");
        assert_eq!(seen[2]["params"]["tags"], "type:fix");
    }

    #[test]
    fn test_query_get_and_maintenance_requests() {
        let dir = TempDir::new().unwrap();
        let server = serve(
            &dir,
            vec![
                "{\"ok\":true,\"result\":{\"ids\":[[\"m1\"]],\"distances\":[[0.2]]}}\n",
                "{\"ok\":true,\"result\":{\"ids\":[\"m1\"],\"documents\":[\"doc\"]}}\n",
                "{\"ok\":true,\"result\":{\"deleted\":1}}\n",
                "{\"ok\":true,\"result\":{\"flushed\":4}}\n",
                "{\"ok\":true,\"result\":{\"path\":\"/b/1.tar\"}}\n",
            ],
        );
        let client = client(&dir);
        let hits = client.query("knowledge", &["KeyError"], 3, Some(&["documents"])).unwrap();
        assert_eq!(hits["ids"][0][0], "m1");
        let got = client.get("knowledge", Some(&["m1"]), Some(5), None).unwrap();
        assert_eq!(got["documents"][0], "doc");
        assert_eq!(client.delete("knowledge", &["m1"]).unwrap()["deleted"], 1);
        assert_eq!(client.flush_queue().unwrap()["flushed"], 4);
        assert_eq!(client.backup().unwrap()["path"], "/b/1.tar");

        let seen = server.join().unwrap();
        assert_eq!(
            seen[0],
            json!({
                "method": "query",
                "collection": "knowledge",
                "params": {"query_texts": ["KeyError"], "n_results": 3, "include": ["documents"]}
            })
        );
        assert_eq!(seen[1]["params"], json!({"ids": ["m1"], "limit": 5}));
        assert_eq!(seen[2], json!({"method": "delete", "collection": "knowledge", "params": {"ids": ["m1"]}}));
        assert_eq!(seen[3], json!({"method": "flush_queue"}));
        assert_eq!(seen[4], json!({"method": "backup"}));
    }

    #[test]
    fn test_remote_error_does_not_trip_breaker() {
        let dir = TempDir::new().unwrap();
        let server = serve(&dir, vec!["{\"ok\":false,\"error\":\"bad collection\"}\n"]);
        let client = client(&dir);
        match client.count("nope") {
            Err(MemoryError::Remote(msg)) => assert_eq!(msg, "bad collection"),
            other => panic!("unexpected: {:?}", other),
        }
        server.join().unwrap();
        assert!(!client.breaker.is_open(SERVICE_NAME, now_secs()));
    }

    #[test]
    fn test_missing_worker_opens_breaker() {
        let dir = TempDir::new().unwrap();
        let client = client(&dir);
        for _ in 0..3 {
            assert!(matches!(client.ping(), Err(MemoryError::WorkerUnavailable(_))));
        }
        assert!(matches!(client.ping(), Err(MemoryError::CircuitOpen)));
        assert!(!client.is_available());
    }

    #[test]
    fn test_read_line_capped() {
        let line = read_line_capped(&b"{\"ok\":true}\nrest"[..], 100).unwrap();
        assert_eq!(line, b"{\"ok\":true}\n");
        let big = vec![b'x'; 200];
        assert!(matches!(
            read_line_capped(&big[..], 100),
            Err(MemoryError::ResponseTooLarge(100))
        ));
    }
}
