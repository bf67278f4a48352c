//! Simulated ELM327 adapter
//!
//! Runs an in-process adapter on one end of a [`tokio::io::duplex`] pipe so
//! sessions, gates and pollers can be exercised without hardware. AT commands
//! answer `OK`, mode 01 queries for registered PIDs answer with synthetic
//! bytes from the descriptor's sample generator, and anything else answers
//! `NO DATA`. Canned responses, silence, latency and chunked delivery can be
//! configured per adapter.

use crate::connector::StreamConnector;
use crate::mode;
use crate::pid::hex_string;
use crate::protocol::{is_at_command, CURRENT_DATA_RESPONSE};
use crate::registry::PidRegistry;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tracing::debug;

/// Commands the adapter has received, exactly as they came over the wire
/// (terminator stripped)
#[derive(Debug, Clone, Default)]
pub struct CommandLog(Arc<Mutex<Vec<String>>>);

impl CommandLog {
    pub fn commands(&self) -> Vec<String> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn push(&self, cmd: String) {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).push(cmd);
    }
}

/// In-process ELM327 simulator
pub struct MockAdapter {
    registry: PidRegistry,
    responses: HashMap<String, String>,
    silent: HashSet<String>,
    latency: Duration,
    chunk_size: usize,
    log: CommandLog,
}

impl MockAdapter {
    pub fn new(registry: PidRegistry) -> Self {
        Self {
            registry,
            responses: HashMap::new(),
            silent: HashSet::new(),
            latency: Duration::ZERO,
            chunk_size: 0,
            log: CommandLog::default(),
        }
    }

    /// Answer `cmd` (without reply count) with a fixed response, prompt included
    pub fn respond(mut self, cmd: &str, response: &str) -> Self {
        self.responses.insert(cmd.to_uppercase(), response.to_string());
        self
    }

    /// Never answer `cmd`
    pub fn silent(mut self, cmd: &str) -> Self {
        self.silent.insert(cmd.to_uppercase());
        self
    }

    /// Delay every response
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Deliver responses in pieces of `size` bytes
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    pub fn log(&self) -> CommandLog {
        self.log.clone()
    }

    /// The response to `cmd`, or `None` if the adapter stays silent
    pub fn response_for(&self, cmd: &str, seed: u64) -> Option<String> {
        if self.silent.contains(cmd) {
            return None;
        }
        if let Some(response) = self.responses.get(cmd) {
            return Some(response.clone());
        }
        if is_at_command(cmd) {
            return Some("OK\r\r>".to_string());
        }
        let sampled = cmd
            .strip_prefix(mode::CURRENT_DATA)
            .filter(|code| code.len() == 2)
            .and_then(|code| self.registry.lookup(code))
            .map(|pid| {
                format!(
                    "{}{}{}\r\r>",
                    CURRENT_DATA_RESPONSE,
                    pid.code(),
                    hex_string(&pid.sample_bytes(seed))
                )
            });
        Some(sampled.unwrap_or_else(|| "NO DATA\r\r>".to_string()))
    }

    /// Start the adapter and return the host's end of the pipe
    pub fn spawn(self) -> DuplexStream {
        let (client, server) = tokio::io::duplex(4096);
        tokio::spawn(self.serve(server));
        client
    }

    /// Start the adapter behind a one-shot connector
    pub fn connector(self) -> StreamConnector {
        StreamConnector::new(self.spawn())
    }

    async fn serve(self, mut stream: DuplexStream) {
        let mut line = Vec::new();
        let mut buf = [0u8; 64];
        let mut seed = 0u64;

        loop {
            let n = match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            for &byte in &buf[..n] {
                match byte {
                    b'\r' => {
                        let wire = String::from_utf8_lossy(&line).trim().to_uppercase();
                        line.clear();
                        if wire.is_empty() {
                            continue;
                        }
                        debug!("Mock adapter RX: {}", wire);
                        self.log.push(wire.clone());
                        seed += 1;
                        let Some(response) = self.response_for(strip_reply_count(&wire), seed) else {
                            continue;
                        };
                        if !self.latency.is_zero() {
                            tokio::time::sleep(self.latency).await;
                        }
                        if self.write_response(&mut stream, &response).await.is_err() {
                            return;
                        }
                    }
                    b'\n' => {}
                    _ => line.push(byte),
                }
            }
        }
        debug!("Mock adapter disconnected");
    }

    async fn write_response(&self, stream: &mut DuplexStream, response: &str) -> std::io::Result<()> {
        let size = if self.chunk_size == 0 {
            response.len().max(1)
        } else {
            self.chunk_size
        };
        for chunk in response.as_bytes().chunks(size) {
            stream.write_all(chunk).await?;
            stream.flush().await?;
            tokio::task::yield_now().await;
        }
        Ok(())
    }
}

/// Drop the trailing reply-count digit the gate appends
fn strip_reply_count(wire: &str) -> &str {
    match wire.char_indices().last() {
        Some((i, c)) if c.is_ascii_digit() => &wire[..i],
        _ => wire,
    }
}
