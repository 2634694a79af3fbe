//! Incremental `text/event-stream` decoder.
//!
//! Bytes arrive in arbitrary chunks; complete `\n`-terminated lines are
//! folded into events, and a blank line finishes an event. Events that
//! carried no `data:` field are dropped. Comment lines (`:` prefix) and
//! unknown fields are ignored.

use std::mem;

/// One decoded event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerEvent {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: String,
}

#[derive(Debug, Default)]
pub struct EventDecoder {
    buffer: Vec<u8>,
    pending: ServerEvent,
    has_data: bool,
    last_event_id: Option<String>,
}

impl EventDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent `id:` seen on the stream.
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// Feed a chunk and return the events it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<ServerEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        let mut consumed = 0;
        while let Some(offset) = self.buffer[consumed..].iter().position(|&b| b == b'\n') {
            let end = consumed + offset;
            let line = String::from_utf8_lossy(&self.buffer[consumed..end]).into_owned();
            if let Some(event) = self.process_line(line.trim_end_matches('\r')) {
                events.push(event);
            }
            consumed = end + 1;
        }
        self.buffer.drain(..consumed);
        events
    }

    fn process_line(&mut self, line: &str) -> Option<ServerEvent> {
        if line.is_empty() {
            let event = mem::take(&mut self.pending);
            return mem::take(&mut self.has_data).then_some(event);
        }
        if line.starts_with(':') {
            return None;
        }

        let (name, value) = match line.split_once(':') {
            Some((name, value)) => (name, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match name {
            "data" => {
                if self.has_data {
                    self.pending.data.push('\n');
                }
                self.pending.data.push_str(value);
                self.has_data = true;
            }
            "id" => {
                self.pending.id = Some(value.to_owned());
                self.last_event_id = Some(value.to_owned());
            }
            "event" => self.pending.event = Some(value.to_owned()),
            _ => {}
        }
        None
    }
}
