// Incremental Server-Sent-Events decoder.
//
// Used by the upstream streaming client, which reads the response body in
// arbitrarily sized chunks.  Field parsing follows the WHATWG event-stream
// grammar: `field: value` lines accumulate into an event, a blank line
// dispatches it, and `:`-prefixed lines are comments (upstream heartbeats).

/// One decoded SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// The `event:` field; defaults to `message` when absent.
    pub name: String,
    /// All `data:` lines joined with newlines.
    pub data: String,
}

/// Streaming decoder: feed body chunks in, take complete events out.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event_name: Option<String>,
    data_lines: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        SseDecoder::default()
    }

    /// Append a chunk of the response body and return every event completed
    /// by it, in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=newline).collect();
            line.pop(); // the \n
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line).into_owned();
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }
        events
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            // Comment line; servers send these as keep-alives.
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event_name = Some(value.to_owned()),
            "data" => self.data_lines.push(value.to_owned()),
            // `id` and `retry` are legal but unused by the upstream protocol.
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let name = self.event_name.take();
        let data_lines = std::mem::take(&mut self.data_lines);
        if data_lines.is_empty() {
            // Blank line with no accumulated data resets state but emits nothing.
            return None;
        }
        Some(SseEvent {
            name: name.unwrap_or_else(|| "message".to_owned()),
            data: data_lines.join("\n"),
        })
    }
}
