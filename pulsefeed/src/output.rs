//! Terminal rendering for command results

use pulsefeed_client::{ApiResponse, ClientError, StreamEvent, StreamMessage};

/// One status line for a completed call
pub fn response_line(endpoint: &str, response: &ApiResponse) -> String {
    format!(
        "{} status={} from_cache={} time={}ms bytes={}",
        endpoint,
        response.status(),
        response.from_cache,
        response.response_time.as_millis(),
        response.data.body.len()
    )
}

/// One line per batch slot, in request order
pub fn batch_line(index: usize, endpoint: &str, result: &Result<ApiResponse, ClientError>) -> String {
    match result {
        Ok(response) => format!("[{}] {}", index, response_line(endpoint, response)),
        Err(e) => format!("[{}] {} error: {}", index, endpoint, e),
    }
}

/// Body text, pretty-printed when it is JSON
pub fn body_text(response: &ApiResponse) -> String {
    match response.json::<serde_json::Value>() {
        Ok(value) => serde_json::to_string_pretty(&value).unwrap_or_else(|_| response.text()),
        Err(_) => response.text(),
    }
}

pub fn stream_event_line(event: &StreamEvent) -> String {
    match event {
        StreamEvent::Opened { url } => format!("-- connected to {}", url),
        StreamEvent::Message(StreamMessage::Event(event)) => match &event.id {
            Some(id) => format!("{} [{}]: {}", event.event_type(), id, event.data),
            None => format!("{}: {}", event.event_type(), event.data),
        },
        StreamEvent::Message(StreamMessage::Text(text)) => text.clone(),
        StreamEvent::Message(StreamMessage::Binary(data)) => format!("<{} bytes>", data.len()),
        StreamEvent::Error(e) => format!("-- error: {}", e),
        StreamEvent::Closed { reason } => format!("-- closed: {}", reason),
    }
}
