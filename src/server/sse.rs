//! Server-Sent Events framing for chat streams.
//!
//! Each pipeline event becomes one `data: <json>` frame. No event ids and
//! no retry directive; the stream simply ends after the pipeline's `done`
//! or `error` frame. Writes go through the transport's readiness, so a
//! slow client applies back-pressure to the pipeline through the channel
//! instead of buffering without bound.

use std::convert::Infallible;

use axum::response::sse::{Event, Sse};
use futures_util::stream::{self, Stream};
use tokio::sync::mpsc;

use crate::chat::events::StreamEvent;

pub fn event_stream(
    rx: mpsc::Receiver<StreamEvent>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = stream::unfold(rx, |mut rx| async move {
        let event = rx.recv().await?;
        let frame = match Event::default().json_data(&event) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!("Failed to serialize stream event: {}", err);
                Event::default().data("{\"type\":\"error\",\"content\":\"serialization failed\"}")
            }
        };
        Some((Ok(frame), rx))
    });

    Sse::new(stream)
}
