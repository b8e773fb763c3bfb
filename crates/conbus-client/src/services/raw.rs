//! Raw frame sending.
//!
//! Splits a user-provided string into `<...>` regions and sends each one
//! verbatim, no validation and no checksum rewriting. Every reply received
//! before the rolling timeout lands in the response's telegram log.

use std::cell::RefCell;
use std::rc::Rc;

use conbus_proto::payload_bytes;
use serde::Serialize;
use tokio::time::{Duration, Instant};

use super::{Exchange, ResponseStatus, ServiceScope, WireLog, connect_scoped, track_wire};
use crate::protocol::ConbusConnection;
use crate::signal::Signal;

/// Extract the `<...>` regions of a user string, markers included.
fn split_frames(input: &str) -> Vec<String> {
    let mut frames = Vec::new();
    let mut rest = input;
    while let Some(start) = rest.find('<') {
        let Some(len) = rest[start..].find('>') else { break };
        frames.push(rest[start..=start + len].to_owned());
        rest = &rest[start + len + 1..];
    }
    frames
}

/// Result of a raw send.
#[derive(Debug, Clone, Serialize)]
pub struct RawResponse {
    /// Frames extracted from the input, as given.
    pub frames: Vec<String>,
    /// Shared outcome fields; replies are in `received_telegrams`.
    #[serde(flatten)]
    pub exchange: Exchange,
}

/// Sends user-authored frames and records whatever comes back.
pub struct RawService {
    connection: Rc<ConbusConnection>,
    input: String,

    /// Fires once with the final response.
    pub on_finish: Signal<RawResponse>,
}

impl RawService {
    /// Create a raw service over the given input string.
    #[must_use]
    pub fn new(connection: Rc<ConbusConnection>, input: impl Into<String>) -> Rc<Self> {
        Rc::new(Self { connection, input: input.into(), on_finish: Signal::new() })
    }

    /// Replace the listen window (the engine's rolling timeout).
    pub fn set_timeout(&self, timeout: Duration) {
        self.connection.set_timeout(timeout);
    }

    /// Run one raw scope.
    pub async fn run(self: Rc<Self>) -> RawResponse {
        let started = Instant::now();
        let frames = split_frames(&self.input);
        let log = Rc::new(RefCell::new(WireLog::default()));
        let mut scope = ServiceScope::default();
        track_wire(&mut scope, &self.connection, &log);

        let conn = Rc::clone(&self.connection);
        let outbound = frames.clone();
        connect_scoped(&mut scope, &self.connection, |c| &c.connection_made, move |_: &()| {
            for frame in &outbound {
                conn.send_frame(payload_bytes(frame));
            }
        });

        let own = Rc::clone(&self);
        scope.defer(move || own.on_finish.clear());

        let outcome = if frames.is_empty() {
            log.borrow_mut().error = Some("no <...> frames in input".to_owned());
            Err(())
        } else {
            self.connection.run().await.map_err(|_| ())
        };
        let status = match outcome {
            Err(()) if frames.is_empty() => ResponseStatus::Failed,
            Err(()) => ResponseStatus::FailedConnection,
            Ok(()) => ResponseStatus::Ok,
        };
        let response =
            RawResponse { frames, exchange: log.borrow().to_exchange(status, started) };
        self.on_finish.emit(&response);
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_multiple_frames_and_ignores_noise() {
        let frames = split_frames("x<S0000000000F01D00FA> <E14L00I02MAK>tail");
        assert_eq!(frames, vec!["<S0000000000F01D00FA>", "<E14L00I02MAK>"]);
    }

    #[test]
    fn unterminated_region_is_dropped() {
        assert!(split_frames("<S0000000000F01").is_empty());
        assert!(split_frames("no frames at all").is_empty());
    }
}
