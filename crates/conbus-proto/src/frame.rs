//! Rolling-buffer frame extraction.
//!
//! The gateway delivers a raw byte stream; frames may arrive split across
//! reads or glued together, with line noise in between. [`FrameParser`]
//! accumulates bytes and yields one [`Telegram`] per complete region,
//! skipping garbage. A region runs from the last `<` before the next `>`,
//! so a stray `<` in noise cannot swallow a real frame behind it. Broken
//! regions (empty payload, unknown tag) are dropped with a debug log and
//! the buffer advances past them. Checksum mismatches are not broken
//! regions and still yield a telegram.

use bytes::{Buf, BytesMut};

use crate::Telegram;

/// Longest unterminated tail kept while waiting for a closing marker.
const MAX_PENDING: usize = 4096;

/// Incremental parser over a stream of frame bytes.
#[derive(Debug, Default)]
pub struct FrameParser {
    buf: BytesMut,
}

impl FrameParser {
    /// Create an empty parser.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly received bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Extract the next complete frame, if any.
    ///
    /// Call repeatedly after [`push`](Self::push) until `None`.
    pub fn next_frame(&mut self) -> Option<Telegram> {
        loop {
            let Some(end) = self.buf.iter().position(|&b| b == b'>') else {
                if self.buf.len() > MAX_PENDING {
                    tracing::debug!(
                        pending = self.buf.len(),
                        "no frame end within cap, dropping pending bytes"
                    );
                    self.buf.clear();
                }
                return None;
            };
            let Some(start) = self.buf[..end].iter().rposition(|&b| b == b'<') else {
                // A closing marker with no opening one before it: noise.
                tracing::debug!(skipped = end + 1, "discarding bytes with no frame start");
                self.buf.advance(end + 1);
                continue;
            };
            if start > 0 {
                tracing::debug!(skipped = start, "discarding bytes before frame start");
            }
            let parsed = Telegram::parse(&self.buf[start..=end]);
            self.buf.advance(end + 1);
            match parsed {
                Ok(telegram) => return Some(telegram),
                Err(error) => tracing::debug!(%error, "dropping malformed frame region"),
            }
        }
    }

    /// Bytes currently buffered and not yet consumed.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(parser: &mut FrameParser) -> Vec<String> {
        let mut frames = Vec::new();
        while let Some(t) = parser.next_frame() {
            frames.push(t.frame_display());
        }
        frames
    }

    #[test]
    fn parses_back_to_back_frames() {
        let mut parser = FrameParser::new();
        parser.push(b"<S0000000000F01D00FA><R0020030837F01DFM>");
        assert_eq!(
            collect(&mut parser),
            vec!["<S0000000000F01D00FA>", "<R0020030837F01DFM>"]
        );
    }

    #[test]
    fn reassembles_frames_split_across_pushes() {
        let mut parser = FrameParser::new();
        parser.push(b"<R00200");
        assert!(parser.next_frame().is_none());
        parser.push(b"30837F01DFM>");
        assert_eq!(collect(&mut parser), vec!["<R0020030837F01DFM>"]);
    }

    #[test]
    fn skips_garbage_between_frames() {
        let mut parser = FrameParser::new();
        parser.push(b"noise<R0020030837F01DFM>\r\n<E14L00I02MAK>junk");
        assert_eq!(collect(&mut parser), vec!["<R0020030837F01DFM>", "<E14L00I02MAK>"]);
    }

    #[test]
    fn surfaces_bad_checksum_frames() {
        let mut parser = FrameParser::new();
        parser.push(b"<R0020030837F01DZZ>");
        let telegram = parser.next_frame().unwrap();
        assert!(!telegram.checksum_valid());
    }

    #[test]
    fn drops_empty_regions_silently() {
        let mut parser = FrameParser::new();
        parser.push(b"<><R0020030837F01DFM>");
        assert_eq!(collect(&mut parser), vec!["<R0020030837F01DFM>"]);
    }

    #[test]
    fn stray_start_marker_does_not_swallow_next_frame() {
        let mut parser = FrameParser::new();
        parser.push(b"<R0020030837F01D<E14L00I02MAK>");
        assert_eq!(collect(&mut parser), vec!["<E14L00I02MAK>"]);
    }

    #[test]
    fn unterminated_noise_is_capped() {
        let mut parser = FrameParser::new();
        let mut noise = vec![b'<'];
        noise.extend(std::iter::repeat_n(b'x', MAX_PENDING + 16));
        parser.push(&noise);
        assert!(parser.next_frame().is_none());
        assert_eq!(parser.pending(), 0);
        parser.push(b"<E14L00I02MAK>");
        assert_eq!(collect(&mut parser), vec!["<E14L00I02MAK>"]);
    }
}
