//! Newline-delimited JSON framing for the response body.
//!
//! The encoder writes one JSON record per line. The decoder is the tolerant
//! consumer side: it buffers partial lines across chunk boundaries and skips
//! lines that do not parse.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Serialize, de::DeserializeOwned};
use std::marker::PhantomData;
use tokio_util::codec::{Decoder, Encoder};

/// Default ceiling for a single line (16 MB).
const DEFAULT_MAX_LENGTH: usize = 16 * 1024 * 1024;

/// Newline-delimited JSON codec.
#[derive(Debug)]
pub struct NdJsonCodec<T> {
    _phantom: PhantomData<T>,
    max_length: usize,
    skipped: usize,
}

impl<T> NdJsonCodec<T> {
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            _phantom: PhantomData,
            max_length,
            skipped: 0,
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Number of malformed lines dropped so far.
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

impl<T> Default for NdJsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for NdJsonCodec<T> {
    fn clone(&self) -> Self {
        Self {
            _phantom: PhantomData,
            max_length: self.max_length,
            skipped: 0,
        }
    }
}

impl<T: DeserializeOwned> NdJsonCodec<T> {
    fn parse_line(&mut self, line: &[u8]) -> Option<T> {
        let trimmed = line.trim_ascii();
        if trimmed.is_empty() {
            return None;
        }
        match serde_json::from_slice(trimmed) {
            Ok(item) => Some(item),
            Err(e) => {
                self.skipped += 1;
                tracing::debug!(error = %e, len = trimmed.len(), "Skipping malformed NDJSON line");
                None
            }
        }
    }
}

impl<T: DeserializeOwned> Decoder for NdJsonCodec<T> {
    type Item = T;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> std::result::Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(pos) = src.iter().position(|&b| b == b'\n') else {
                if src.len() > self.max_length {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("Line too large: {} > {}", src.len(), self.max_length),
                    ));
                }
                return Ok(None);
            };

            if pos > self.max_length {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("Line too large: {} > {}", pos, self.max_length),
                ));
            }

            let line = src.split_to(pos);
            src.advance(1);

            if let Some(item) = self.parse_line(&line) {
                return Ok(Some(item));
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> std::result::Result<Option<Self::Item>, Self::Error> {
        if let Some(item) = self.decode(src)? {
            return Ok(Some(item));
        }
        if src.is_empty() {
            return Ok(None);
        }
        // Trailing record without a newline
        let rest = src.split_to(src.len());
        Ok(self.parse_line(&rest))
    }
}

impl<T: Serialize> Encoder<T> for NdJsonCodec<T> {
    type Error = std::io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> std::result::Result<(), Self::Error> {
        let json = serde_json::to_vec(&item)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, format!("JSON error: {}", e)))?;

        if json.len() > self.max_length {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Message too large: {} > {}", json.len(), self.max_length),
            ));
        }

        dst.reserve(json.len() + 1);
        dst.put_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}

/// Decode every well-formed record from a complete NDJSON body.
pub fn decode_all<T: DeserializeOwned>(body: &[u8]) -> std::io::Result<Vec<T>> {
    let mut codec = NdJsonCodec::<T>::new();
    let mut buf = BytesMut::from(body);
    let mut items = Vec::new();
    while let Some(item) = codec.decode_eof(&mut buf)? {
        items.push(item);
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Phase, StreamFrame};

    #[test]
    fn test_encode_appends_newline() {
        let mut codec = NdJsonCodec::<StreamFrame>::new();
        let mut buf = BytesMut::new();
        codec.encode(StreamFrame::phase(Phase::Generating, 1, 3), &mut buf).unwrap();
        assert_eq!(buf.last(), Some(&b'\n'));
        assert_eq!(buf.iter().filter(|&&b| b == b'\n').count(), 1);
    }

    #[test]
    fn test_decode_waits_for_full_line() {
        let mut codec = NdJsonCodec::<StreamFrame>::new();
        let mut buf = BytesMut::new();
        let mut encoded = BytesMut::new();
        NdJsonCodec::<StreamFrame>::new()
            .encode(StreamFrame::phase(Phase::Validating, 1, 3), &mut encoded)
            .unwrap();

        let (head, tail) = encoded.split_at(10);
        buf.extend_from_slice(head);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(tail);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame, StreamFrame::phase(Phase::Validating, 1, 3));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_skips_malformed_lines() {
        let mut codec = NdJsonCodec::<StreamFrame>::new();
        let mut buf = BytesMut::from(
            &b"{not json\n\n{\"type\":\"phase\",\"data\":{\"phase\":\"done\",\"attempt\":1,\"maxAttempts\":1}}\n"[..],
        );
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame, StreamFrame::phase(Phase::Done, 1, 1));
        assert_eq!(codec.skipped(), 1);
    }

    #[test]
    fn test_decode_eof_reads_trailing_record() {
        let body = b"{\"type\":\"phase\",\"data\":{\"phase\":\"failed\",\"attempt\":2,\"maxAttempts\":2}}";
        let frames: Vec<StreamFrame> = decode_all(body).unwrap();
        assert_eq!(frames, vec![StreamFrame::phase(Phase::Failed, 2, 2)]);
    }

    #[test]
    fn test_decode_rejects_oversize_line() {
        let mut codec = NdJsonCodec::<StreamFrame>::with_max_length(8);
        let mut buf = BytesMut::from(&b"0123456789abcdef"[..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_decode_all_mixed_body() {
        let mut body = BytesMut::new();
        let mut codec = NdJsonCodec::<StreamFrame>::new();
        codec.encode(StreamFrame::phase(Phase::LoadingKnowledge, 0, 3), &mut body).unwrap();
        body.extend_from_slice(b"garbage\n");
        codec.encode(StreamFrame::phase(Phase::PerformingResearch, 0, 3), &mut body).unwrap();

        let frames: Vec<StreamFrame> = decode_all(&body).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1], StreamFrame::phase(Phase::PerformingResearch, 0, 3));
    }
}
