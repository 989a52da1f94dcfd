//! Per-protocol TCP frame extraction: growing the read buffer until a
//! complete frame is available, then handing it to the protocol's
//! `Decoder`. Each text dialect gets a terminator; Teltonika gets its own
//! length-prefixed state machine.
//!
//! Grounded on `mayara-server/src/network`'s bounded-read discipline
//! (connections that never produce a complete frame within a size cap are
//! dropped rather than left buffering indefinitely).

use tokio::io::{self, AsyncReadExt};
use tokio::net::TcpStream;

/// Hard cap on how much unterminated data a single connection may buffer
/// before it is treated as misbehaving and dropped.
const TEXT_FRAME_CAP: usize = 2 * 1024;
const BINARY_FRAME_CAP: usize = 10 * 1024 * 1024;
const READ_CHUNK: usize = 4 * 1024;

#[derive(Clone, Copy)]
pub enum FramePolicy {
    /// Read until a single delimiter byte, exclusive.
    Delimiter(u8),
    /// Read until a multi-byte delimiter sequence, exclusive.
    Sequence(&'static [u8]),
    /// Teltonika's IMEI-handshake-then-length-prefixed-AVL-packet framing.
    Teltonika,
}

pub fn policy_for(protocol: &str) -> FramePolicy {
    match protocol {
        "gps103" => FramePolicy::Delimiter(b';'),
        "h02" => FramePolicy::Delimiter(b'#'),
        // OsmAnd speaks plain HTTP GET; framing on the blank line after
        // headers is enough since the body (if any) is never used. No HTTP
        // response is written back — the device doesn't wait for one.
        "osmand" => FramePolicy::Sequence(b"\r\n\r\n"),
        "teltonika" => FramePolicy::Teltonika,
        other => unreachable!("no framing policy registered for listener {other}"),
    }
}

pub struct FrameReader {
    stream: TcpStream,
    buf: Vec<u8>,
    policy: FramePolicy,
    teltonika_imei_seen: bool,
}

impl FrameReader {
    pub fn new(stream: TcpStream, policy: FramePolicy) -> Self {
        FrameReader {
            stream,
            buf: Vec::new(),
            policy,
            teltonika_imei_seen: false,
        }
    }

    pub async fn next_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        match self.policy {
            FramePolicy::Delimiter(byte) => self.next_delimited(&[byte]).await,
            FramePolicy::Sequence(seq) => self.next_delimited(seq).await,
            FramePolicy::Teltonika => self.next_teltonika().await,
        }
    }

    async fn next_delimited(&mut self, delimiter: &[u8]) -> io::Result<Option<Vec<u8>>> {
        loop {
            if let Some(pos) = find_subslice(&self.buf, delimiter) {
                let frame = self.buf[..pos].to_vec();
                self.buf.drain(..pos + delimiter.len());
                return Ok(Some(frame));
            }
            if self.buf.len() > TEXT_FRAME_CAP {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "frame exceeded text buffer cap without a terminator",
                ));
            }
            if !self.fill().await? {
                return Ok(None);
            }
        }
    }

    async fn next_teltonika(&mut self) -> io::Result<Option<Vec<u8>>> {
        if !self.teltonika_imei_seen {
            let Some(len_bytes) = self.read_exact_buffered(2).await? else {
                return Ok(None);
            };
            let imei_len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
            let Some(imei) = self.read_exact_buffered(imei_len).await? else {
                return Ok(None);
            };
            self.teltonika_imei_seen = true;
            let mut frame = len_bytes;
            frame.extend_from_slice(&imei);
            return Ok(Some(frame));
        }

        let Some(header) = self.read_exact_buffered(8).await? else {
            return Ok(None);
        };
        let data_length = u32::from_be_bytes(header[4..8].try_into().unwrap()) as usize;
        if data_length > BINARY_FRAME_CAP {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "teltonika data_length exceeded binary buffer cap",
            ));
        }
        let Some(rest) = self.read_exact_buffered(data_length + 4).await? else {
            return Ok(None);
        };
        let mut frame = header;
        frame.extend_from_slice(&rest);
        Ok(Some(frame))
    }

    /// Reads exactly `n` bytes, drawing from the buffer first and topping
    /// up from the socket. Returns `None` on clean EOF before `n` bytes
    /// arrive.
    async fn read_exact_buffered(&mut self, n: usize) -> io::Result<Option<Vec<u8>>> {
        while self.buf.len() < n {
            if !self.fill().await? {
                return Ok(None);
            }
        }
        Ok(Some(self.buf.drain(..n).collect()))
    }

    /// Reads one chunk from the socket into the buffer. Returns `false` on
    /// clean EOF.
    async fn fill(&mut self) -> io::Result<bool> {
        let mut chunk = vec![0u8; READ_CHUNK];
        let n = self.stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(false);
        }
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(true)
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_subslice() {
        assert_eq!(find_subslice(b"abc;def", b";"), Some(3));
        assert_eq!(find_subslice(b"abc\r\n\r\ndef", b"\r\n\r\n"), Some(3));
        assert_eq!(find_subslice(b"abc", b";"), None);
    }
}
