//! Frame validation and reply-frame decoding.

use super::command::{Mode, MotorMask};
use crate::error::{AppResult, CollectorError};
use std::io::{ErrorKind, Read};
use std::time::{Duration, Instant};

/// Start-of-frame delimiter `<`
pub const START_MARKER: u8 = 0x3C;
/// End-of-frame delimiter `>`
pub const END_MARKER: u8 = 0x3E;

/// Check that a raw command string is well formed before it is transmitted.
///
/// A frame is valid when it starts with `<`, ends with `>`, contains a comma, its
/// first field is a known mode and its second field one of the eight masks.
/// Anything else is simply not sent.
pub fn is_valid(raw: &str) -> bool {
    if !(raw.starts_with('<') && raw.ends_with('>') && raw.contains(',')) {
        return false;
    }

    let mut fields = raw[1..].split(',');
    let mode_ok = fields
        .next()
        .map(|field| Mode::ALL.iter().any(|mode| mode.as_str() == field))
        .unwrap_or(false);
    let mask_ok = fields
        .next()
        .map(|field| MotorMask::enumerate().any(|mask| mask.to_string() == field))
        .unwrap_or(false);

    mode_ok && mask_ok
}

/// Incremental decoder for delimited frames.
///
/// Bytes before a start marker are discarded; bytes after it are accumulated,
/// markers excluded, until the end marker completes the frame.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    in_frame: bool,
    payload: Vec<u8>,
}

impl FrameDecoder {
    /// A decoder waiting for its first start marker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one byte. Returns the payload once a frame completes.
    pub fn push(&mut self, byte: u8) -> Option<String> {
        if !self.in_frame {
            if byte == START_MARKER {
                self.in_frame = true;
                self.payload.clear();
            }
            return None;
        }

        match byte {
            END_MARKER => {
                self.in_frame = false;
                let payload = String::from_utf8_lossy(&self.payload).into_owned();
                self.payload.clear();
                Some(payload)
            }
            // A repeated start marker is dropped, like the firmware's own parser.
            START_MARKER => None,
            _ => {
                self.payload.push(byte);
                None
            }
        }
    }

    /// Whether a start marker has been seen without its end marker.
    pub fn in_frame(&self) -> bool {
        self.in_frame
    }
}

/// Blocking read of one reply frame with an overall deadline.
///
/// The reader is expected to have a short per-read timeout of its own (serial
/// ports are opened with one); `TimedOut`/`WouldBlock` from a single read just
/// loops until `timeout` has elapsed, then `CollectorError::Timeout` is returned.
pub fn read_frame<R: Read + ?Sized>(reader: &mut R, timeout: Duration) -> AppResult<String> {
    let mut decoder = FrameDecoder::new();
    let mut buffer = [0u8; 1];
    let start = Instant::now();

    loop {
        if start.elapsed() > timeout {
            return Err(CollectorError::Timeout(timeout));
        }

        match reader.read(&mut buffer) {
            Ok(0) => return Err(CollectorError::SerialUnexpectedEof),
            Ok(_) => {
                if let Some(payload) = decoder.push(buffer[0]) {
                    return Ok(payload);
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                continue;
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(CollectorError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn validates_known_frames() {
        assert!(is_valid("<RUN,111,1,2,3>"));
        assert!(is_valid("<SET_ACCEL,111,1000.0,1000.0,1000.0>"));
        assert!(is_valid("<STOP,000,0.0,0.0,0.0>"));
    }

    #[test]
    fn rejects_malformed_frames() {
        assert!(!is_valid("<RUN,999,1,2,3>"));
        assert!(!is_valid("no brackets"));
        assert!(!is_valid("<FOO,111,0,0,0>"));
        assert!(!is_valid("<this should not work>"));
        assert!(!is_valid("Or even, this>"));
        assert!(!is_valid("<RUN, 123, 0.0, 0.0, 0.0>"));
        assert!(!is_valid("<RUN,111>"));
        assert!(!is_valid(""));
    }

    #[test]
    fn decoder_skips_noise_before_start_marker() {
        let mut decoder = FrameDecoder::new();
        let mut out = None;
        for byte in b"garbage>\r\n<Arduino is ready>" {
            if let Some(frame) = decoder.push(*byte) {
                out = Some(frame);
            }
        }
        assert_eq!(out.as_deref(), Some("Arduino is ready"));
        assert!(!decoder.in_frame());
    }

    #[test]
    fn decoder_yields_consecutive_frames() {
        let mut decoder = FrameDecoder::new();
        let frames: Vec<String> = b"<one><two>"
            .iter()
            .filter_map(|b| decoder.push(*b))
            .collect();
        assert_eq!(frames, vec!["one", "two"]);
    }

    #[test]
    fn read_frame_returns_payload() {
        let mut cursor = Cursor::new(b"xx<RUN,111,84.0,84.0,84.0>".to_vec());
        let frame = read_frame(&mut cursor, Duration::from_secs(1)).unwrap();
        assert_eq!(frame, "RUN,111,84.0,84.0,84.0");
    }

    #[test]
    fn read_frame_reports_eof() {
        let mut cursor = Cursor::new(b"<unterminated".to_vec());
        let err = read_frame(&mut cursor, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, CollectorError::SerialUnexpectedEof));
    }

    struct SilentPort;

    impl Read for SilentPort {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            std::thread::sleep(Duration::from_millis(5));
            Err(std::io::Error::new(ErrorKind::TimedOut, "no data"))
        }
    }

    #[test]
    fn read_frame_times_out_on_silent_port() {
        let err = read_frame(&mut SilentPort, Duration::from_millis(30)).unwrap_err();
        assert!(matches!(err, CollectorError::Timeout(t) if t == Duration::from_millis(30)));
    }
}
