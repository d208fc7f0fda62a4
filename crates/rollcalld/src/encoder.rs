//! Out-of-process face detector/encoder.
//!
//! The helper is a long-lived child speaking a line protocol over stdio.
//! Per frame the daemon writes a JSON header line
//! `{"width":W,"height":H,"len":N}` followed by `N` raw grayscale bytes;
//! the helper answers with one JSON line, either an array of
//! `{"region":{..},"signature":[..]}` objects or `{"error":"..."}`.

use rollcall_core::{DetectionEvent, EncoderError, FaceEncoder};
use rollcall_hw::Frame;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

#[derive(Serialize)]
struct FrameHeader {
    width: u32,
    height: u32,
    len: usize,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Response {
    Detections(Vec<DetectionEvent>),
    Error { error: String },
}

/// Parse one response line from the helper.
pub fn decode_response(line: &str) -> Result<Vec<DetectionEvent>, EncoderError> {
    match serde_json::from_str::<Response>(line.trim()) {
        Ok(Response::Detections(detections)) => Ok(detections),
        Ok(Response::Error { error }) => Err(EncoderError::Failed(error)),
        Err(e) => Err(EncoderError::Protocol(e.to_string())),
    }
}

/// A running helper. Pipe I/O happens on two threads so a stalled helper
/// can be abandoned after `timeout` instead of blocking the monitor loop.
struct Helper {
    child: Child,
    requests: Sender<Vec<u8>>,
    replies: Receiver<std::io::Result<String>>,
    timeout: Duration,
}

impl Helper {
    fn spawn(command: &[String], timeout: Duration) -> Result<Self, EncoderError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| EncoderError::Unavailable("encoder command is empty".into()))?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| EncoderError::Unavailable(format!("{program}: {e}")))?;

        let (Some(mut stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(EncoderError::Unavailable("encoder stdio not captured".into()));
        };

        let (requests, pending) = mpsc::channel::<Vec<u8>>();
        let (reply_tx, replies) = mpsc::channel();

        let writer = std::thread::Builder::new()
            .name("rollcall-encoder-in".into())
            .spawn(move || {
                for payload in pending {
                    if let Err(e) = stdin.write_all(&payload).and_then(|()| stdin.flush()) {
                        tracing::debug!(error = %e, "encoder input closed");
                        break;
                    }
                }
            });

        let reader = std::thread::Builder::new()
            .name("rollcall-encoder-out".into())
            .spawn(move || {
                let mut stdout = BufReader::new(stdout);
                loop {
                    let mut line = String::new();
                    let reply = match stdout.read_line(&mut line) {
                        Ok(0) => break,
                        Ok(_) => Ok(line),
                        Err(e) => Err(e),
                    };
                    let failed = reply.is_err();
                    if reply_tx.send(reply).is_err() || failed {
                        break;
                    }
                }
            });

        if let Err(e) = writer.and(reader) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(EncoderError::Unavailable(format!("encoder threads: {e}")));
        }

        tracing::info!(program = %program, pid = child.id(), "encoder helper started");
        Ok(Self {
            child,
            requests,
            replies,
            timeout,
        })
    }

    fn exchange(&mut self, frame: &Frame) -> Result<String, EncoderError> {
        let header = FrameHeader {
            width: frame.width,
            height: frame.height,
            len: frame.data.len(),
        };
        let mut payload =
            serde_json::to_vec(&header).map_err(|e| EncoderError::Protocol(e.to_string()))?;
        payload.push(b'\n');
        payload.extend_from_slice(&frame.data);

        self.requests
            .send(payload)
            .map_err(|_| EncoderError::Unavailable("encoder closed its input".into()))?;

        match self.replies.recv_timeout(self.timeout) {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => Err(EncoderError::Unavailable(format!("encoder helper i/o: {e}"))),
            Err(RecvTimeoutError::Timeout) => Err(EncoderError::Unavailable(format!(
                "no reply within {} ms",
                self.timeout.as_millis()
            ))),
            Err(RecvTimeoutError::Disconnected) => {
                Err(EncoderError::Unavailable("encoder closed its output".into()))
            }
        }
    }
}

impl Drop for Helper {
    fn drop(&mut self) {
        // The pipe threads exit on their own once the child is gone.
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// [`FaceEncoder`] backed by an external helper process.
///
/// A helper that dies or misses the reply deadline is killed and
/// restarted on the next processed frame.
pub struct CommandEncoder {
    command: Vec<String>,
    timeout: Duration,
    helper: Option<Helper>,
}

impl CommandEncoder {
    /// Start the helper; fails if it cannot be launched.
    pub fn spawn(command: Vec<String>, timeout: Duration) -> Result<Self, EncoderError> {
        let helper = Helper::spawn(&command, timeout)?;
        Ok(Self {
            command,
            timeout,
            helper: Some(helper),
        })
    }
}

impl FaceEncoder<Frame> for CommandEncoder {
    fn detect_and_encode(&mut self, frame: &Frame) -> Result<Vec<DetectionEvent>, EncoderError> {
        if frame.is_dark {
            tracing::debug!(sequence = frame.sequence, "dark frame; no detections");
            return Ok(Vec::new());
        }

        if self.helper.is_none() {
            self.helper = Some(Helper::spawn(&self.command, self.timeout)?);
        }
        let Some(helper) = self.helper.as_mut() else {
            return Err(EncoderError::Unavailable("encoder helper not running".into()));
        };

        match helper.exchange(frame) {
            Ok(reply) => decode_response(&reply),
            Err(e) => {
                tracing::warn!(error = %e, "dropping encoder helper");
                self.helper = None;
                Err(e)
            }
        }
    }
}
