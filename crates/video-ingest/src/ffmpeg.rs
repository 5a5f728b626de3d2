//! `ffmpeg` child process decoding RTSP/UDP streams into raw BGR frames.

use std::{
    ffi::OsString,
    fmt::Write,
    io::{self, ErrorKind, Read, Write as IoWrite},
    process::{Child, ChildStdout, Command, Stdio},
    thread,
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use tracing::{debug, warn};

use crate::{
    FrameReader, VideoSource,
    types::{CaptureError, Frame, FrameFormat},
};

pub struct FfmpegSource {
    uri: String,
    program: OsString,
    target_size: (u32, u32),
    read_timeout: Duration,
}

impl FfmpegSource {
    pub fn new(uri: &str, target_size: (u32, u32), read_timeout: Duration) -> Self {
        Self {
            uri: uri.to_string(),
            program: OsString::from("ffmpeg"),
            target_size,
            read_timeout,
        }
    }

    /// Run a different `ffmpeg` executable.
    pub fn with_program(mut self, program: impl Into<OsString>) -> Self {
        self.program = program.into();
        self
    }

    fn command(&self) -> Result<(Command, Option<String>), CaptureError> {
        let scale_arg = format!("scale={}:{}", self.target_size.0, self.target_size.1);
        let timeout_us = self.read_timeout.as_micros().to_string();
        let mut cmd = Command::new(&self.program);
        cmd.arg("-hide_banner").arg("-loglevel").arg("error");

        let stdin_payload = if self.uri.starts_with("udp://") {
            cmd.arg("-protocol_whitelist")
                .arg("file,udp,rtp,fd,pipe")
                .arg("-fflags")
                .arg("+genpts+discardcorrupt+nobuffer")
                .arg("-flags")
                .arg("low_delay")
                .arg("-f")
                .arg("sdp")
                .arg("-i")
                .arg("-");
            Some(build_udp_sdp(&self.uri)?)
        } else {
            if self.uri.starts_with("rtsp://") || self.uri.starts_with("rtsps://") {
                cmd.arg("-rtsp_transport")
                    .arg("tcp")
                    .arg("-timeout")
                    .arg(&timeout_us);
            } else {
                cmd.arg("-rw_timeout").arg(&timeout_us);
            }
            cmd.arg("-fflags")
                .arg("nobuffer")
                .arg("-flags")
                .arg("low_delay")
                .arg("-max_delay")
                .arg("0")
                .arg("-i")
                .arg(&self.uri);
            None
        };

        cmd.arg("-an")
            .arg("-vf")
            .arg(&scale_arg)
            .arg("-pix_fmt")
            .arg("bgr24")
            .arg("-f")
            .arg("rawvideo")
            .arg("-");
        Ok((cmd, stdin_payload))
    }
}

impl VideoSource for FfmpegSource {
    fn describe(&self) -> &str {
        &self.uri
    }

    fn open(&self) -> Result<Box<dyn FrameReader>, CaptureError> {
        let open_error = |reason: String| CaptureError::Open {
            uri: self.uri.clone(),
            reason,
        };

        let (mut cmd, stdin_payload) = self.command()?;
        if stdin_payload.is_some() {
            cmd.stdin(Stdio::piped());
        } else {
            cmd.stdin(Stdio::null());
        }
        cmd.stdout(Stdio::piped()).stderr(Stdio::inherit());

        let mut child = cmd
            .spawn()
            .map_err(|err| open_error(format!("failed to spawn ffmpeg: {err}")))?;
        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(open_error("failed to capture ffmpeg stdout".into()));
        };

        if let Some(payload) = stdin_payload {
            if let Some(mut stdin) = child.stdin.take() {
                if let Err(err) = stdin.write_all(payload.as_bytes()) {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(open_error(format!("failed to send SDP to ffmpeg: {err}")));
                }
            }
        }

        let (width, height) = self.target_size;
        let frame_len = (width as usize) * (height as usize) * 3;
        let (tx, frames) = bounded(1);
        if let Err(err) = spawn_stdout_pump(stdout, frame_len, tx) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(open_error(format!("failed to start ffmpeg reader thread: {err}")));
        }

        debug!("ffmpeg decoder started for {}", self.uri);
        Ok(Box::new(FfmpegReader {
            uri: self.uri.clone(),
            child,
            frames,
            target_size: self.target_size,
            read_timeout: self.read_timeout,
        }))
    }
}

/// Read whole raw frames off ffmpeg's stdout until it fails or the reader
/// goes away. The pump exits after forwarding the first error.
fn spawn_stdout_pump(
    mut stdout: ChildStdout,
    frame_len: usize,
    tx: Sender<io::Result<Vec<u8>>>,
) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("ffmpeg-stdout".into())
        .spawn(move || {
            loop {
                let mut buffer = vec![0u8; frame_len];
                let result = stdout.read_exact(&mut buffer).map(|()| buffer);
                let failed = result.is_err();
                if tx.send(result).is_err() || failed {
                    break;
                }
            }
        })
}

struct FfmpegReader {
    uri: String,
    child: Child,
    frames: Receiver<io::Result<Vec<u8>>>,
    target_size: (u32, u32),
    read_timeout: Duration,
}

impl FrameReader for FfmpegReader {
    fn read_frame(&mut self) -> Result<Frame, CaptureError> {
        let (width, height) = self.target_size;
        match self.frames.recv_timeout(self.read_timeout) {
            Ok(Ok(buffer)) => Ok(Frame::from_raw(buffer, width, height, FrameFormat::Bgr8)),
            Ok(Err(err)) if err.kind() == ErrorKind::UnexpectedEof => {
                Err(CaptureError::EndOfStream {
                    uri: self.uri.clone(),
                })
            }
            Ok(Err(err)) => Err(CaptureError::Read {
                uri: self.uri.clone(),
                reason: err.to_string(),
            }),
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    timeout_ms = self.read_timeout.as_millis() as u64,
                    "ffmpeg stalled, killing decoder for {}", self.uri
                );
                let _ = self.child.kill();
                Err(CaptureError::Read {
                    uri: self.uri.clone(),
                    reason: format!("no frame within {} ms", self.read_timeout.as_millis()),
                })
            }
            Err(RecvTimeoutError::Disconnected) => Err(CaptureError::EndOfStream {
                uri: self.uri.clone(),
            }),
        }
    }
}

impl Drop for FfmpegReader {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Describe a raw RTP/H.264 UDP feed so ffmpeg can bind to it.
///
/// Accepts `udp://host:port?sprop=<sets>&payload=<pt>`.
fn build_udp_sdp(uri: &str) -> Result<String, CaptureError> {
    let invalid = |reason: &str| CaptureError::Open {
        uri: uri.to_string(),
        reason: reason.to_string(),
    };

    let without_scheme = uri.strip_prefix("udp://").unwrap_or(uri);
    let (endpoint, query) = match without_scheme.split_once('?') {
        Some((endpoint, query)) => (endpoint, Some(query)),
        None => (without_scheme, None),
    };
    if endpoint.is_empty() {
        return Err(invalid(
            "udp source must include host:port, e.g. udp://127.0.0.1:5000",
        ));
    }

    let (host, port_str) = match endpoint.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => (host, port),
        Some((_, port)) => ("0.0.0.0", port),
        None => ("0.0.0.0", endpoint),
    };
    let port: u16 = port_str
        .parse()
        .map_err(|_| invalid("invalid UDP port in source URI"))?;

    let mut sprop = None;
    let mut payload = "96";
    for pair in query.into_iter().flat_map(|query| query.split('&')) {
        match pair.split_once('=') {
            Some(("sprop" | "sprop-parameter-sets", value)) => sprop = Some(value),
            Some(("payload" | "pt", value)) => payload = value,
            _ => {}
        }
    }

    let mut sdp = String::new();
    let _ = writeln!(sdp, "v=0");
    let _ = writeln!(sdp, "o=- 0 0 IN IP4 {host}");
    let _ = writeln!(sdp, "s=detect-stream");
    let _ = writeln!(sdp, "c=IN IP4 {host}");
    let _ = writeln!(sdp, "t=0 0");
    let _ = writeln!(sdp, "m=video {port} RTP/AVP {payload}");
    let _ = writeln!(sdp, "a=rtpmap:{payload} H264/90000");
    match sprop {
        Some(sprop) => {
            let _ = writeln!(
                sdp,
                "a=fmtp:{payload} packetization-mode=1; sprop-parameter-sets={sprop}"
            );
        }
        None => {
            let _ = writeln!(sdp, "a=fmtp:{payload} packetization-mode=1");
        }
    }
    Ok(sdp)
}
