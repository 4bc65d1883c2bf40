//! Supervision of the inspector subprocess

use futures::StreamExt;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, error, info, warn};

use crate::error::Result;

/// Longest stdout/stderr line accepted from the subprocess
const MAX_LINE_LENGTH: usize = 64 * 1024;

/// How the subprocess ended. `code` is `None` when it was killed by a signal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
}

/// One line of the stdout protocol
#[derive(Debug, Deserialize)]
struct ProcessMessage {
    event: String,
    #[serde(default)]
    data: Value,
}

/// `LinesCodec` that drops overlong lines instead of failing the stream.
/// `FramedRead` ends the stream after any decoder error, so the skip has to
/// happen inside the codec.
struct ProtocolLines(LinesCodec);

impl ProtocolLines {
    fn new() -> Self {
        Self(LinesCodec::new_with_max_length(MAX_LINE_LENGTH))
    }
}

impl Decoder for ProtocolLines {
    type Item = String;
    type Error = LinesCodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> std::result::Result<Option<String>, LinesCodecError> {
        loop {
            match self.0.decode(buf) {
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    warn!(max = MAX_LINE_LENGTH, "Inspector output line too long, skipping it");
                }
                other => return other,
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> std::result::Result<Option<String>, LinesCodecError> {
        loop {
            match self.0.decode_eof(buf) {
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    warn!(max = MAX_LINE_LENGTH, "Inspector output line too long, skipping it");
                }
                other => return other,
            }
        }
    }
}

/// Resolves once the subprocess reports `ready`
pub struct ReadySignal(oneshot::Receiver<()>);

/// Handle to a running inspector subprocess.
///
/// The child itself is owned by a monitor task; this handle only observes its
/// exit and asks it to stop. Dropping the handle kills the process.
pub struct InspectorProcess {
    pid: Option<u32>,
    exit: watch::Receiver<Option<ProcessExit>>,
    kill: Mutex<Option<oneshot::Sender<()>>>,
}

impl InspectorProcess {
    pub fn spawn(mut command: Command) -> Result<(Self, ReadySignal)> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        let pid = child.id();

        let (ready_tx, ready_rx) = oneshot::channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(read_stdout(stdout, ready_tx));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(read_stderr(stderr, pid));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(monitor(child, kill_rx, exit_tx));

        info!(pid = ?pid, "Inspector process spawned");

        Ok((
            Self {
                pid,
                exit: exit_rx,
                kill: Mutex::new(Some(kill_tx)),
            },
            ReadySignal(ready_rx),
        ))
    }

    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    #[must_use]
    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Wait for `ready`. Fails with the exit status if the process ends first.
    pub async fn wait_ready(&self, ready: ReadySignal) -> std::result::Result<(), ProcessExit> {
        let mut ready = ready.0;
        tokio::select! {
            biased;
            result = &mut ready => match result {
                Ok(()) => Ok(()),
                // stdout closed without a ready line
                Err(_) => Err(self.wait_exit().await),
            },
            exit = self.wait_exit() => match ready.try_recv() {
                Ok(()) => Ok(()),
                Err(_) => Err(exit),
            },
        }
    }

    pub async fn wait_exit(&self) -> ProcessExit {
        let mut exit = self.exit.clone();
        let status = exit.wait_for(Option::is_some).await.map(|status| *status);
        status.ok().flatten().unwrap_or_default()
    }

    /// Ask the process to stop with SIGINT, escalating to SIGKILL once
    /// `grace` has elapsed. Returns after the process has exited.
    pub async fn shutdown(&self, grace: Duration) -> ProcessExit {
        if self.has_exited() {
            return self.wait_exit().await;
        }

        self.interrupt();

        match tokio::time::timeout(grace, self.wait_exit()).await {
            Ok(exit) => exit,
            Err(_) => {
                warn!(
                    pid = ?self.pid,
                    grace_ms = grace.as_millis() as u64,
                    "Inspector did not exit after SIGINT, killing"
                );
                self.kill();
                self.wait_exit().await
            }
        }
    }

    #[cfg(unix)]
    fn interrupt(&self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.pid.and_then(|pid| i32::try_from(pid).ok()) else {
            return;
        };
        if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGINT) {
            debug!(pid, error = %e, "Failed to send SIGINT to inspector");
        }
    }

    #[cfg(not(unix))]
    fn interrupt(&self) {
        self.kill();
    }

    fn kill(&self) {
        if let Some(kill) = self.kill.lock().take() {
            let _ = kill.send(());
        }
    }
}

async fn monitor(
    mut child: Child,
    kill: oneshot::Receiver<()>,
    exit: watch::Sender<Option<ProcessExit>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill => {
            if let Err(e) = child.start_kill() {
                debug!(error = %e, "Failed to kill inspector");
            }
            child.wait().await
        }
    };

    let status = match status {
        Ok(status) => ProcessExit {
            code: status.code(),
        },
        Err(e) => {
            error!(error = %e, "Failed to wait for inspector process");
            ProcessExit::default()
        }
    };

    debug!(code = ?status.code, "Inspector process exited");
    let _ = exit.send(Some(status));
}

/// Read the newline-delimited JSON protocol from the subprocess stdout.
/// Partial lines are buffered until their newline arrives; malformed and
/// overlong lines are skipped.
pub(crate) async fn read_stdout<R>(stdout: R, ready: oneshot::Sender<()>)
where
    R: AsyncRead + Unpin,
{
    let mut ready = Some(ready);
    let mut lines = FramedRead::new(stdout, ProtocolLines::new());

    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                debug!(error = %e, "Inspector stdout closed");
                break;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<ProcessMessage>(&line) {
            Ok(message) if message.event == "ready" => {
                info!("Inspector ready");
                if let Some(ready) = ready.take() {
                    let _ = ready.send(());
                }
            }
            Ok(message) => {
                debug!(event = %message.event, data = %message.data, "Unknown inspector event");
            }
            Err(e) => {
                warn!(line = %line, error = %e, "Malformed inspector message");
            }
        }
    }
}

async fn read_stderr<R>(stderr: R, pid: Option<u32>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = FramedRead::new(stderr, ProtocolLines::new());
    while let Some(Ok(line)) = lines.next().await {
        info!(pid = ?pid, "inspector: {}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_ready_line_split_across_chunks() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let (ready_tx, mut ready_rx) = oneshot::channel();
        let task = tokio::spawn(read_stdout(reader, ready_tx));

        writer.write_all(b"not json\n{\"event\":\"pro").await.unwrap();
        writer.write_all(b"gress\"}\n{\"event\":\"re").await.unwrap();
        tokio::task::yield_now().await;
        assert!(ready_rx.try_recv().is_err());

        writer.write_all(b"ady\"}\n").await.unwrap();
        drop(writer);

        tokio::time::timeout(Duration::from_secs(5), ready_rx)
            .await
            .unwrap()
            .unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_truncated_trailing_line_is_ignored() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(read_stdout(reader, ready_tx));

        writer.write_all(b"{\"event\":\"ready\"").await.unwrap();
        drop(writer);
        task.await.unwrap();

        // the sender was dropped without signalling
        assert!(ready_rx.await.is_err());
    }

    #[tokio::test]
    async fn test_overlong_line_is_skipped() {
        let (mut writer, reader) = tokio::io::duplex(4096);
        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(read_stdout(reader, ready_tx));

        let mut output = vec![b'x'; MAX_LINE_LENGTH + 10];
        output.push(b'\n');
        output.extend_from_slice(b"{\"event\":\"ready\"}\n");
        writer.write_all(&output).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), ready_rx)
            .await
            .unwrap()
            .unwrap();
        drop(writer);
        task.await.unwrap();
    }

    #[test]
    fn test_codec_resumes_after_overlong_line() {
        let mut codec = ProtocolLines::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&vec![b'y'; MAX_LINE_LENGTH * 2]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b"tail\nnext\n");
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("next"));
    }

    #[cfg(unix)]
    fn shell(script: &str) -> Command {
        let mut command = Command::new("sh");
        command.arg("-c").arg(script);
        command
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_before_ready() {
        let (process, ready) = InspectorProcess::spawn(shell("exit 2")).unwrap();
        let exit = process.wait_ready(ready).await.unwrap_err();
        assert_eq!(exit.code, Some(2));
        assert!(process.has_exited());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_graceful_shutdown() {
        let (process, ready) =
            InspectorProcess::spawn(shell("echo '{\"event\":\"ready\"}'; exec sleep 30")).unwrap();
        process.wait_ready(ready).await.unwrap();
        assert!(!process.has_exited());

        let exit = tokio::time::timeout(
            Duration::from_secs(10),
            process.shutdown(Duration::from_secs(5)),
        )
        .await
        .unwrap();
        // terminated by SIGINT
        assert_eq!(exit.code, None);
        assert!(process.has_exited());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_escalates_to_kill() {
        let (process, ready) = InspectorProcess::spawn(shell(
            "trap '' INT; echo '{\"event\":\"ready\"}'; while true; do sleep 1; done",
        ))
        .unwrap();
        process.wait_ready(ready).await.unwrap();

        let exit = tokio::time::timeout(
            Duration::from_secs(10),
            process.shutdown(Duration::from_millis(200)),
        )
        .await
        .unwrap();
        assert_eq!(exit.code, None);
    }
}
