use std::{
    fmt,
    io::Error as IoError,
    process::{Output, Stdio},
    sync::OnceLock,
    time::Duration,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command as TokioCommand;
use tokio::sync::Mutex;

use crate::error::{GraphloadError, Result};

#[derive(Debug)]
pub enum CommandError {
    Io(IoError),
    Timeout,
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::Io(e) => write!(f, "Failed to run client: {}", e),
            CommandError::Timeout => write!(f, "Client exceeded its timeout"),
        }
    }
}

impl std::error::Error for CommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CommandError::Io(e) => Some(e),
            CommandError::Timeout => None,
        }
    }
}

/// Parses a humantime duration such as `"5m"` or `"1h30m"`.
///
/// `"0"` and the empty string mean "no limit".
pub fn parse_duration(value: Option<&str>) -> Result<Option<Duration>> {
    let Some(value) = value else {
        return Ok(None);
    };

    if value == "0" || value.is_empty() {
        return Ok(None);
    }

    value
        .parse::<humantime::Duration>()
        .map(|duration| Some(duration.into()))
        .map_err(|e| {
            GraphloadError::Config(format!(
                "Invalid duration '{}': {} (use a format like '5m', '30s', '1h30m')",
                value, e
            ))
        })
}

pub async fn run_command_with_timeout(
    program: &str,
    args: &[String],
    timeout: Option<Duration>,
    stream_output: bool,
) -> std::result::Result<Output, CommandError> {
    let mut cmd = TokioCommand::new(program);
    cmd.args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(Stdio::null())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(CommandError::Io)?;

    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();

    let stdout_handle = tokio::spawn(async move {
        match stdout_pipe {
            Some(pipe) => collect_pipe(pipe, tokio::io::stdout(), stream_output).await,
            None => Ok(Vec::new()),
        }
    });

    let stderr_handle = tokio::spawn(async move {
        match stderr_pipe {
            Some(pipe) => collect_pipe(pipe, tokio::io::stderr(), stream_output).await,
            None => Ok(Vec::new()),
        }
    });

    let status = match timeout {
        Some(duration) => {
            tokio::select! {
                result = child.wait() => result.map_err(CommandError::Io)?,
                _ = tokio::time::sleep(duration) => {
                    if let Err(kill_err) = child.kill().await {
                        tracing::warn!("Failed to kill timed-out process: {}", kill_err);
                    }
                    let _ = child.wait().await;
                    return Err(CommandError::Timeout);
                }
            }
        }
        None => child.wait().await.map_err(CommandError::Io)?,
    };

    let stdout = match stdout_handle.await {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(e)) => return Err(e),
        Err(e) => return Err(CommandError::Io(IoError::other(e))),
    };

    let stderr = match stderr_handle.await {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(e)) => return Err(e),
        Err(e) => return Err(CommandError::Io(IoError::other(e))),
    };

    Ok(Output {
        status,
        stdout,
        stderr,
    })
}

async fn collect_pipe<R, W>(
    mut pipe: R,
    mut sink: W,
    stream_output: bool,
) -> std::result::Result<Vec<u8>, CommandError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut collected: Vec<u8> = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = pipe.read(&mut buf).await.map_err(CommandError::Io)?;
        if n == 0 {
            break;
        }
        collected.extend_from_slice(&buf[..n]);
        if stream_output {
            sink.write_all(&buf[..n]).await.map_err(CommandError::Io)?;
        }
    }
    if stream_output {
        sink.flush().await.map_err(CommandError::Io)?;
    }
    Ok(collected)
}

static OUTPUT_PRINT_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

/// Serializes grouped output blocks so parallel tasks do not interleave.
pub fn output_print_lock() -> &'static Mutex<()> {
    OUTPUT_PRINT_LOCK.get_or_init(|| Mutex::new(()))
}
