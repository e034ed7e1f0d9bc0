//! Single-file SCP sink/source running over an already-authenticated channel.
//!
//! Only the non-recursive subset of the OpenSSH SCP sub-protocol is spoken:
//! `C<mode> <size> <name>\n` control lines (optionally preceded by a `T` line),
//! single `0x00` acknowledgements and `0x01 <message>\n` errors.

pub mod channel;
pub mod status;

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

pub use channel::{stdio_channel, ScpChannel};
pub use status::{ScpError, ScpStatus};

pub const SCP_ACK: u8 = 0x00;
const SCP_WARNING: u8 = 0x01;
const SCP_FATAL: u8 = 0x02;
/// Largest read from the channel when receiving.
pub const RECV_CHUNK: usize = 64 * 1024;
/// Largest write to the channel when sending; some clients choke on bigger writes.
pub const SEND_CHUNK: usize = 16 * 1024;
pub const CHANNEL_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_LINE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// `-f`: the server sends a file to the client.
    Send,
    /// `-t`: the server receives a file from the client.
    Receive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScpCommand {
    pub direction: Direction,
    pub target: PathBuf,
}

impl ScpCommand {
    /// Parse the command line the client asked the server to run, e.g. `scp -t /tmp/out.txt`.
    #[cfg(test)]
    pub fn parse(command: &str) -> Result<Self, ScpError> {
        let tokens: Vec<String> = command.split_whitespace().map(str::to_string).collect();
        Self::from_args(&tokens)
    }

    pub fn from_args(tokens: &[String]) -> Result<Self, ScpError> {
        let mut tokens = tokens.iter().peekable();
        if tokens.peek().is_some_and(|t| !t.starts_with('-')) {
            // program name
            tokens.next();
        }

        let mut direction = None;
        let mut recursive = false;
        let mut rest = Vec::new();
        let mut flags_done = false;
        for token in tokens {
            if flags_done || !token.starts_with('-') || token == "-" {
                flags_done = true;
                rest.push(token.as_str());
                continue;
            }
            if token == "--" {
                flags_done = true;
                continue;
            }
            for flag in token.chars().skip(1) {
                match flag {
                    't' | 'f' => {
                        let dir = if flag == 't' { Direction::Receive } else { Direction::Send };
                        if direction.is_some_and(|d| d != dir) {
                            return Err(ScpError::bad_message("both -t and -f given"));
                        }
                        direction = Some(dir);
                    }
                    'r' => recursive = true,
                    // -d (target is a directory), -p (preserve times), -v, -q and
                    // anything else do not change single-file behaviour.
                    _ => {}
                }
            }
        }

        if recursive {
            return Err(ScpError::unsupported("recursive transfer"));
        }
        let direction = direction.ok_or_else(|| ScpError::bad_message("expected -t or -f"))?;
        if rest.is_empty() {
            return Err(ScpError::bad_message("missing target path"));
        }
        Ok(Self {
            direction,
            target: PathBuf::from(rest.join(" ")),
        })
    }
}

/// Parsed `C<mode> <size> <name>` line.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FileHeader {
    mode: u32,
    size: u64,
    name: String,
}

fn parse_file_header(line: &str) -> Result<FileHeader, ScpError> {
    let body = line
        .strip_prefix('C')
        .ok_or_else(|| ScpError::bad_message(format!("unexpected control line {line:?}")))?;
    let mut parts = body.splitn(3, ' ');
    let (Some(mode), Some(size), Some(name)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(ScpError::bad_message(format!("malformed control line {line:?}")));
    };
    let mode = u32::from_str_radix(mode, 8)
        .map_err(|_| ScpError::bad_message(format!("invalid file mode {mode:?}")))?;
    let size = size
        .parse::<u64>()
        .map_err(|_| ScpError::failure(format!("invalid file size {size:?}")))?;
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\\') {
        return Err(ScpError::bad_message(format!("invalid file name {name:?}")));
    }
    Ok(FileHeader {
        mode: mode & 0o7777,
        size,
        name: name.to_string(),
    })
}

/// One transfer on one channel. Always ends with the channel closed and, if the
/// channel was still writable, an exit status sent.
pub struct ScpSession<C: ScpChannel> {
    channel: C,
    peer: String,
    buffer: Vec<u8>,
    timeout: Duration,
    finished: bool,
}

impl<C: ScpChannel> ScpSession<C> {
    pub fn new(channel: C, peer: impl Into<String>) -> Self {
        Self {
            channel,
            peer: peer.into(),
            buffer: Vec::new(),
            timeout: CHANNEL_TIMEOUT,
            finished: false,
        }
    }

    #[cfg(test)]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[cfg(test)]
    pub async fn run(self, command: &str) -> (ScpStatus, C) {
        self.run_parsed(ScpCommand::parse(command)).await
    }

    /// Run the transfer for a command that arrives already split into arguments, as
    /// it does when sshd executes the agent binary in place of `scp`. Returns the
    /// exit status that was sent, along with the channel.
    pub async fn run_args(self, args: &[String]) -> (ScpStatus, C) {
        self.run_parsed(ScpCommand::from_args(args)).await
    }

    async fn run_parsed(mut self, command: Result<ScpCommand, ScpError>) -> (ScpStatus, C) {
        let result = match command {
            Ok(cmd) => {
                info!(peer = %self.peer, direction = ?cmd.direction, target = %cmd.target.display(), "scp session");
                match cmd.direction {
                    Direction::Send => self.send(&cmd.target).await,
                    Direction::Receive => self.receive(&cmd.target).await,
                }
            }
            Err(e) => Err(e),
        };

        let status = match result {
            Ok(()) => ScpStatus::Ok,
            Err(e) => {
                warn!(peer = %self.peer, status = ?e.status, error = %e, "scp transfer failed");
                self.report_error(&e).await;
                e.status
            }
        };
        self.finish(status).await;
        (status, self.channel)
    }

    async fn report_error(&mut self, err: &ScpError) {
        if !self.channel.is_open() {
            return;
        }
        let mut msg = vec![SCP_WARNING];
        msg.extend_from_slice(format!("scp: {}\n", err.message).as_bytes());
        if let Err(e) = self.write(&msg).await {
            debug!(peer = %self.peer, error = %e, "could not deliver scp error message");
        }
    }

    async fn finish(&mut self, status: ScpStatus) {
        if self.finished {
            return;
        }
        self.finished = true;
        if self.channel.is_open() {
            if let Err(e) = self.channel.send_exit_status(status.code()).await {
                debug!(peer = %self.peer, error = %e, "exit status not delivered");
            }
            if let Err(e) = self.channel.close().await {
                debug!(peer = %self.peer, error = %e, "channel close failed");
            }
        }
    }

    async fn send(&mut self, path: &Path) -> Result<(), ScpError> {
        let meta = tokio::fs::metadata(path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ScpError::no_such_file(path),
            _ => ScpError::io_at(path, e),
        })?;
        if !meta.is_file() {
            return Err(ScpError::failure(format!("{}: not a regular file", path.display())));
        }
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| ScpError::io_at(path, e))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| ScpError::failure(format!("{}: no file name", path.display())))?;
        let size = meta.len();

        // The sink announces it is ready before anything is sent.
        self.read_ack().await?;
        self.write(format!("C{:04o} {} {}\n", file_mode(&meta), size, name).as_bytes())
            .await?;
        self.read_ack().await?;

        let mut buf = vec![0u8; SEND_CHUNK];
        let mut sent = 0u64;
        while sent < size {
            let want = SEND_CHUNK.min((size - sent) as usize);
            let n = file
                .read(&mut buf[..want])
                .await
                .map_err(|e| ScpError::io_at(path, e))?;
            if n == 0 {
                return Err(ScpError::failure(format!("{}: file truncated while sending", path.display())));
            }
            self.write(&buf[..n]).await?;
            sent += n as u64;
        }
        self.write(&[SCP_ACK]).await?;
        self.read_ack().await?;
        info!(peer = %self.peer, path = %path.display(), bytes = size, "scp send complete");
        Ok(())
    }

    async fn receive(&mut self, target: &Path) -> Result<(), ScpError> {
        let (dir, fixed_dest) = if target.is_dir() {
            (target.to_path_buf(), None)
        } else {
            let parent = match target.parent() {
                Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
                _ => PathBuf::from("."),
            };
            (parent, Some(target.to_path_buf()))
        };
        if !dir.is_dir() {
            return Err(ScpError::no_such_file(&dir));
        }

        self.write(&[SCP_ACK]).await?;
        let header = loop {
            let line = self.read_line().await?;
            match line.as_bytes().first() {
                Some(b'T') => {
                    // modification times (-p); accepted but not applied
                    self.write(&[SCP_ACK]).await?;
                }
                Some(b'C') => break parse_file_header(&line)?,
                Some(b'D') => return Err(ScpError::unsupported("directory transfer")),
                Some(&SCP_WARNING) | Some(&SCP_FATAL) => {
                    return Err(ScpError::failure(format!("peer error: {}", line[1..].trim())));
                }
                _ => return Err(ScpError::bad_message(format!("unexpected control line {line:?}"))),
            }
        };

        let dest = fixed_dest.unwrap_or_else(|| dir.join(&header.name));
        let mut file = tokio::fs::File::create(&dest)
            .await
            .map_err(|e| ScpError::io_at(&dest, e))?;
        self.write(&[SCP_ACK]).await?;

        let mut remaining = header.size;
        while remaining > 0 {
            let chunk = self.read_chunk(RECV_CHUNK.min(remaining as usize)).await?;
            if chunk.is_empty() {
                return Err(ScpError::connection_lost(format!(
                    "connection closed with {remaining} bytes outstanding"
                )));
            }
            file.write_all(&chunk)
                .await
                .map_err(|e| ScpError::io_at(&dest, e))?;
            remaining -= chunk.len() as u64;
        }
        file.flush().await.map_err(|e| ScpError::io_at(&dest, e))?;
        drop(file);
        apply_mode(&dest, header.mode).await;

        // Sender follows the data with its own status byte.
        match self.read_byte().await? {
            None | Some(SCP_ACK) => {}
            Some(SCP_WARNING) | Some(SCP_FATAL) => {
                let msg = self.read_line().await.unwrap_or_default();
                return Err(ScpError::failure(format!("peer error: {}", msg.trim())));
            }
            Some(other) => {
                return Err(ScpError::bad_message(format!("unexpected status byte {other:#04x}")))
            }
        }
        self.write(&[SCP_ACK]).await?;
        info!(peer = %self.peer, path = %dest.display(), bytes = header.size, "scp receive complete");
        Ok(())
    }

    async fn read_ack(&mut self) -> Result<(), ScpError> {
        match self.read_byte().await? {
            Some(SCP_ACK) => Ok(()),
            Some(SCP_WARNING) | Some(SCP_FATAL) => {
                let msg = self.read_line().await.unwrap_or_default();
                Err(ScpError::failure(format!("peer error: {}", msg.trim())))
            }
            Some(other) => Err(ScpError::bad_message(format!("expected ack, got {other:#04x}"))),
            None => Err(ScpError::connection_lost("connection closed while waiting for ack")),
        }
    }

    /// Next byte, or `None` at end of stream.
    async fn read_byte(&mut self) -> Result<Option<u8>, ScpError> {
        let chunk = self.read_chunk(1).await?;
        Ok(chunk.first().copied())
    }

    /// Up to `max` bytes, served from leftover buffered data before the channel.
    async fn read_chunk(&mut self, max: usize) -> Result<Vec<u8>, ScpError> {
        if !self.buffer.is_empty() {
            let n = max.min(self.buffer.len());
            return Ok(self.buffer.drain(..n).collect());
        }
        let mut buf = vec![0u8; max];
        let n = self.channel_read(&mut buf).await?;
        buf.truncate(n);
        Ok(buf)
    }

    async fn read_line(&mut self) -> Result<String, ScpError> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.buffer.drain(..=pos).collect();
                return Ok(String::from_utf8_lossy(&line[..line.len() - 1]).to_string());
            }
            if self.buffer.len() > MAX_LINE {
                return Err(ScpError::bad_message("control line too long"));
            }
            let mut buf = vec![0u8; RECV_CHUNK];
            let n = self.channel_read(&mut buf).await?;
            if n == 0 {
                return Err(ScpError::connection_lost("connection closed mid-line"));
            }
            self.buffer.extend_from_slice(&buf[..n]);
        }
    }

    async fn channel_read(&mut self, buf: &mut [u8]) -> Result<usize, ScpError> {
        match tokio::time::timeout(self.timeout, self.channel.read(buf)).await {
            Ok(res) => Ok(res?),
            Err(_) => Err(ScpError::connection_lost("timed out reading from channel")),
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), ScpError> {
        match tokio::time::timeout(self.timeout, self.channel.write_all(data)).await {
            Ok(res) => Ok(res?),
            Err(_) => Err(ScpError::connection_lost("timed out writing to channel")),
        }
    }
}

#[cfg(unix)]
fn file_mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(meta: &std::fs::Metadata) -> u32 {
    if meta.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

#[cfg(unix)]
async fn apply_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await {
        debug!(path = %path.display(), error = %e, "could not apply file mode");
    }
}

#[cfg(not(unix))]
async fn apply_mode(_path: &Path, _mode: u32) {}
