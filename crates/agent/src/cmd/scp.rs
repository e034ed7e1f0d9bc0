use crate::scp::{stdio_channel, ScpSession};

/// Serve one SCP transfer over stdin/stdout, the way sshd runs `scp -t`/`scp -f`
/// for a client. Returns the process exit code.
pub async fn scp(args: Vec<String>) -> i32 {
    let peer = std::env::var("SSH_CLIENT")
        .ok()
        .and_then(|v| v.split_whitespace().next().map(str::to_string))
        .unwrap_or_else(|| "local".to_string());
    let (status, channel) = ScpSession::new(stdio_channel(), peer).run_args(&args).await;
    // the exit status recorded on the channel is what the client would have received
    channel.exit_status().unwrap_or(status.code()) as i32
}
