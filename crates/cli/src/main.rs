// SPDX-License-Identifier: MIT

//! `tlctl`: requests a rate limit from `traffic-limitd`, then execs the
//! target command in place (spec.md §6 "CLI").

mod rate;

use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio_seqpacket::UnixSeqpacket;

use traffic_limitd_core::FailReason;
use traffic_limitd_wire::{decode, encode, Message, ReqAttr, FLAG_NOWAIT, RATE_UNLIMITED};

const DEFAULT_CONTROL_SOCKET: &str = "/run/traffic-limitd.sock";
const MAX_FRAME: usize = 4096;

#[derive(Debug, Parser)]
#[command(name = "tlctl")]
struct Args {
    /// Limit packet rate to RATE[K|M|G|T] packets/sec (default: no limit).
    #[arg(short = 'p')]
    packet_rate: Option<String>,

    /// Limit bit rate to RATE[K|M|G|T] bits/sec (default: no limit).
    #[arg(short = 'b')]
    bit_rate: Option<String>,

    /// Wait for available resource for at most TIME[m|h|d] (default: wait forever). `-w 0` fails immediately if unavailable.
    #[arg(short = 'w')]
    wait: Option<String>,

    /// Control socket path (default: /run/traffic-limitd.sock).
    #[arg(short = 'c')]
    control_socket: Option<PathBuf>,

    /// Command to exec once the daemon replies PROCEED.
    #[arg(last = true, required = true)]
    cmd: Vec<String>,
}

fn main() {
    let args = Args::parse();
    match run(args) {
        Ok(()) => unreachable!("run() only returns on error; success execs this process away"),
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let byte_rate = match &args.bit_rate {
        Some(s) => rate::parse_rate(s)? / 8,
        None => 0,
    };
    let packet_rate = match &args.packet_rate {
        Some(s) => rate::parse_rate(s)?,
        None => 0,
    };
    let wait_secs = args.wait.as_deref().map(rate::parse_wait_seconds).transpose()?;

    let socket_path = args
        .control_socket
        .or_else(|| std::env::var_os("TRAFFIC_LIMITD_SOCKET_PATH").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONTROL_SOCKET));

    let req = ReqAttr {
        byte_rate: if byte_rate == 0 { RATE_UNLIMITED } else { byte_rate },
        packet_rate: if packet_rate == 0 { RATE_UNLIMITED } else { packet_rate },
        flags: if wait_secs == Some(0) { FLAG_NOWAIT } else { 0 },
    };

    let rt = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    rt.block_on(negotiate(&socket_path, req, wait_secs))?;

    let mut cmd = std::process::Command::new(&args.cmd[0]);
    cmd.args(&args.cmd[1..]);
    Err(anyhow::anyhow!("unable to execute command: {}", cmd.exec()))
}

/// Connects, sends the `REQ`, and processes `LOG`/`FAIL`/`PROCEED` frames
/// until the daemon either proceeds or rejects the request. `wait_secs`
/// bounds the whole exchange when `Some(n)` with `n > 0`; `None` or `Some(0)`
/// wait indefinitely (an immediate `FAIL(NoResource)` is still possible with
/// `-w 0` since `FLAG_NOWAIT` is set in that case).
async fn negotiate(socket_path: &std::path::Path, req: ReqAttr, wait_secs: Option<u64>) -> anyhow::Result<()> {
    let socket = UnixSeqpacket::connect(socket_path)
        .await
        .map_err(|e| anyhow::anyhow!("unable to connect to control socket: {e}"))?;

    socket
        .send(&encode(&Message::Req(req)))
        .await
        .map_err(|e| anyhow::anyhow!("unable to send request: {e}"))?;

    let body = recv_until_terminal(&socket);
    match wait_secs {
        Some(secs) if secs > 0 => {
            tokio::time::timeout(Duration::from_secs(secs), body)
                .await
                .map_err(|_| anyhow::anyhow!("unable to start task: waited too long for available resource"))?
        }
        _ => body.await,
    }
}

async fn recv_until_terminal(socket: &UnixSeqpacket) -> anyhow::Result<()> {
    loop {
        let mut buf = [0u8; MAX_FRAME];
        let n = socket
            .recv(&mut buf)
            .await
            .map_err(|e| anyhow::anyhow!("unable to receive response: {e}"))?;
        if n == 0 {
            anyhow::bail!("unexpected connection closed");
        }
        let msg = decode(&buf[..n]).map_err(|e| anyhow::anyhow!("invalid response received from daemon: {e}"))?;
        match msg {
            Message::Log(text) => eprintln!("{}", String::from_utf8_lossy(&text)),
            Message::Fail { reason } => anyhow::bail!("unable to start task: {}", describe_fail(reason)),
            Message::Proceed => return Ok(()),
            Message::Req(_) => anyhow::bail!("invalid response received from daemon"),
        }
    }
}

fn describe_fail(reason: FailReason) -> &'static str {
    match reason {
        FailReason::Unknown => "reason unknown",
        FailReason::WillWait => "no enough resource",
        FailReason::Internal => "internal error",
        FailReason::NoResource => "too many rate limited tasks",
        FailReason::YourError => "malformed request",
    }
}
