//! The blast wire protocol.
//!
//! The initiator opens the connection and sends a 21-byte control prefix:
//! one ASCII direction character (`s`, `r` or `b`, denoting the responder's
//! role) followed by 20 bytes of right-justified, space-padded decimal
//! seconds. After the prefix both sides run pumps according to direction:
//! a sending side writes full buffers until its timer expires and then
//! half-closes, a receiving side reads until the peer half-closes.

use crate::config::BLAST_BUFSIZE;
use crate::protocol::Direction;
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Report;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Length of the ASCII duration field in the control prefix.
const DURATION_FIELD: usize = 20;

/// Byte accounting for one blast, as seen by one side.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Epoch seconds when this side started pumping.
    pub start: i64,
    /// Elapsed seconds.
    pub elapsed: f64,
}

/// Encodes the control prefix for the responder role `direction`.
pub fn encode_prefix(direction: Direction, duration: Duration) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(1 + DURATION_FIELD);
    prefix.push(direction.as_char() as u8);
    prefix.extend_from_slice(
        format!("{:>width$}", duration.as_secs(), width = DURATION_FIELD)
            .as_bytes(),
    );
    prefix
}

/// Reads the control prefix, returning this side's role and the duration.
pub async fn read_prefix<R>(reader: &mut R) -> Result<(Direction, Duration), Report>
where
    R: AsyncRead + Unpin,
{
    let mut direction = [0u8; 1];
    reader
        .read_exact(&mut direction)
        .await
        .wrap_err("reading blast direction")?;
    let direction = Direction::from_char(direction[0] as char)
        .ok_or_else(|| eyre!("invalid blast direction byte {:#x}", direction[0]))?;

    let mut field = [0u8; DURATION_FIELD];
    reader
        .read_exact(&mut field)
        .await
        .wrap_err("reading blast duration")?;
    let seconds = std::str::from_utf8(&field)
        .wrap_err("blast duration is not ascii")?
        .trim()
        .parse::<u64>()
        .wrap_err("blast duration is not a number")?;

    Ok((direction, Duration::from_secs(seconds)))
}

/// Writes `i mod 256` patterned full buffers until `duration` has elapsed,
/// then half-closes the write side. Returns the bytes written.
pub async fn send_pump<W>(writer: &mut W, duration: Duration) -> Result<u64, Report>
where
    W: AsyncWrite + Unpin,
{
    let buffer: Vec<u8> =
        (0..BLAST_BUFSIZE).map(|i| (i % 256) as u8).collect();
    let start = Instant::now();
    let mut sent = 0u64;
    while start.elapsed() < duration {
        writer
            .write_all(&buffer)
            .await
            .wrap_err("blast send pump write")?;
        sent += buffer.len() as u64;
    }
    writer
        .shutdown()
        .await
        .wrap_err("blast send pump shutdown")?;
    Ok(sent)
}

/// Reads until the peer half-closes. Returns the bytes read.
pub async fn recv_pump<R>(reader: &mut R) -> Result<u64, Report>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; BLAST_BUFSIZE];
    let mut received = 0u64;
    loop {
        let n = reader
            .read(&mut buffer)
            .await
            .wrap_err("blast receive pump read")?;
        if n == 0 {
            return Ok(received);
        }
        received += n as u64;
    }
}

/// Runs the initiator side: sends the control prefix (the complement of the
/// assigned direction, which is the responder's role) and then pumps for
/// `duration`.
pub async fn run_initiator<S>(
    stream: S,
    assigned: Direction,
    duration: Duration,
) -> Result<Outcome, Report>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    writer
        .write_all(&encode_prefix(assigned.complement(), duration))
        .await
        .wrap_err("writing blast prefix")?;

    let start = epoch_seconds()?;
    let clock = Instant::now();
    let (bytes_sent, bytes_received) = match assigned {
        Direction::Send => (send_pump(&mut writer, duration).await?, 0),
        Direction::Receive => {
            // nothing more to write; half-close so the peer sees a clean EOF
            writer.shutdown().await.wrap_err("blast prefix shutdown")?;
            (0, recv_pump(&mut reader).await?)
        }
        Direction::Both => {
            let (sent, received) = tokio::join!(
                send_pump(&mut writer, duration),
                recv_pump(&mut reader)
            );
            (sent?, received?)
        }
    };

    Ok(Outcome {
        bytes_sent,
        bytes_received,
        start,
        elapsed: clock.elapsed().as_secs_f64(),
    })
}

/// Runs the responder side: reads the control prefix and pumps according to
/// the role it names. Returns the role together with the byte accounting.
pub async fn respond<S>(stream: S) -> Result<(Direction, Outcome), Report>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (role, duration) = read_prefix(&mut reader).await?;

    let start = epoch_seconds()?;
    let clock = Instant::now();
    let (bytes_sent, bytes_received) = match role {
        Direction::Send => (send_pump(&mut writer, duration).await?, 0),
        Direction::Receive => {
            let received = recv_pump(&mut reader).await?;
            writer.shutdown().await.wrap_err("blast responder close")?;
            (0, received)
        }
        Direction::Both => {
            let (sent, received) = tokio::join!(
                send_pump(&mut writer, duration),
                recv_pump(&mut reader)
            );
            (sent?, received?)
        }
    };

    let outcome = Outcome {
        bytes_sent,
        bytes_received,
        start,
        elapsed: clock.elapsed().as_secs_f64(),
    };
    Ok((role, outcome))
}

fn epoch_seconds() -> Result<i64, Report> {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .wrap_err("system clock is before the epoch")?;
    Ok(since_epoch.as_secs() as i64)
}
