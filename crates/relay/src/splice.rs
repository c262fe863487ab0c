//! Bidirectional byte splicing between the two legs of a circuit

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

const SPLICE_BUFFER: usize = 16 * 1024;

/// Limits applied while splicing
#[derive(Debug, Clone, Default)]
pub struct SpliceOptions {
    /// End the splice when neither direction moved a byte for this long
    pub idle_timeout: Option<Duration>,
    pub max_duration: Option<Duration>,
    /// Total bytes in both directions
    pub max_bytes: Option<u64>,
    pub cancel: CancellationToken,
}

/// What ended a splice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpliceEnd {
    /// One side reached EOF
    Closed,
    /// Reading or writing one side failed
    Error,
    IdleTimeout,
    DurationLimit,
    DataLimit,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpliceOutcome {
    pub a_to_b: u64,
    pub b_to_a: u64,
    pub end: SpliceEnd,
}

/// Copy bytes between `a` and `b` in both directions until one side closes,
/// errors, or a limit is hit. Both sides are shut down before returning.
pub async fn splice<A, B>(a: A, b: B, options: SpliceOptions) -> SpliceOutcome
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);
    let a_to_b = AtomicU64::new(0);
    let b_to_a = AtomicU64::new(0);
    let total = AtomicU64::new(0);

    let end = {
        let forward_ab = forward(&mut a_read, &mut b_write, &a_to_b, &total, options.max_bytes);
        let forward_ba = forward(&mut b_read, &mut a_write, &b_to_a, &total, options.max_bytes);

        tokio::select! {
            end = forward_ab => end,
            end = forward_ba => end,
            _ = idle_watch(&total, options.idle_timeout) => SpliceEnd::IdleTimeout,
            _ = sleep_or_forever(options.max_duration) => SpliceEnd::DurationLimit,
            _ = options.cancel.cancelled() => SpliceEnd::Cancelled,
        }
    };

    let _ = a_write.shutdown().await;
    let _ = b_write.shutdown().await;

    SpliceOutcome {
        a_to_b: a_to_b.load(Ordering::Relaxed),
        b_to_a: b_to_a.load(Ordering::Relaxed),
        end,
    }
}

async fn forward<R, W>(
    reader: &mut R,
    writer: &mut W,
    counter: &AtomicU64,
    total: &AtomicU64,
    max_bytes: Option<u64>,
) -> SpliceEnd
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; SPLICE_BUFFER];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return SpliceEnd::Closed,
            Ok(n) => n,
            Err(_) => return SpliceEnd::Error,
        };

        let after = total.fetch_add(n as u64, Ordering::Relaxed) + n as u64;
        if max_bytes.is_some_and(|max| after > max) {
            return SpliceEnd::DataLimit;
        }

        if writer.write_all(&buf[..n]).await.is_err() {
            return SpliceEnd::Error;
        }
        if writer.flush().await.is_err() {
            return SpliceEnd::Error;
        }
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Resolves once `total` stops moving for a full `idle` period
async fn idle_watch(total: &AtomicU64, idle: Option<Duration>) {
    let Some(idle) = idle else {
        return std::future::pending().await;
    };
    let mut last = total.load(Ordering::Relaxed);
    loop {
        tokio::time::sleep(idle).await;
        let now = total.load(Ordering::Relaxed);
        if now == last {
            return;
        }
        last = now;
    }
}

async fn sleep_or_forever(limit: Option<Duration>) {
    match limit {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_splice_both_directions_until_close() {
        let (mut client, relay_a) = tokio::io::duplex(1024);
        let (relay_b, mut server) = tokio::io::duplex(1024);
        let handle = tokio::spawn(splice(relay_a, relay_b, SpliceOptions::default()));

        client.write_all(b"request").await.unwrap();
        let mut buf = [0u8; 7];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"request");

        server.write_all(b"response!").await.unwrap();
        let mut buf = [0u8; 9];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"response!");

        drop(client);
        let outcome = handle.await.unwrap();
        assert_eq!(outcome.end, SpliceEnd::Closed);
        assert_eq!(outcome.a_to_b, 7);
        assert_eq!(outcome.b_to_a, 9);

        let mut rest = Vec::new();
        server.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_data_limit() {
        let (mut client, relay_a) = tokio::io::duplex(1024);
        let (relay_b, _server) = tokio::io::duplex(4096);
        let options = SpliceOptions {
            max_bytes: Some(10),
            ..Default::default()
        };
        let handle = tokio::spawn(splice(relay_a, relay_b, options));

        client.write_all(&[7u8; 64]).await.unwrap();
        let outcome = handle.await.unwrap();
        assert_eq!(outcome.end, SpliceEnd::DataLimit);
        assert_eq!(outcome.a_to_b, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout() {
        let (_client, relay_a) = tokio::io::duplex(1024);
        let (relay_b, _server) = tokio::io::duplex(1024);
        let options = SpliceOptions {
            idle_timeout: Some(Duration::from_secs(5)),
            ..Default::default()
        };
        let outcome = splice(relay_a, relay_b, options).await;
        assert_eq!(outcome.end, SpliceEnd::IdleTimeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duration_limit() {
        let (_client, relay_a) = tokio::io::duplex(1024);
        let (relay_b, _server) = tokio::io::duplex(1024);
        let options = SpliceOptions {
            max_duration: Some(Duration::from_secs(30)),
            ..Default::default()
        };
        let started = tokio::time::Instant::now();
        let outcome = splice(relay_a, relay_b, options).await;
        assert_eq!(outcome.end, SpliceEnd::DurationLimit);
        assert!(started.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duration_limit_ends_busy_circuit() {
        let (mut client, relay_a) = tokio::io::duplex(1024);
        let (relay_b, mut server) = tokio::io::duplex(1024);
        let options = SpliceOptions {
            idle_timeout: Some(Duration::from_secs(5)),
            max_duration: Some(Duration::from_secs(30)),
            ..Default::default()
        };
        let started = tokio::time::Instant::now();
        let handle = tokio::spawn(splice(relay_a, relay_b, options));

        // Traffic every 2s keeps the idle timer from firing
        tokio::spawn(async move {
            while client.write_all(b"x").await.is_ok() {
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        });
        tokio::spawn(async move {
            let mut sink = Vec::new();
            let _ = server.read_to_end(&mut sink).await;
        });

        let outcome = handle.await.unwrap();
        assert_eq!(outcome.end, SpliceEnd::DurationLimit);
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert!(outcome.a_to_b >= 10, "only {} bytes forwarded", outcome.a_to_b);
    }

    #[tokio::test]
    async fn test_cancel() {
        let (_client, relay_a) = tokio::io::duplex(1024);
        let (relay_b, _server) = tokio::io::duplex(1024);
        let cancel = CancellationToken::new();
        let options = SpliceOptions {
            cancel: cancel.clone(),
            ..Default::default()
        };
        let handle = tokio::spawn(splice(relay_a, relay_b, options));
        cancel.cancel();
        assert_eq!(handle.await.unwrap().end, SpliceEnd::Cancelled);
    }
}
