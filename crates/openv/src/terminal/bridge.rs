//! Duplex relay between a WebSocket client and a sandbox shell.

use std::fmt::Display;
use std::time::Duration;

use axum::extract::ws::Message;
use futures::{Sink, SinkExt, Stream, StreamExt};
use log::{debug, warn};

use crate::sandbox::ExecChannel;

use super::ActivityRecorder;

/// Default time between activity heartbeats.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(60);

/// Why a bridge ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeExit {
    /// The client sent a close frame, went away, or stopped accepting output.
    ClientClosed,
    /// The shell exited.
    ChannelClosed,
    /// Activity could not be recorded.
    HeartbeatFailed(String),
    Error(String),
}

/// Relay until the first side finishes.
///
/// Three tasks share one lifetime: shell output to client text frames,
/// client frames to shell input, and an activity heartbeat that fires
/// immediately and then every `heartbeat`. Whichever finishes first ends
/// the others; the client sink and the shell input are closed on every
/// path.
pub async fn run_bridge<Tx, Rx, E>(
    mut client_tx: Tx,
    mut client_rx: Rx,
    channel: ExecChannel,
    recorder: &dyn ActivityRecorder,
    heartbeat: Duration,
) -> BridgeExit
where
    Tx: Sink<Message> + Unpin,
    Tx::Error: Display,
    Rx: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let (mut reader, mut writer) = channel.split();

    let exit = if let Err(e) = recorder.record_activity().await {
        warn!("terminal heartbeat failed: {:#}", e);
        BridgeExit::HeartbeatFailed(e.to_string())
    } else {
        let client_tx = &mut client_tx;
        let writer_ref = &mut writer;

        let output = async move {
            let mut decoder = Utf8Decoder::default();
            loop {
                match reader.read().await {
                    Ok(Some(chunk)) => {
                        let text = decoder.decode(&chunk);
                        if text.is_empty() {
                            continue;
                        }
                        if let Err(e) = client_tx.send(Message::Text(text.into())).await {
                            debug!("terminal client stopped accepting output: {}", e);
                            return BridgeExit::ClientClosed;
                        }
                    }
                    Ok(None) => {
                        let rest = decoder.finish();
                        if !rest.is_empty()
                            && let Err(e) = client_tx.send(Message::Text(rest.into())).await
                        {
                            debug!("dropping final terminal output: {}", e);
                        }
                        return BridgeExit::ChannelClosed;
                    }
                    Err(e) => return BridgeExit::Error(e.to_string()),
                }
            }
        };

        let input = async move {
            while let Some(msg) = client_rx.next().await {
                let result = match msg {
                    Ok(Message::Text(text)) => writer_ref.write(text.as_bytes()).await,
                    Ok(Message::Binary(data)) => writer_ref.write(&data).await,
                    Ok(Message::Close(_)) => return BridgeExit::ClientClosed,
                    Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                    Err(e) => {
                        debug!("terminal client read error: {}", e);
                        return BridgeExit::ClientClosed;
                    }
                };
                if let Err(e) = result {
                    return BridgeExit::Error(e.to_string());
                }
            }
            BridgeExit::ClientClosed
        };

        let pulse = async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + heartbeat, heartbeat);
            loop {
                ticker.tick().await;
                if let Err(e) = recorder.record_activity().await {
                    warn!("terminal heartbeat failed: {:#}", e);
                    return BridgeExit::HeartbeatFailed(e.to_string());
                }
            }
        };

        tokio::select! {
            exit = output => exit,
            exit = input => exit,
            exit = pulse => exit,
        }
    };

    if let Err(e) = writer.close().await {
        debug!("closing terminal input: {}", e);
    }
    if let Err(e) = client_tx.close().await {
        debug!("closing terminal client: {}", e);
    }

    exit
}

/// Lossy UTF-8 decoding that keeps a character split across chunks intact.
#[derive(Debug, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);

        // An incomplete sequence at the very end is held back for the next
        // chunk; anything else invalid is replaced.
        let keep_from = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => incomplete_tail_start(&self.pending),
        };

        let tail = self.pending.split_off(keep_from);
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending = tail;
        text
    }

    fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

/// Start of a trailing incomplete UTF-8 sequence, or the buffer length.
fn incomplete_tail_start(buf: &[u8]) -> usize {
    let start = buf.len().saturating_sub(3);
    for i in (start..buf.len()).rev() {
        let byte = buf[i];
        if byte & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let width = match byte {
            b if b & 0b1110_0000 == 0b1100_0000 => 2,
            b if b & 0b1111_0000 == 0b1110_0000 => 3,
            b if b & 0b1111_1000 == 0b1111_0000 => 4,
            _ => return buf.len(),
        };
        return if buf.len() - i < width { i } else { buf.len() };
    }
    buf.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{ContainerRuntimeApi, SandboxResult};
    use crate::sandbox::testing::FakeRuntime;
    use async_trait::async_trait;
    use futures::channel::mpsc;
    use std::convert::Infallible;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingRecorder {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ActivityRecorder for CountingRecorder {
        async fn record_activity(&self) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("database is locked");
            }
            Ok(())
        }
    }

    type ClientIn = mpsc::UnboundedSender<Result<Message, Infallible>>;
    type ClientOut = mpsc::UnboundedReceiver<Message>;

    fn spawn_bridge(
        channel: ExecChannel,
        recorder: Arc<CountingRecorder>,
        heartbeat: Duration,
    ) -> (ClientIn, ClientOut, tokio::task::JoinHandle<BridgeExit>) {
        let (in_tx, in_rx) = mpsc::unbounded::<Result<Message, Infallible>>();
        let (out_tx, out_rx) = mpsc::unbounded::<Message>();
        let task = tokio::spawn(async move {
            run_bridge(out_tx, in_rx, channel, recorder.as_ref(), heartbeat).await
        });
        (in_tx, out_rx, task)
    }

    async fn echo_channel(runtime: &FakeRuntime) -> ExecChannel {
        runtime.insert_container("c1", "openv_demo_00000001", None);
        runtime
            .exec_interactive("c1", &["/bin/sh".to_string()])
            .await
            .unwrap()
    }

    async fn read_until(out: &mut ClientOut, needle: &str) -> String {
        let mut seen = String::new();
        while !seen.contains(needle) {
            match tokio::time::timeout(Duration::from_secs(5), out.next()).await {
                Ok(Some(Message::Text(text))) => seen.push_str(text.as_str()),
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => break,
            }
        }
        seen
    }

    #[tokio::test]
    async fn test_round_trip_and_disconnect_closes_channel() {
        let runtime = FakeRuntime::default();
        let channel = echo_channel(&runtime).await;
        let recorder = Arc::new(CountingRecorder::default());
        let (in_tx, mut out_rx, task) =
            spawn_bridge(channel, recorder.clone(), DEFAULT_HEARTBEAT);

        in_tx
            .unbounded_send(Ok(Message::Text("echo hi\n".into())))
            .unwrap();
        assert!(read_until(&mut out_rx, "echo hi").await.contains("echo hi"));

        drop(in_tx);
        assert_eq!(task.await.unwrap(), BridgeExit::ClientClosed);

        for _ in 0..50 {
            if runtime.channels_closed() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(runtime.channels_closed(), 1);
        assert!(recorder.calls.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_binary_frames_are_raw_input() {
        let runtime = FakeRuntime::default();
        let channel = echo_channel(&runtime).await;
        let (in_tx, mut out_rx, task) = spawn_bridge(
            channel,
            Arc::new(CountingRecorder::default()),
            DEFAULT_HEARTBEAT,
        );

        in_tx
            .unbounded_send(Ok(Message::Binary(bytes::Bytes::from_static(b"ls -la\n"))))
            .unwrap();
        assert!(read_until(&mut out_rx, "ls -la").await.contains("ls -la"));

        in_tx.unbounded_send(Ok(Message::Close(None))).unwrap();
        assert_eq!(task.await.unwrap(), BridgeExit::ClientClosed);
    }

    #[tokio::test]
    async fn test_shell_exit_closes_client() {
        let channel = ExecChannel::new(
            futures::stream::empty::<SandboxResult<bytes::Bytes>>(),
            tokio::io::sink(),
        );
        let recorder = Arc::new(CountingRecorder::default());
        let (_in_tx, mut out_rx, task) =
            spawn_bridge(channel, recorder.clone(), DEFAULT_HEARTBEAT);

        assert_eq!(task.await.unwrap(), BridgeExit::ChannelClosed);
        // Even a session that ends at once counts as activity.
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 1);
        // Sink was closed: the client stream ends.
        assert!(out_rx.next().await.is_none());
    }

    #[tokio::test]
    async fn test_heartbeat_failure_ends_bridge() {
        let channel = ExecChannel::new(
            futures::stream::pending::<SandboxResult<bytes::Bytes>>(),
            tokio::io::sink(),
        );
        let recorder = Arc::new(CountingRecorder {
            fail: true,
            ..Default::default()
        });
        let (_in_tx, mut out_rx, task) =
            spawn_bridge(channel, recorder.clone(), DEFAULT_HEARTBEAT);

        match task.await.unwrap() {
            BridgeExit::HeartbeatFailed(msg) => assert!(msg.contains("locked")),
            other => panic!("unexpected exit: {:?}", other),
        }
        // The initial write failed, so nothing was relayed.
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 1);
        assert!(out_rx.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_fires_immediately_then_periodically() {
        let channel = ExecChannel::new(
            futures::stream::pending::<SandboxResult<bytes::Bytes>>(),
            tokio::io::sink(),
        );
        let recorder = Arc::new(CountingRecorder::default());
        let (in_tx, _out_rx, task) =
            spawn_bridge(channel, recorder.clone(), Duration::from_secs(60));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(125)).await;
        assert!(recorder.calls.load(Ordering::SeqCst) >= 3);

        drop(in_tx);
        assert_eq!(task.await.unwrap(), BridgeExit::ClientClosed);
    }

    #[test]
    fn test_decoder_keeps_split_characters() {
        let mut decoder = Utf8Decoder::default();
        let snowman = "\u{2603}".as_bytes();

        assert_eq!(decoder.decode(&[b'a', snowman[0]]), "a");
        assert_eq!(decoder.decode(&snowman[1..]), "\u{2603}");
        assert_eq!(decoder.decode(b"ok \xff done"), "ok \u{FFFD} done");
        assert_eq!(decoder.decode(&[b'x', 0xff, snowman[0], snowman[1]]), "x\u{FFFD}");
        assert_eq!(decoder.finish(), "\u{FFFD}");
    }
}
