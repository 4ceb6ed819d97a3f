use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use protocol::Command;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::config::Config;
use crate::supervise;

pub(crate) async fn serve(listener: TcpListener, config: Arc<Config>) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::warn!(error = %err, "could not accept controller connection");
                continue;
            }
        };
        tracing::debug!(peer = %addr, "controller connected");
        let config = Arc::clone(&config);
        tokio::spawn(async move {
            match handle_connection(stream, addr, config).await {
                Ok(()) => tracing::debug!(peer = %addr, "controller disconnected"),
                Err(err) => {
                    tracing::warn!(peer = %addr, error = %err, "controller connection dropped");
                }
            }
        });
    }
}

/// One controller connection: inbound frames carry commands, outbound
/// frames replay the response queue in order. Each command gets its
/// own supervisor worker; all workers of this connection share the
/// bounded queue drained by the pump below.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    config: Arc<Config>,
) -> anyhow::Result<()> {
    let framed = Framed::new(stream, LengthDelimitedCodec::new());
    let (mut frame_sink, mut frame_stream) = framed.split();
    let (queue_tx, mut queue_rx) = mpsc::channel::<Bytes>(config.queue_capacity);

    let pump = tokio::spawn(async move {
        while let Some(blob) = queue_rx.recv().await {
            if frame_sink.send(blob).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = frame_stream.next().await {
        let bytes = frame.context("frame read")?;
        let command: Command = match serde_json::from_slice(&bytes) {
            Ok(command) => command,
            Err(err) => {
                tracing::warn!(peer = %addr, error = %err, "invalid command payload");
                continue;
            }
        };

        tracing::info!(
            event = "command_received",
            uuid = %command.uuid,
            task_uuid = %command.task_uuid,
            source = %command.source,
            peer = %addr,
            program = %command.program,
        );

        let ctx = supervise::Context {
            sink: Arc::new(queue_tx.clone()),
            clock: Arc::new(supervise::SystemClock),
            log_dir: config.log_dir.clone(),
            log_level: config.log_level,
        };
        if let Err(err) = supervise::spawn_worker(ctx, command) {
            tracing::error!(peer = %addr, error = %err, "failed to start worker");
        }
    }

    // drop our queue handle so the pump drains and exits once the last
    // worker finishes
    drop(queue_tx);
    pump.await.context("response pump join")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{Response, StreamMode};
    use uuid::Uuid;

    fn test_command(uuid: &str, program: &str) -> Command {
        Command {
            uuid: uuid.to_string(),
            task_uuid: Uuid::new_v4().to_string(),
            request_sequence_number: 1,
            source: "dispatch-test".to_string(),
            program: program.to_string(),
            arguments: Vec::new(),
            environment: Vec::new(),
            working_directory: "/tmp".to_string(),
            run_as: nix::unistd::User::from_uid(nix::unistd::Uid::current())
                .expect("user database readable")
                .expect("current user exists")
                .name,
            standard_output: StreamMode::Return,
            standard_error: StreamMode::Return,
            standard_output_path: String::new(),
            standard_err_path: String::new(),
            timeout: 0,
        }
    }

    #[tokio::test]
    async fn command_over_tcp_streams_responses_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Arc::new(Config {
            log_dir: dir.path().to_path_buf(),
            log_level: 7,
            queue_capacity: 16,
        });
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(serve(listener, config));

        let stream = TcpStream::connect(addr).await.expect("connect");
        let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
        let command = test_command("tcp-cmd-1", "echo over tcp");
        let payload = serde_json::to_vec(&command).expect("encode command");
        framed.send(Bytes::from(payload)).await.expect("send frame");

        let mut responses = Vec::new();
        while let Some(frame) = framed.next().await {
            let bytes = frame.expect("frame");
            let response: Response = serde_json::from_slice(&bytes).expect("decode response");
            let terminal = matches!(response, Response::Exit { .. } | Response::Timeout { .. });
            responses.push(response);
            if terminal {
                break;
            }
        }

        assert!(responses.len() >= 2);
        match &responses[0] {
            Response::Progress { header, stdout, .. } => {
                assert_eq!(header.uuid, "tcp-cmd-1");
                assert_eq!(stdout, "over tcp\n");
            }
            other => panic!("expected progress, got {other:?}"),
        }
        match responses.last().expect("terminal") {
            Response::Exit { exit_code, .. } => assert_eq!(*exit_code, 0),
            other => panic!("expected exit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_frames_are_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Arc::new(Config {
            log_dir: dir.path().to_path_buf(),
            log_level: 7,
            queue_capacity: 16,
        });
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(serve(listener, config));

        let stream = TcpStream::connect(addr).await.expect("connect");
        let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
        framed
            .send(Bytes::from_static(b"not json at all"))
            .await
            .expect("send garbage");

        let command = test_command("tcp-cmd-2", "echo still works");
        let payload = serde_json::to_vec(&command).expect("encode command");
        framed.send(Bytes::from(payload)).await.expect("send frame");

        let frame = framed.next().await.expect("a frame").expect("frame bytes");
        let response: Response = serde_json::from_slice(&frame).expect("decode response");
        assert_eq!(response.header().uuid, "tcp-cmd-2");
    }
}
