//! Moves frames between a byte stream and a [`TaskController`].
//!
//! Frames are length-delimited with a 4-byte big-endian length prefix.

use anyhow::{Context, Result};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use mdlink_protocol::{Frame, InboundMessage, OutboundMessage};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::codec::TaskController;

fn frame_codec(max_frame_length: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(max_frame_length)
        .new_codec()
}

/// Pump frames until the stream ends, fails, or the task side goes away.
///
/// Malformed frames are logged and dropped. The controller is closed before
/// returning, which fails all pending reads of the connection's tasks.
pub async fn run_connection<T>(
    stream: T,
    controller: &TaskController,
    mut outbound: mpsc::Receiver<OutboundMessage>,
    max_frame_length: usize,
) -> Result<()>
where
    T: AsyncRead + AsyncWrite,
{
    let (reader, writer) = tokio::io::split(stream);
    let mut reader = FramedRead::new(reader, frame_codec(max_frame_length));
    let mut writer = FramedWrite::new(writer, frame_codec(max_frame_length));

    let result = loop {
        tokio::select! {
            frame = reader.next() => match frame {
                Some(Ok(bytes)) => {
                    match Frame::decode(&bytes).and_then(|frame| InboundMessage::decode(&frame)) {
                        Ok(message) => controller.push(message),
                        Err(err) => tracing::warn!(error = %err, "dropping malformed frame"),
                    }
                }
                Some(Err(err)) => break Err(err).context("failed to read frame"),
                None => {
                    tracing::info!("connection closed by peer");
                    break Ok(());
                }
            },
            message = outbound.recv() => match message {
                Some(message) => {
                    let frame = Bytes::from(message.encode().encode());
                    if let Err(err) = writer.send(frame).await {
                        break Err(err).context("failed to write frame");
                    }
                }
                None => break Ok(()),
            },
        }
    };
    controller.close();
    result
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use mdlink_crypto::RawKey;
    use mdlink_crypto::device_group::derive_device_group_keys;
    use mdlink_protocol::{DeviceId, ReflectAck};
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::persistent_state::PersistentProtocolState;
    use crate::services::TaskServices;
    use crate::task::TaskScheduler;

    fn controller() -> (TaskController, mpsc::Receiver<OutboundMessage>) {
        let (scheduler, _queue) = TaskScheduler::channel();
        let keys = derive_device_group_keys(RawKey::new([7; 32])).unwrap();
        let services = TaskServices::new(
            "ECHOECHO".parse().unwrap(),
            DeviceId(1),
            keys,
            scheduler,
            PersistentProtocolState::in_memory(),
        );
        TaskController::new(Arc::new(services), 8)
    }

    #[tokio::test]
    async fn inbound_frames_reach_the_backlog() {
        let (controller, outbound) = controller();
        let codec = controller.codec();
        let (client, server) = tokio::io::duplex(1024);

        let mut server = FramedWrite::new(server, frame_codec(1024));
        let ack = InboundMessage::ReflectAck(ReflectAck {
            reflect_id: 3,
            timestamp: 99,
        });
        server.send(Bytes::from(ack.encode().encode())).await.unwrap();
        server.send(Bytes::from_static(&[])).await.unwrap();
        let mut server = server.into_inner();
        server.shutdown().await.unwrap();
        drop(server);

        run_connection(client, &controller, outbound, 1024)
            .await
            .unwrap();
        assert_eq!(codec.backlog_len(), 1);
        assert!(codec.is_closed());
    }

    #[tokio::test]
    async fn outbound_messages_are_framed() {
        let (controller, _unused) = controller();
        let (tx, rx) = mpsc::channel(4);
        tx.send(OutboundMessage::GetDevicesInfo).await.unwrap();
        drop(tx);
        let (client, server) = tokio::io::duplex(1024);

        run_connection(client, &controller, rx, 1024).await.unwrap();

        let mut server = FramedRead::new(server, frame_codec(1024));
        let bytes = server.next().await.unwrap().unwrap();
        let frame = Frame::decode(&bytes).unwrap();
        assert_eq!(
            OutboundMessage::decode(&frame).unwrap(),
            OutboundMessage::GetDevicesInfo
        );
    }
}
