//! Integration tests for CabinetCodec over Tokio streams.
//!
//! The host side sends requests and the device side answers with replies
//! shaped like real firmware output, including noise and split writes.

mod common;

use futures::{SinkExt, StreamExt};
use medcab_core::{DeviceKind, SlotId};
use medcab_protocol::{CabinetCodec, CommandCode, Packet, ParsedResponse, ResponseParser};
use tokio::io::AsyncWriteExt;
use tokio_util::codec::FramedRead;

#[tokio::test]
async fn test_request_reply_exchange() {
    let (mut host, mut device) = common::framed_pair(1024);

    host.send(Packet::status_request(0)).await.unwrap();
    let request = device.next().await.unwrap().unwrap();
    assert_eq!(request.command_code().unwrap(), CommandCode::Status);
    assert_eq!(request.ask, 0x00);

    device.send(common::status_reply(&[1, 3])).await.unwrap();
    let reply = host.next().await.unwrap().unwrap();

    let parser = ResponseParser::new(DeviceKind::Ds12);
    let slots = parser.parse(&reply).unwrap().into_slot_states().unwrap();
    let open: Vec<u8> = slots
        .iter()
        .filter(|s| s.is_open)
        .map(|s| s.slot_number)
        .collect();
    assert_eq!(open, vec![1, 3]);
}

#[tokio::test]
async fn test_unlock_request_carries_index() {
    let (mut host, mut device) = common::framed_pair(1024);

    let slot = SlotId::new(12, DeviceKind::Ds12).unwrap();
    host.send(Packet::unlock_request(0, slot)).await.unwrap();

    let request = device.next().await.unwrap().unwrap();
    assert_eq!(request.command, 0x81);
    assert_eq!(request.data, vec![11]);

    device.send(common::unlock_ack()).await.unwrap();
    let reply = host.next().await.unwrap().unwrap();
    assert_eq!(
        ResponseParser::new(DeviceKind::Ds12).parse(&reply).unwrap(),
        ParsedResponse::UnlockAck
    );
}

#[tokio::test]
async fn test_multiple_frames_in_sequence() {
    let (mut host, mut device) = common::framed_pair(4096);

    for slot in 1..=5u8 {
        device.send(common::status_reply(&[slot])).await.unwrap();
    }
    device.send(common::version_reply("DS12-V1.2")).await.unwrap();

    for slot in 1..=5u8 {
        let reply = host.next().await.unwrap().unwrap();
        let mask = u16::from_le_bytes([reply.data[0], reply.data[1]]);
        assert_eq!(mask, 1 << (slot - 1));
    }
    let version = host.next().await.unwrap().unwrap();
    assert_eq!(version.data, b"DS12-V1.2");
}

#[tokio::test]
async fn test_frame_split_across_writes() {
    let (mut writer, reader) = tokio::io::duplex(64);
    let mut framed = FramedRead::new(reader, CabinetCodec::new());

    let bytes = common::status_reply(&[2]).to_bytes();
    let task = tokio::spawn(async move {
        for chunk in bytes.chunks(3) {
            writer.write_all(chunk).await.unwrap();
            writer.flush().await.unwrap();
            tokio::task::yield_now().await;
        }
        writer
    });

    let reply = framed.next().await.unwrap().unwrap();
    assert_eq!(reply.data, vec![0b0000_0010, 0x00]);
    drop(task.await.unwrap());
}

#[tokio::test]
async fn test_line_noise_before_frame() {
    let (mut writer, reader) = tokio::io::duplex(64);
    let mut framed = FramedRead::new(reader, CabinetCodec::new());

    writer.write_all(&[0x00, 0xFF, 0x02, 0x13]).await.unwrap();
    writer
        .write_all(&common::version_reply("V2").to_bytes())
        .await
        .unwrap();

    let reply = framed.next().await.unwrap().unwrap();
    assert_eq!(reply.command, 0x8F);
    assert_eq!(reply.data, b"V2");
    assert!(framed.decoder().discarded() >= 3);
}

#[tokio::test]
async fn test_corrupted_checksum_surfaces_error() {
    let (mut writer, reader) = tokio::io::duplex(64);
    let mut framed = FramedRead::new(reader, CabinetCodec::new());

    let mut bytes = common::status_reply(&[1]).to_bytes().to_vec();
    bytes[7] ^= 0x10;
    writer.write_all(&bytes).await.unwrap();

    let result = framed.next().await.unwrap();
    assert!(matches!(
        result,
        Err(medcab_core::Error::ChecksumMismatch { .. })
    ));
}

#[tokio::test]
async fn test_stream_ends_cleanly() {
    let (writer, reader) = tokio::io::duplex(64);
    let mut framed = FramedRead::new(reader, CabinetCodec::new());
    drop(writer);
    assert!(framed.next().await.is_none());
}
