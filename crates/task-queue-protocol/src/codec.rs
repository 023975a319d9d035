use crate::{Message, MessageType, ProtocolError, Result, MAX_MESSAGE_SIZE};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Codec for encoding/decoding messages with length-prefixed framing
///
/// Frame format: [4-byte length (big-endian)] [1-byte message type] [payload]
pub struct MessageCodec;

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < 4 {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length == 0 {
            return Err(ProtocolError::Protocol("empty frame".to_string()));
        }
        if length > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(length));
        }

        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        src.advance(4);
        let type_byte = src.get_u8();
        let msg_type =
            MessageType::from_u8(type_byte).ok_or(ProtocolError::InvalidMessageType(type_byte))?;

        // Length counts the type byte
        let payload = src.split_to(length - 1);

        // Deserialize based on message type
        let message = match msg_type {
            MessageType::Enqueue => Message::Enqueue(bincode::deserialize(&payload)?),
            MessageType::Dequeue => Message::Dequeue(bincode::deserialize(&payload)?),
            MessageType::Ack => Message::Ack(bincode::deserialize(&payload)?),
            MessageType::ListTasks => Message::ListTasks(bincode::deserialize(&payload)?),
            MessageType::Heartbeat => Message::Heartbeat(bincode::deserialize(&payload)?),
            MessageType::EnqueueResponse => {
                Message::EnqueueResponse(bincode::deserialize(&payload)?)
            }
            MessageType::DequeueResponse => {
                Message::DequeueResponse(bincode::deserialize(&payload)?)
            }
            MessageType::AckResponse => Message::AckResponse(bincode::deserialize(&payload)?),
            MessageType::ListTasksResponse => {
                Message::ListTasksResponse(bincode::deserialize(&payload)?)
            }
            MessageType::HeartbeatResponse => {
                Message::HeartbeatResponse(bincode::deserialize(&payload)?)
            }
            MessageType::Status => Message::Status(bincode::deserialize(&payload)?),
        };

        Ok(Some(message))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        // Serialize the payload
        let payload = match &item {
            Message::Enqueue(req) => bincode::serialize(req)?,
            Message::Dequeue(req) => bincode::serialize(req)?,
            Message::Ack(req) => bincode::serialize(req)?,
            Message::ListTasks(req) => bincode::serialize(req)?,
            Message::Heartbeat(req) => bincode::serialize(req)?,
            Message::EnqueueResponse(resp) => bincode::serialize(resp)?,
            Message::DequeueResponse(resp) => bincode::serialize(resp)?,
            Message::AckResponse(resp) => bincode::serialize(resp)?,
            Message::ListTasksResponse(resp) => bincode::serialize(resp)?,
            Message::HeartbeatResponse(resp) => bincode::serialize(resp)?,
            Message::Status(status) => bincode::serialize(status)?,
        };

        let total_length = 1 + payload.len();
        if total_length > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(total_length));
        }

        dst.reserve(4 + total_length);
        dst.put_u32(total_length as u32);
        dst.put_u8(item.message_type().as_u8());
        dst.put_slice(&payload);

        Ok(())
    }
}
