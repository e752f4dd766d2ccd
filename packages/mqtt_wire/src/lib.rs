//! MQTT 3.1 packet codec for the messaging edge.
//!
//! The edge tunnels MQTT (protocol name `MQIsdp`, level 3) through WebSocket
//! binary frames. Only the packets a subscribing client needs are covered:
//! CONNECT/CONNACK, PUBLISH/PUBACK (qos 0 and 1), SUBSCRIBE/SUBACK, the
//! ping pair and DISCONNECT. Both directions encode and decode, so the same
//! code backs the client and in-process fake servers in tests.

pub mod codec;
pub mod error;
pub mod packet;

pub use codec::{FrameBuffer, MAX_REMAINING_LENGTH};
pub use error::CodecError;
pub use packet::{ConnAck, Connect, ConnectReturnCode, Packet, Publish, QoS, SubAck, Subscribe};
