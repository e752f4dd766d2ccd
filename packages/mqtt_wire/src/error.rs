/// Errors produced while encoding or decoding MQTT packets.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("remaining length uses more than 4 bytes")]
    MalformedLength,

    #[error("packet too large: {0} bytes (max {max})", max = crate::MAX_REMAINING_LENGTH)]
    PacketTooLarge(usize),

    #[error("unsupported packet type {0}")]
    UnsupportedPacketType(u8),

    #[error("invalid qos level {0}")]
    InvalidQos(u8),

    #[error("packet body ended early while reading {0}")]
    Truncated(&'static str),

    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    #[error("string field too long: {0} bytes")]
    StringTooLong(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(
            CodecError::UnsupportedPacketType(7).to_string(),
            "unsupported packet type 7"
        );
        assert_eq!(
            CodecError::Truncated("topic").to_string(),
            "packet body ended early while reading topic"
        );
        assert!(
            CodecError::PacketTooLarge(300_000_000)
                .to_string()
                .contains("268435455")
        );
    }
}
