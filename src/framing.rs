//! Secure framing boundary for command and feedback payloads
//!
//! The concrete cipher is an external capability: deployments that enable
//! framing inject an implementation of [`FrameCodec`] through the library
//! API, and the relay wraps every outbound command with `encode` and
//! unwraps every inbound feedback/credential payload with `decode`.
//! Plaintext deployments pass no codec and skip this boundary entirely.
//!
//! A decode failure is never fatal: the router logs it and drops the
//! offending message.

use crate::error::Result;

/// Encode/decode contract around the external cipher
///
/// `decode(encode(x)) == x` must hold for all valid payload strings, and
/// `decode` on a malformed or tampered token must fail with
/// [`crate::Error::Decode`] rather than panic.
pub trait FrameCodec: Send {
    /// Wrap a plaintext payload into an opaque token
    fn encode(&self, plaintext: &str) -> Result<String>;

    /// Unwrap an opaque token back into the plaintext payload
    fn decode(&self, token: &str) -> Result<String>;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::Error;

    /// Toy codec for exercising the boundary: hex-encodes the payload
    /// behind a fixed tag so corruption is detectable. Stands in for the
    /// external cipher in tests only.
    pub(crate) struct HexCodec;

    impl FrameCodec for HexCodec {
        fn encode(&self, plaintext: &str) -> Result<String> {
            let hex: String = plaintext.bytes().map(|b| format!("{:02x}", b)).collect();
            Ok(format!("hx:{}", hex))
        }

        fn decode(&self, token: &str) -> Result<String> {
            let hex = token
                .strip_prefix("hx:")
                .ok_or_else(|| Error::Decode("missing frame tag".to_string()))?;
            if hex.len() % 2 != 0 {
                return Err(Error::Decode("truncated frame".to_string()));
            }
            let mut bytes = Vec::with_capacity(hex.len() / 2);
            for i in (0..hex.len()).step_by(2) {
                let byte = u8::from_str_radix(&hex[i..i + 2], 16)
                    .map_err(|_| Error::Decode("invalid frame byte".to_string()))?;
                bytes.push(byte);
            }
            String::from_utf8(bytes).map_err(|_| Error::Decode("frame is not UTF-8".to_string()))
        }
    }

    /// Codec whose cipher backend always refuses to seal; decode passes
    /// tokens through untouched. Exercises the encode-failure paths.
    pub(crate) struct BrokenEncoder;

    impl FrameCodec for BrokenEncoder {
        fn encode(&self, _plaintext: &str) -> Result<String> {
            Err(Error::Other("cipher backend unavailable".to_string()))
        }

        fn decode(&self, token: &str) -> Result<String> {
            Ok(token.to_string())
        }
    }

    #[test]
    fn round_trip_preserves_payload() {
        let codec = HexCodec;
        for payload in ["42", "-17", "1.5707963267948966", "RESET", ""] {
            let token = codec.encode(payload).unwrap();
            assert_eq!(codec.decode(&token).unwrap(), payload);
        }
    }

    #[test]
    fn corrupted_token_fails_with_decode_error() {
        let codec = HexCodec;
        let mut token = codec.encode("42").unwrap();
        token.push('q');

        match codec.decode(&token) {
            Err(Error::Decode(_)) => {}
            other => panic!("expected decode error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn untagged_token_fails_with_decode_error() {
        let codec = HexCodec;
        assert!(matches!(codec.decode("3432"), Err(Error::Decode(_))));
    }
}
