use bytes::{BufMut, Bytes, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;

#[cfg(test)] use mockall::automock;

/// The wire-protocol capability that turns a TCP byte stream into discrete
///  packages. An implementation is handed to the server / client before any
///  I/O happens and is frozen into each connection on creation.
///
/// The framing loop peeks up to [Protocol::max_header_size] bytes off the
///  head of the receive buffer and asks [Protocol::check_package_length] for
///  the total package length. Packages are extracted only once fully
///  buffered, so implementations never see partial packages in
///  [Protocol::parse_package].
#[cfg_attr(test, automock)]
pub trait Protocol: Send + Sync + 'static {
    /// The worst-case header length; bounds the peek window during framing.
    fn max_header_size(&self) -> usize;

    /// The header bytes to prepend to a payload of `payload_len` bytes.
    fn build_package_header(&self, payload_len: usize) -> Bytes;

    /// Given a view of up to `max_header_size` bytes from the head of the
    ///  stream, the total package length (header plus payload).
    ///
    /// Return 0 if the view is too short to decide ("need more data"), and a
    ///  negative value for a malformed header ("protocol error", which closes
    ///  the connection). A 0 returned for a full `max_header_size` window is
    ///  treated as a protocol error as well since no amount of additional
    ///  data could make progress.
    fn check_package_length(&self, header: &[u8]) -> i64;

    /// Map a complete package to the bytes delivered to user code. The
    ///  default hands the package through unchanged; protocols that frame
    ///  with a transport-only header typically strip it here. `None` is a
    ///  protocol error and closes the connection.
    fn parse_package(&self, package: Bytes) -> Option<Bytes> {
        Some(package)
    }
}

/// The bundled default framing: a 4-byte big-endian payload length followed
///  by the payload. The length header is stripped before delivery, so user
///  code sends and receives bare payloads.
pub struct LengthPrefixProtocol {
    max_payload_size: usize,
}

impl LengthPrefixProtocol {
    const HEADER_SIZE: usize = 4;

    pub fn new() -> LengthPrefixProtocol {
        LengthPrefixProtocol {
            max_payload_size: 16 * 1024 * 1024,
        }
    }

    /// A package whose length header exceeds this is treated as a protocol
    ///  violation - the peer is apparently not speaking this protocol, and
    ///  buffering an arbitrarily huge package would be an easy DoS.
    pub fn with_max_payload_size(max_payload_size: usize) -> LengthPrefixProtocol {
        LengthPrefixProtocol { max_payload_size }
    }
}

impl Default for LengthPrefixProtocol {
    fn default() -> Self {
        LengthPrefixProtocol::new()
    }
}

impl Protocol for LengthPrefixProtocol {
    fn max_header_size(&self) -> usize {
        Self::HEADER_SIZE
    }

    fn build_package_header(&self, payload_len: usize) -> Bytes {
        assert!(
            payload_len <= u32::MAX as usize,
            "payload of {} bytes exceeds the 4-byte length header", payload_len,
        );

        let mut buf = BytesMut::with_capacity(Self::HEADER_SIZE);
        buf.put_u32(payload_len as u32);
        buf.freeze()
    }

    fn check_package_length(&self, header: &[u8]) -> i64 {
        let mut header = header;
        match header.try_get_u32() {
            Ok(payload_len) => {
                if payload_len as usize > self.max_payload_size {
                    return -1;
                }
                Self::HEADER_SIZE as i64 + payload_len as i64
            }
            Err(_) => 0, // need more data
        }
    }

    fn parse_package(&self, package: Bytes) -> Option<Bytes> {
        Some(package.slice(Self::HEADER_SIZE..))
    }
}
