//! Represents a memory backed RESP response.
//!
//! We use an internal buffer here so that we can build the complete response without blocking
//! and then push the whole thing onto the network with a single sys-call. The buffer is
//! pre-allocated with 8 kB and grows if needed, therefore all output operations are
//! infallible.
//!
//! # Example
//!
//! ```
//! # use hivecache::response::Response;
//! let mut response = Response::new();
//! response.ok();
//! assert_eq!(response.complete_string(), "+OK\r\n");
//! ```
use bytes::{BufMut, BytesMut};

/// Represents a separator used when outputting management data.
pub static SEPARATOR: &str =
    "-------------------------------------------------------------------------------\n";

/// Represents a RESP response being built.
///
/// Note that the caller is responsible for emitting a single top-level element (or an
/// [array](Response::array) announcing the proper number of elements), as RESP has no framing
/// beyond counting.
#[derive(Default)]
pub struct Response {
    buffer: BytesMut,
}

impl Response {
    /// Creates a new response backed by an 8 kB buffer.
    pub fn new() -> Self {
        Response {
            buffer: BytesMut::with_capacity(8192),
        }
    }

    /// Emits a simple "+OK".
    pub fn ok(&mut self) {
        self.buffer.put_slice(b"+OK\r\n");
    }

    /// Emits the given string as simple string.
    ///
    /// Line breaks within the message are replaced by blanks, as a simple string must not
    /// contain the protocol terminator.
    pub fn simple(&mut self, message: impl AsRef<str>) {
        self.buffer.put_u8(b'+');
        self.put_line(message.as_ref());
    }

    /// Emits the given message as error.
    pub fn error(&mut self, message: impl AsRef<str>) {
        self.buffer.put_u8(b'-');
        self.put_line(message.as_ref());
    }

    /// Emits the given number.
    pub fn number(&mut self, value: i64) {
        self.buffer.put_slice(format!(":{}\r\n", value).as_bytes());
    }

    /// Emits the given string as bulk string.
    pub fn bulk(&mut self, string: impl AsRef<str>) {
        self.bulk_bytes(string.as_ref().as_bytes());
    }

    /// Emits the given bytes as bulk string.
    ///
    /// Being length-prefixed, a bulk string transports arbitrary binary data.
    pub fn bulk_bytes(&mut self, data: &[u8]) {
        self.buffer
            .put_slice(format!("${}\r\n", data.len()).as_bytes());
        self.buffer.put_slice(data);
        self.buffer.put_slice(b"\r\n");
    }

    /// Announces an array with the given number of elements.
    ///
    /// The elements themselves have to be emitted afterwards using the other output methods.
    pub fn array(&mut self, items: usize) {
        self.buffer.put_slice(format!("*{}\r\n", items).as_bytes());
    }

    /// Completes the response and yields the buffer to be written onto the wire.
    pub fn complete(self) -> BytesMut {
        self.buffer
    }

    /// Completes the response as string.
    ///
    /// This is intended for assertions in test environments.
    pub fn complete_string(self) -> String {
        String::from_utf8_lossy(&self.buffer).to_string()
    }

    fn put_line(&mut self, message: &str) {
        for byte in message.bytes() {
            match byte {
                b'\r' | b'\n' => self.buffer.put_u8(b' '),
                byte => self.buffer.put_u8(byte),
            }
        }
        self.buffer.put_slice(b"\r\n");
    }
}
