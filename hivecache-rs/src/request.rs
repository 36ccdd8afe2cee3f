//! Provides a parser and wrapper for incoming RESP requests.
//!
//! A RESP request is an array of bulk strings: `*` followed by the number of entries, then for
//! each entry a `$` followed by its byte length, a CRLF, the raw bytes and another CRLF. A
//! simple request therefore looks like:
//! * "PING" => `*1\r\n$4\r\nPING\r\n`
//! * "CACHE.GET scores Tom" => `*3\r\n$9\r\nCACHE.GET\r\n$6\r\nscores\r\n$3\r\nTom\r\n`
//!
//! As requests arrive via the network, the buffer may contain a partial request at any time.
//! [Request::parse](Request::parse) therefore distinguishes three outcomes: a malformed buffer
//! (an **Err**, the connection should be closed), a partial request (**Ok(None)**, keep
//! reading) and a complete request. Parsing never copies any payload data, it only records
//! byte ranges into the buffer.
//!
//! # Examples
//!
//! Parsing a simple request:
//! ```
//! # use bytes::BytesMut;
//! # use hivecache::request::Request;
//! let buffer = BytesMut::from("*3\r\n$9\r\nCACHE.GET\r\n$6\r\nscores\r\n$3\r\nTom\r\n");
//! let request = Request::parse(&buffer).unwrap().unwrap();
//!
//! assert_eq!(request.command(), "CACHE.GET");
//! assert_eq!(request.parameter_count(), 2);
//! assert_eq!(request.str_parameter(0).unwrap(), "scores");
//! assert_eq!(request.str_parameter(1).unwrap(), "Tom");
//! ```
//!
//! Parsing a partial request:
//! ```
//! # use bytes::BytesMut;
//! # use hivecache::request::Request;
//! let buffer = BytesMut::from("*2\r\n$4\r\nPING\r\n$7\r\nTES");
//! assert_eq!(Request::parse(&buffer).unwrap().is_none(), true);
//! ```
use anyhow::anyhow;
use bytes::{Bytes, BytesMut};

/// Marks the location of a single request part within the underlying buffer.
#[derive(Copy, Clone, Debug)]
struct Range {
    start: usize,
    end: usize,
}

/// Walks over a byte buffer while keeping track of the current read position.
///
/// All scanning methods share the same result convention as the parser itself:
/// **Ok(None)** signals that the buffer ended before the expected element was complete.
struct Scanner<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> Scanner<'a> {
    fn new(buffer: &'a [u8]) -> Self {
        Scanner {
            buffer,
            position: 0,
        }
    }

    /// Consumes the expected marker byte (like `*` or `$`) at the current position.
    fn marker(&mut self, expected: u8) -> anyhow::Result<Option<()>> {
        match self.buffer.get(self.position) {
            None => Ok(None),
            Some(byte) if *byte == expected => {
                self.position += 1;
                Ok(Some(()))
            }
            Some(byte) => Err(anyhow!(
                "Expected '{}' at position {} but found '{}'!",
                expected as char,
                self.position,
                *byte as char
            )),
        }
    }

    /// Consumes a decimal integer terminated by CRLF.
    fn number(&mut self) -> anyhow::Result<Option<usize>> {
        let mut value: usize = 0;
        let mut index = self.position;

        while let Some(byte) = self.buffer.get(index) {
            match *byte {
                b'0'..=b'9' => {
                    value = value * 10 + (*byte - b'0') as usize;
                    index += 1;
                }
                b'\r' => {
                    if index == self.position {
                        return Err(anyhow!("Malformed integer at position {}!", self.position));
                    }
                    return match self.buffer.get(index + 1) {
                        None => Ok(None),
                        Some(b'\n') => {
                            self.position = index + 2;
                            Ok(Some(value))
                        }
                        Some(_) => Err(anyhow!("Expected CRLF after the integer at {}!", index)),
                    };
                }
                _ => return Err(anyhow!("Malformed integer at position {}!", index)),
            }
        }

        Ok(None)
    }

    /// Consumes a complete bulk string (`$<len>\r\n<data>\r\n`) and yields the data range.
    fn bulk_string(&mut self) -> anyhow::Result<Option<Range>> {
        if self.marker(b'$')?.is_none() {
            return Ok(None);
        }
        let length = match self.number()? {
            Some(length) => length,
            None => return Ok(None),
        };

        let start = self.position;
        let end = start + length;
        if self.buffer.len() < end + 2 {
            return Ok(None);
        }
        if &self.buffer[end..end + 2] != b"\r\n" {
            return Err(anyhow!("Missing CRLF after the bulk string at {}!", start));
        }

        self.position = end + 2;
        Ok(Some(Range { start, end }))
    }
}

/// Represents a parsed RESP request.
///
/// Note that we treat the first entry as "command" and re-number all other entries
/// accordingly. Therefore "CACHE.GET scores Tom" has "CACHE.GET" as command, "scores" as
/// first parameter (index 0) and "Tom" as second (index 1).
pub struct Request {
    len: usize,
    data: Bytes,
    parts: Vec<Range>,
}

impl Request {
    /// Tries to parse a RESP request from the given byte buffer.
    ///
    /// If malformed data is detected, we return an **Err**. Otherwise we either return an
    /// empty optional, in case only a partial request is present, or the parsed request as
    /// `Ok(Some(Request))`.
    pub fn parse(data: &BytesMut) -> anyhow::Result<Option<Request>> {
        // Abort as early as possible if the buffer cannot hold a complete request yet...
        if data.len() < 4 || data[data.len() - 2] != b'\r' {
            return Ok(None);
        }

        let mut scanner = Scanner::new(data);
        if scanner.marker(b'*')?.is_none() {
            return Ok(None);
        }
        let count = match scanner.number()? {
            Some(count) => count,
            None => return Ok(None),
        };
        if count == 0 {
            return Err(anyhow!("An empty request array was received!"));
        }

        let mut parts = Vec::with_capacity(count);
        for _ in 0..count {
            match scanner.bulk_string()? {
                Some(range) => parts.push(range),
                None => return Ok(None),
            }
        }

        Ok(Some(Request {
            len: scanner.position,
            data: data.clone().freeze(),
            parts,
        }))
    }

    /// Provides a helper function to create an example request in test environments.
    ///
    /// # Example
    /// ```
    /// # use hivecache::request::Request;
    /// let request = Request::example(vec!["PING"]);
    /// assert_eq!(request.command(), "PING");
    /// ```
    pub fn example(data: Vec<&str>) -> Request {
        let mut input = String::new();
        input.push_str(&format!("*{}\r\n", data.len()));
        for part in data {
            input.push_str(&format!("${}\r\n{}\r\n", part.len(), part));
        }

        Request::parse(&BytesMut::from(input.as_str()))
            .unwrap()
            .unwrap()
    }

    fn part(&self, index: usize) -> Option<&[u8]> {
        self.parts
            .get(index)
            .map(|range| &self.data[range.start..range.end])
    }

    /// Returns the command of the request (its first entry).
    ///
    /// A command which isn't valid UTF-8 is reported as an empty string, which no dispatcher
    /// will know and therefore yields an unknown-command error downstream.
    pub fn command(&self) -> &str {
        self.part(0)
            .and_then(|data| std::str::from_utf8(data).ok())
            .unwrap_or("")
    }

    /// Returns the number of parameters (entries after the command).
    pub fn parameter_count(&self) -> usize {
        self.parts.len() - 1
    }

    /// Returns the n-th parameter as string.
    pub fn str_parameter(&self, index: usize) -> anyhow::Result<&str> {
        let data = self
            .part(index + 1)
            .ok_or_else(|| anyhow!("Missing parameter {}!", index))?;
        std::str::from_utf8(data).map_err(|_| anyhow!("Parameter {} is not valid UTF-8!", index))
    }

    /// Returns the total length in bytes of the parsed request within its buffer.
    ///
    /// This is used to drop the consumed bytes from the connection buffer once the request
    /// has been handled.
    pub fn len(&self) -> usize {
        self.len
    }
}
