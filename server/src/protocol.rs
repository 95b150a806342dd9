//! Wire codec: fixed-width ASCII metadata fields followed by raw payload
//! bytes.
//!
//! Every variable-length field (pathname, buffer, count) is preceded by a
//! 10-byte zero-padded decimal length. Request/response codes are single
//! ASCII digit bytes. `read_request`/write_response helpers are the only
//! place that touches socket I/O directly; `storage` and `worker` never see
//! raw bytes.

use std::io::{self, Read, Write};
use std::path::PathBuf;

use bitflags::bitflags;

use crate::error::{Error, ErrorKind};
use crate::io_util::{read_full, write_full};

/// Width, in bytes, of a length/count metadata field.
pub const METADATA_LEN: usize = 10;
/// Width of the end-of-stream sentinel (a metadata field that reads as 0).
pub const SENTINEL: [u8; METADATA_LEN] = *b"0000000000";

bitflags! {
    /// Flags accepted by `openFile`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u8 {
        const CREATE = 0b01;
        const LOCK   = 0b10;
    }
}

/// Request codes, as sent by the client in the first byte of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestCode {
    Open = 1,
    Read = 2,
    ReadN = 3,
    Write = 4,
    Append = 5,
    Lock = 6,
    Unlock = 7,
    Close = 8,
    Remove = 9,
}

impl RequestCode {
    fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            b'1' => Self::Open,
            b'2' => Self::Read,
            b'3' => Self::ReadN,
            b'4' => Self::Write,
            b'5' => Self::Append,
            b'6' => Self::Lock,
            b'7' => Self::Unlock,
            b'8' => Self::Close,
            b'9' => Self::Remove,
            _ => return None,
        })
    }
}

/// Response codes, as sent by the server in the first byte of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseCode {
    Init = 0,
    Ok = 1,
    FileNotFound = 2,
    AlreadyExists = 3,
    NoContent = 4,
    Forbidden = 5,
    OutOfMemory = 6,
    InternalServerError = 7,
    BadRequest = 8,
    InvalidResponse = 9,
}

impl ResponseCode {
    fn as_byte(self) -> u8 {
        b'0' + self as u8
    }
}

impl From<ErrorKind> for ResponseCode {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::NotFound => ResponseCode::FileNotFound,
            ErrorKind::AlreadyExists => ResponseCode::AlreadyExists,
            ErrorKind::NoContent => ResponseCode::NoContent,
            ErrorKind::Forbidden => ResponseCode::Forbidden,
            ErrorKind::CapacityExceeded => ResponseCode::OutOfMemory,
            ErrorKind::Malformed => ResponseCode::BadRequest,
            ErrorKind::Internal => ResponseCode::InternalServerError,
        }
    }
}

impl From<Error> for ResponseCode {
    fn from(err: Error) -> Self {
        err.kind().into()
    }
}

/// A fully decoded request, with payloads already read off the wire.
#[derive(Debug, Clone)]
pub enum Request {
    Open { path: PathBuf, flags: OpenFlags },
    Read { path: PathBuf },
    ReadN { up_to: i64 },
    Write { path: PathBuf, data: Vec<u8> },
    Append { path: PathBuf, data: Vec<u8> },
    Lock { path: PathBuf },
    Unlock { path: PathBuf },
    Close { path: PathBuf },
    Remove { path: PathBuf },
}

fn read_len<R: Read>(r: &mut R) -> io::Result<Option<u64>> {
    let mut buf = [0u8; METADATA_LEN];
    if !read_full(r, &mut buf)? {
        return Ok(None);
    }
    let s = std::str::from_utf8(&buf)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "non-utf8 length field"))?;
    let n: u64 = s
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "non-decimal length field"))?;
    Ok(Some(n))
}

/// Reads a signed 10-byte metadata field, the same width as [`read_len`]
/// but allowing a leading `-` (e.g. `"-000000001"`) since `readNFiles`
/// sends its count as a signed `%010d`, and a negative count means "all".
fn read_signed_len<R: Read>(r: &mut R) -> io::Result<Option<i64>> {
    let mut buf = [0u8; METADATA_LEN];
    if !read_full(r, &mut buf)? {
        return Ok(None);
    }
    let s = std::str::from_utf8(&buf)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "non-utf8 length field"))?;
    let n: i64 = s
        .trim()
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "non-decimal length field"))?;
    Ok(Some(n))
}

fn write_len<W: Write>(w: &mut W, value: u64) -> io::Result<()> {
    let field = format!("{:0width$}", value, width = METADATA_LEN);
    write_full(w, field.as_bytes())
}

fn read_path<R: Read>(r: &mut R) -> Result<PathBuf, Error> {
    let len = read_len(r)
        .map_err(|_| Error::new(ErrorKind::Malformed))?
        .ok_or(Error::new(ErrorKind::Malformed))?;
    if len == 0 || len > 4096 {
        return Err(Error::with_detail(ErrorKind::Malformed, "invalid pathname length"));
    }
    let mut buf = vec![0u8; len as usize];
    if !read_full(r, &mut buf).map_err(|_| Error::new(ErrorKind::Malformed))? {
        return Err(Error::with_detail(ErrorKind::Malformed, "truncated pathname"));
    }
    Ok(PathBuf::from(
        String::from_utf8(buf).map_err(|_| Error::with_detail(ErrorKind::Malformed, "non-utf8 pathname"))?,
    ))
}

fn read_payload<R: Read>(r: &mut R) -> Result<Vec<u8>, Error> {
    let len = read_len(r)
        .map_err(|_| Error::new(ErrorKind::Malformed))?
        .ok_or(Error::new(ErrorKind::Malformed))?;
    let mut buf = vec![0u8; len as usize];
    if !read_full(r, &mut buf).map_err(|_| Error::new(ErrorKind::Malformed))? {
        return Err(Error::with_detail(ErrorKind::Malformed, "truncated payload"));
    }
    Ok(buf)
}

/// Reads the one-byte request code and returns `None` on clean EOF (the
/// peer disconnected between requests).
pub fn read_request_code<R: Read>(r: &mut R) -> io::Result<Option<RequestCode>> {
    let mut code = [0u8; 1];
    if !read_full(r, &mut code)? {
        return Ok(None);
    }
    Ok(RequestCode::from_byte(code[0]))
}

/// Reads the trailing fields of a request given its already-consumed code.
pub fn read_request_body<R: Read>(r: &mut R, code: RequestCode) -> Result<Request, Error> {
    Ok(match code {
        RequestCode::Open => {
            let path = read_path(r)?;
            let mut flag_byte = [0u8; 1];
            if !read_full(r, &mut flag_byte).map_err(|_| Error::new(ErrorKind::Malformed))? {
                return Err(Error::with_detail(ErrorKind::Malformed, "truncated open flags"));
            }
            let raw = flag_byte[0].wrapping_sub(b'0');
            let flags = OpenFlags::from_bits(raw)
                .ok_or_else(|| Error::with_detail(ErrorKind::Malformed, "invalid open flags"))?;
            Request::Open { path, flags }
        }
        RequestCode::Read => Request::Read { path: read_path(r)? },
        RequestCode::ReadN => {
            let n = read_signed_len(r)
                .map_err(|_| Error::new(ErrorKind::Malformed))?
                .ok_or(Error::new(ErrorKind::Malformed))?;
            Request::ReadN { up_to: n }
        }
        RequestCode::Write => {
            let path = read_path(r)?;
            let data = read_payload(r)?;
            Request::Write { path, data }
        }
        RequestCode::Append => {
            let path = read_path(r)?;
            let data = read_payload(r)?;
            Request::Append { path, data }
        }
        RequestCode::Lock => Request::Lock { path: read_path(r)? },
        RequestCode::Unlock => Request::Unlock { path: read_path(r)? },
        RequestCode::Close => Request::Close { path: read_path(r)? },
        RequestCode::Remove => Request::Remove { path: read_path(r)? },
    })
}

/// Writes a bare response code with no trailing fields.
pub fn write_bare<W: Write>(w: &mut W, code: ResponseCode) -> io::Result<()> {
    write_full(w, &[code.as_byte()])
}

/// Writes the OK response to `readFile`: `size(10) bytes`.
pub fn write_read_ok<W: Write>(w: &mut W, data: &[u8]) -> io::Result<()> {
    write_full(w, &[ResponseCode::Ok.as_byte()])?;
    write_len(w, data.len() as u64)?;
    write_full(w, data)
}

/// Writes one `len(10) path size(10) bytes` block of a file stream.
fn write_file_block<W: Write>(w: &mut W, path: &std::path::Path, data: &[u8]) -> io::Result<()> {
    let path_bytes = path.to_string_lossy();
    write_len(w, path_bytes.len() as u64)?;
    write_full(w, path_bytes.as_bytes())?;
    write_len(w, data.len() as u64)?;
    write_full(w, data)
}

/// Writes the OK response to `readNFiles`: a sequence of file blocks
/// terminated by the sentinel.
pub fn write_read_many_ok<W: Write>(w: &mut W, files: &[(PathBuf, Vec<u8>)]) -> io::Result<()> {
    write_full(w, &[ResponseCode::Ok.as_byte()])?;
    for (path, data) in files {
        write_file_block(w, path, data)?;
    }
    write_full(w, &SENTINEL)
}

/// Writes the OK response to `writeFile`/`appendToFile`: the response code
/// followed by the evicted-file stream, terminated by the sentinel.
pub fn write_append_ok<W: Write>(w: &mut W, evicted: &[(PathBuf, Vec<u8>)]) -> io::Result<()> {
    write_full(w, &[ResponseCode::Ok.as_byte()])?;
    for (path, data) in evicted {
        write_file_block(w, path, data)?;
    }
    write_full(w, &SENTINEL)
}

/// Writes an error response (single code byte, no trailing fields).
pub fn write_error<W: Write>(w: &mut W, err: &Error) -> io::Result<()> {
    write_bare(w, err.kind().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn round_trips_open_request() {
        let mut buf = Vec::new();
        write_len(&mut buf, 5).unwrap();
        buf.extend_from_slice(b"/file");
        buf.push(b'0' + 0b11);
        let mut cursor = Cursor::new(buf);
        let req = read_request_body(&mut cursor, RequestCode::Open).unwrap();
        match req {
            Request::Open { path, flags } => {
                assert_eq!(path, PathBuf::from("/file"));
                assert_eq!(flags, OpenFlags::CREATE | OpenFlags::LOCK);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn rejects_invalid_open_flags() {
        let mut buf = Vec::new();
        write_len(&mut buf, 1).unwrap();
        buf.extend_from_slice(b"x");
        buf.push(b'9'); // out of range
        let mut cursor = Cursor::new(buf);
        let err = read_request_body(&mut cursor, RequestCode::Open).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Malformed);
    }

    #[test]
    fn write_read_many_ok_terminates_with_sentinel() {
        let mut out = Vec::new();
        write_read_many_ok(&mut out, &[(PathBuf::from("/a"), b"hi".to_vec())]).unwrap();
        assert!(out.ends_with(&SENTINEL));
        assert_eq!(out[0], ResponseCode::Ok.as_byte());
    }

    #[test]
    fn read_n_files_accepts_negative_count() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"-000000001");
        let mut cursor = Cursor::new(buf);
        let req = read_request_body(&mut cursor, RequestCode::ReadN).unwrap();
        match req {
            Request::ReadN { up_to } => assert_eq!(up_to, -1),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn read_n_files_accepts_zero_and_positive_counts() {
        let mut buf = Vec::new();
        write_len(&mut buf, 0).unwrap();
        let mut cursor = Cursor::new(buf);
        let req = read_request_body(&mut cursor, RequestCode::ReadN).unwrap();
        match req {
            Request::ReadN { up_to } => assert_eq!(up_to, 0),
            _ => panic!("wrong variant"),
        }

        let mut buf = Vec::new();
        write_len(&mut buf, 7).unwrap();
        let mut cursor = Cursor::new(buf);
        let req = read_request_body(&mut cursor, RequestCode::ReadN).unwrap();
        match req {
            Request::ReadN { up_to } => assert_eq!(up_to, 7),
            _ => panic!("wrong variant"),
        }
    }
}
