// pyzy/src/wire/mod.rs
//
// Copyright (c) 2025 Arcella Team
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE>
// or the MIT license <LICENSE-MIT>, at your option.
// This file may not be copied, modified, or distributed
// except according to those terms.

//! Wire codec for the pyzy client protocol.
//!
//! Every integer on the wire is a 4-byte big-endian unsigned value and every
//! string is a length-prefixed byte blob. Standard streams travel from the
//! client to the worker as `SCM_RIGHTS` ancillary data, one descriptor per
//! message, each attached to a single dummy byte.
//!
//! The codec reads straight from the socket without any buffering, so a
//! reader never consumes bytes that belong to the next logical field. That
//! matters because descriptors are attached to specific bytes of the stream.

use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use nix::errno::Errno;
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};

pub mod protocol;

pub use protocol::Request;

/// Upper bound for a single length-prefixed field.
pub const MAX_FIELD_LENGTH: u32 = 4 * 1024 * 1024;

/// Upper bound for the argument count of a request.
pub const MAX_ARGUMENTS: u32 = 64 * 1024;

/// Reads exactly `buf.len()` bytes, retrying on `WouldBlock` and `Interrupted`.
///
/// A zero-length read before the buffer is full means the peer closed the
/// connection and is reported as `UnexpectedEof`.
fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("connection closed after {} of {} bytes", filled, buf.len()),
                ));
            }
            Ok(n) => filled += n,
            Err(e)
                if e.kind() == io::ErrorKind::Interrupted
                    || e.kind() == io::ErrorKind::WouldBlock =>
            {
                continue;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Reads one big-endian `u32`.
pub fn read_u32<R: Read + ?Sized>(reader: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    read_full(reader, &mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

/// Reads a blob of exactly `len` bytes.
pub fn read_blob<R: Read + ?Sized>(reader: &mut R, len: u32) -> io::Result<Vec<u8>> {
    if len > MAX_FIELD_LENGTH {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("field length {} exceeds limit of {} bytes", len, MAX_FIELD_LENGTH),
        ));
    }
    let mut buf = vec![0u8; len as usize];
    read_full(reader, &mut buf)?;
    Ok(buf)
}

/// Reads a length-prefixed UTF-8 string.
pub fn read_string<R: Read + ?Sized>(reader: &mut R) -> io::Result<String> {
    let len = read_u32(reader)?;
    let bytes = read_blob(reader, len)?;
    String::from_utf8(bytes)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("invalid UTF-8: {}", e)))
}

/// Writes one big-endian `u32`.
pub fn write_u32<W: Write + ?Sized>(writer: &mut W, value: u32) -> io::Result<()> {
    writer.write_all(&value.to_be_bytes())
}

/// Writes raw bytes with no length prefix.
pub fn write_bytes<W: Write + ?Sized>(writer: &mut W, bytes: &[u8]) -> io::Result<()> {
    writer.write_all(bytes)
}

/// Writes a length-prefixed blob.
pub fn write_string<W: Write + ?Sized>(writer: &mut W, bytes: &[u8]) -> io::Result<()> {
    let len = u32::try_from(bytes.len())
        .ok()
        .filter(|len| *len <= MAX_FIELD_LENGTH)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("field of {} bytes exceeds limit", bytes.len()),
            )
        })?;
    write_u32(writer, len)?;
    write_bytes(writer, bytes)
}

/// Sends one open descriptor over `stream` as `SCM_RIGHTS` ancillary data.
pub fn send_descriptor(stream: &UnixStream, fd: RawFd) -> io::Result<()> {
    let marker = [0u8; 1];
    let iov = [IoSlice::new(&marker)];
    let fds = [fd];
    let cmsgs = [ControlMessage::ScmRights(&fds)];
    loop {
        match sendmsg::<()>(stream.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "descriptor marker byte was not sent",
                ));
            }
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
            Err(e) => return Err(io::Error::from(e)),
        }
    }
}

/// Receives one descriptor sent with [`send_descriptor`].
///
/// Consumes exactly the one marker byte the descriptor is attached to.
pub fn receive_descriptor(stream: &UnixStream) -> io::Result<OwnedFd> {
    let mut marker = [0u8; 1];
    let mut control = nix::cmsg_space!(RawFd);

    let (bytes, truncated, received) = loop {
        let mut iov = [IoSliceMut::new(&mut marker)];
        match recvmsg::<()>(
            stream.as_raw_fd(),
            &mut iov,
            Some(&mut control),
            MsgFlags::empty(),
        ) {
            Ok(msg) => {
                let truncated = msg.flags.contains(MsgFlags::MSG_CTRUNC);
                let mut received = Vec::new();
                if !truncated {
                    for cmsg in msg.cmsgs().map_err(io::Error::from)? {
                        if let ControlMessageOwned::ScmRights(fds) = cmsg {
                            received.extend(fds);
                        }
                    }
                }
                break (msg.bytes, truncated, received);
            }
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
            Err(e) => return Err(io::Error::from(e)),
        }
    };

    let mut owned: Vec<OwnedFd> = received
        .into_iter()
        // SAFETY: SCM_RIGHTS descriptors are freshly installed in this
        // process and owned by nobody else yet.
        .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) })
        .collect();

    if truncated {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "ancillary data truncated",
        ));
    }
    if bytes == 0 && owned.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed while waiting for a descriptor",
        ));
    }
    match owned.len() {
        1 => Ok(owned.remove(0)),
        0 => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "message carried no descriptor",
        )),
        n => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("expected one descriptor, received {}", n),
        )),
    }
}
