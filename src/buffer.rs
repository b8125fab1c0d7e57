use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::RawFd;

use crate::macros::syscall;

/// Number of bytes reserved at the front of a freshly constructed buffer so that short
/// length-prefixes can be prepended without shifting the readable region.
pub const CHEAP_PREPEND: usize = 8;

const INITIAL_SIZE: usize = 1024;

/// Growable byte container with a `prependable | readable | writable` layout.
///
/// Reads accumulate at the back via [`Buffer::append`] or [`Buffer::read_fd`]; consumers drain
/// from the front via [`Buffer::retrieve`] and friends. The buffer never shrinks on its own
/// (see [`Buffer::shrink`] for an explicit compaction request).
#[derive(Debug, Clone)]
pub struct Buffer {
    buf: Vec<u8>,
    read_index: usize,
    write_index: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer::with_size(INITIAL_SIZE)
    }

    pub fn with_size(initial_size: usize) -> Buffer {
        Buffer {
            buf: vec![0u8; CHEAP_PREPEND + initial_size],
            read_index: CHEAP_PREPEND,
            write_index: CHEAP_PREPEND,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.write_index - self.read_index
    }

    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.write_index
    }

    pub fn prependable_bytes(&self) -> usize {
        self.read_index
    }

    pub fn peek(&self) -> &[u8] {
        &self.buf[self.read_index..self.write_index]
    }

    /// Advance the read cursor by `len` bytes, reclaiming all space if the buffer drains.
    pub fn retrieve(&mut self, len: usize) {
        assert!(len <= self.readable_bytes());
        if len < self.readable_bytes() {
            self.read_index += len;
        } else {
            self.retrieve_all();
        }
    }

    pub fn retrieve_until(&mut self, end: usize) {
        assert!(end >= self.read_index && end <= self.write_index);
        self.retrieve(end - self.read_index);
    }

    pub fn retrieve_all(&mut self) {
        self.read_index = CHEAP_PREPEND;
        self.write_index = CHEAP_PREPEND;
    }

    pub fn retrieve_all_as_vec(&mut self) -> Vec<u8> {
        let result = self.peek().to_vec();
        self.retrieve_all();
        result
    }

    pub fn retrieve_as_vec(&mut self, len: usize) -> Vec<u8> {
        assert!(len <= self.readable_bytes());
        let result = self.buf[self.read_index..self.read_index + len].to_vec();
        self.retrieve(len);
        result
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable_bytes(data.len());
        let start = self.write_index;
        self.buf[start..start + data.len()].copy_from_slice(data);
        self.write_index += data.len();
    }

    pub fn ensure_writable_bytes(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
    }

    fn make_space(&mut self, len: usize) {
        // Reclaiming prependable + trailing writable space is cheaper than growing the
        // allocation, but only once it actually covers the request.
        if self.writable_bytes() + self.prependable_bytes() < len + CHEAP_PREPEND {
            self.buf.resize(self.write_index + len, 0);
        } else {
            let readable = self.readable_bytes();
            self.buf
                .copy_within(self.read_index..self.write_index, CHEAP_PREPEND);
            self.read_index = CHEAP_PREPEND;
            self.write_index = CHEAP_PREPEND + readable;
        }
    }

    /// Shrinks the backing allocation to exactly fit the readable region plus `reserve` bytes
    /// of slack, giving back memory a long-lived idle connection no longer needs.
    pub fn shrink(&mut self, reserve: usize) {
        let mut other = Buffer::with_size(self.readable_bytes() + reserve);
        other.append(self.peek());
        *self = other;
    }

    /// Undo the last `len` bytes written (e.g. to erase a provisional length prefix).
    pub fn unwrite(&mut self, len: usize) {
        assert!(len <= self.readable_bytes());
        self.write_index -= len;
    }

    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_bytes());
        self.read_index -= data.len();
        self.buf[self.read_index..self.read_index + data.len()].copy_from_slice(data);
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn find_crlf(&self) -> Option<usize> {
        self.peek()
            .windows(2)
            .position(|w| w == b"\r\n")
            .map(|i| self.read_index + i)
    }

    pub fn find_eol(&self) -> Option<usize> {
        self.peek()
            .iter()
            .position(|&b| b == b'\n')
            .map(|i| self.read_index + i)
    }

    pub fn append_u8(&mut self, v: u8) {
        self.append(&[v]);
    }
    pub fn append_i8(&mut self, v: i8) {
        self.append_u8(v as u8);
    }
    pub fn append_u16(&mut self, v: u16) {
        self.append(&v.to_be_bytes());
    }
    pub fn append_i16(&mut self, v: i16) {
        self.append_u16(v as u16);
    }
    pub fn append_u32(&mut self, v: u32) {
        self.append(&v.to_be_bytes());
    }
    pub fn append_i32(&mut self, v: i32) {
        self.append_u32(v as u32);
    }
    pub fn append_u64(&mut self, v: u64) {
        self.append(&v.to_be_bytes());
    }
    pub fn append_i64(&mut self, v: i64) {
        self.append_u64(v as u64);
    }

    pub fn peek_u8(&self) -> u8 {
        self.peek()[0]
    }
    pub fn peek_u16(&self) -> u16 {
        u16::from_be_bytes(self.peek()[..2].try_into().unwrap())
    }
    pub fn peek_u32(&self) -> u32 {
        u32::from_be_bytes(self.peek()[..4].try_into().unwrap())
    }
    pub fn peek_u64(&self) -> u64 {
        u64::from_be_bytes(self.peek()[..8].try_into().unwrap())
    }

    pub fn read_u8(&mut self) -> u8 {
        let v = self.peek_u8();
        self.retrieve(1);
        v
    }
    pub fn read_i8(&mut self) -> i8 {
        self.read_u8() as i8
    }
    pub fn read_u16(&mut self) -> u16 {
        let v = self.peek_u16();
        self.retrieve(2);
        v
    }
    pub fn read_i16(&mut self) -> i16 {
        self.read_u16() as i16
    }
    pub fn read_u32(&mut self) -> u32 {
        let v = self.peek_u32();
        self.retrieve(4);
        v
    }
    pub fn read_i32(&mut self) -> i32 {
        self.read_u32() as i32
    }
    pub fn read_u64(&mut self) -> u64 {
        let v = self.peek_u64();
        self.retrieve(8);
        v
    }
    pub fn read_i64(&mut self) -> i64 {
        self.read_u64() as i64
    }

    pub fn prepend_u8(&mut self, v: u8) {
        self.prepend(&[v]);
    }
    pub fn prepend_u16(&mut self, v: u16) {
        self.prepend(&v.to_be_bytes());
    }
    pub fn prepend_u32(&mut self, v: u32) {
        self.prepend(&v.to_be_bytes());
    }
    pub fn prepend_u64(&mut self, v: u64) {
        self.prepend(&v.to_be_bytes());
    }

    /// Scatter-reads from `fd` into the writable region, spilling overflow into a stack
    /// buffer so that a single burst larger than our current capacity costs one syscall
    /// instead of a realloc-then-retry loop. Returns `Ok(0)` on peer EOF.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extrabuf = [0u8; 65536];
        let writable = self.writable_bytes();

        let n = {
            let mut iov = [
                IoSliceMut::new(&mut self.buf[self.write_index..]),
                IoSliceMut::new(&mut extrabuf),
            ];
            syscall!(readv(
                fd,
                iov.as_mut_ptr() as *mut libc::iovec,
                iov.len() as i32
            ))? as usize
        };

        if n <= writable {
            self.write_index += n;
        } else {
            self.write_index = self.buf.len();
            self.append(&extrabuf[..n - writable]);
        }
        Ok(n)
    }
}

/// Writes as much of `data` as the kernel will accept right now; `Ok(0)` with no error means
/// `EWOULDBLOCK`/`EAGAIN` was translated to a zero-length write for the caller's convenience.
pub fn write_fd_nonblocking(fd: RawFd, data: &[u8]) -> io::Result<usize> {
    match syscall!(write(
        fd,
        data.as_ptr() as *const libc::c_void,
        data.len()
    )) {
        Ok(n) => Ok(n as usize),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
        Err(e) => Err(e),
    }
}

/// Scatter-writes `slices` into `fd`, used by [`Buffer`] owners composing headers + body.
pub fn writev_fd(fd: RawFd, slices: &[IoSlice<'_>]) -> io::Result<usize> {
    syscall!(writev(
        fd,
        slices.as_ptr() as *const libc::iovec,
        slices.len() as i32
    ))
    .map(|n| n as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_retrieve_roundtrip() {
        let mut buf = Buffer::new();
        buf.append(b"hello world");
        assert_eq!(buf.readable_bytes(), 11);
        assert_eq!(buf.retrieve_all_as_vec(), b"hello world");
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn integers_roundtrip() {
        let mut buf = Buffer::new();
        buf.append_u64(0xdead_beef_cafe_babe);
        buf.append_u32(42);
        buf.append_i16(-7);
        buf.append_u8(9);
        assert_eq!(buf.read_u64(), 0xdead_beef_cafe_babe);
        assert_eq!(buf.read_u32(), 42);
        assert_eq!(buf.read_i16(), -7);
        assert_eq!(buf.read_u8(), 9);
    }

    #[test]
    fn prepend_uses_reserve() {
        let mut buf = Buffer::new();
        buf.append(b"world");
        assert!(buf.prependable_bytes() >= 4);
        buf.prepend_u32(5);
        let mut all = buf.retrieve_all_as_vec();
        assert_eq!(&all[..4], &5u32.to_be_bytes());
        all.drain(..4);
        assert_eq!(all, b"world");
    }

    #[test]
    fn growth_beyond_capacity_compacts_or_resizes() {
        let mut buf = Buffer::with_size(16);
        buf.append(&vec![b'x'; 10]);
        buf.retrieve(10);
        // Front is now all slack; appending something that fits in prependable+writable
        // should compact rather than reallocate.
        let cap_before = buf.capacity();
        buf.append(&vec![b'y'; 10]);
        assert_eq!(buf.capacity(), cap_before);
    }

    #[test]
    fn find_eol_locates_newline() {
        let mut buf = Buffer::new();
        buf.append(b"line one\nline two");
        let offset = buf.find_eol().unwrap() - buf.prependable_bytes();
        assert_eq!(&buf.peek()[..=offset], b"line one\n");
    }

    #[test]
    fn unwrite_undoes_tail() {
        let mut buf = Buffer::new();
        buf.append(b"abc");
        buf.append_u32(0);
        buf.unwrite(4);
        assert_eq!(buf.retrieve_all_as_vec(), b"abc");
    }
}
