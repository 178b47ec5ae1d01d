//! The subset of XDR (RFC 4506) used by the libvirt remote protocol.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum XdrError {
    #[error("xdr buffer truncated: needed {needed} bytes, {remaining} left")]
    Truncated { needed: usize, remaining: usize },

    #[error("xdr string is not valid utf-8")]
    InvalidUtf8,

    #[error("xdr optional discriminant must be 0 or 1, got {0}")]
    InvalidOptional(u32),
}

fn padding(len: usize) -> usize {
    (4 - len % 4) % 4
}

#[derive(Debug, Default)]
pub struct XdrWriter {
    buf: BytesMut,
}

impl XdrWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.buf.put_u32(value);
        self
    }

    pub fn put_i32(&mut self, value: i32) -> &mut Self {
        self.buf.put_i32(value);
        self
    }

    /// Variable-length opaque data / `string<>`.
    pub fn put_string(&mut self, value: &str) -> &mut Self {
        let bytes = value.as_bytes();
        self.buf.put_u32(bytes.len() as u32);
        self.buf.put_slice(bytes);
        self.buf.put_bytes(0, padding(bytes.len()));
        self
    }

    /// `remote_string`: a pointer to a string, encoded as a 0/1 discriminant.
    pub fn put_optional_string(&mut self, value: Option<&str>) -> &mut Self {
        match value {
            Some(value) => {
                self.put_u32(1);
                self.put_string(value)
            }
            None => self.put_u32(0),
        }
    }

    /// Fixed-length opaque data.
    pub fn put_fixed_opaque(&mut self, value: &[u8]) -> &mut Self {
        self.buf.put_slice(value);
        self.buf.put_bytes(0, padding(value.len()));
        self
    }

    pub fn finish(self) -> BytesMut {
        self.buf
    }
}

#[derive(Debug)]
pub struct XdrReader<B> {
    buf: B,
}

impl<B: Buf> XdrReader<B> {
    pub fn new(buf: B) -> Self {
        Self { buf }
    }

    fn ensure(&self, needed: usize) -> Result<(), XdrError> {
        let remaining = self.buf.remaining();
        if remaining < needed {
            return Err(XdrError::Truncated { needed, remaining });
        }
        Ok(())
    }

    pub fn get_u32(&mut self) -> Result<u32, XdrError> {
        self.ensure(4)?;
        Ok(self.buf.get_u32())
    }

    pub fn get_i32(&mut self) -> Result<i32, XdrError> {
        self.ensure(4)?;
        Ok(self.buf.get_i32())
    }

    pub fn get_string(&mut self) -> Result<String, XdrError> {
        let len = self.get_u32()? as usize;
        self.ensure(len + padding(len))?;
        let mut bytes = vec![0; len];
        self.buf.copy_to_slice(&mut bytes);
        self.buf.advance(padding(len));
        String::from_utf8(bytes).map_err(|_| XdrError::InvalidUtf8)
    }

    pub fn get_optional_string(&mut self) -> Result<Option<String>, XdrError> {
        match self.get_u32()? {
            0 => Ok(None),
            1 => self.get_string().map(Some),
            other => Err(XdrError::InvalidOptional(other)),
        }
    }

    pub fn get_fixed_opaque<const N: usize>(&mut self) -> Result<[u8; N], XdrError> {
        self.ensure(N + padding(N))?;
        let mut bytes = [0; N];
        self.buf.copy_to_slice(&mut bytes);
        self.buf.advance(padding(N));
        Ok(bytes)
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }
}
