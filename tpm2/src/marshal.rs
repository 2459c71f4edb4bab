// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: BUSL-1.1

//! Big-endian wire encoding of TPM structures.

use anyhow::{bail, Result};

/// Bytes of an outgoing command.
#[derive(Debug, Default)]
pub struct CommandBuffer {
    data: Vec<u8>,
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
        }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.data.push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.put_bytes(&v.to_be_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.put_bytes(&v.to_be_bytes());
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// A TPM2B: u16 length followed by the bytes.
    pub fn put_tpm2b(&mut self, bytes: &[u8]) {
        debug_assert!(bytes.len() <= u16::MAX as usize);
        self.put_u16(bytes.len() as u16);
        self.put_bytes(bytes);
    }

    pub fn put_tpm2b_empty(&mut self) {
        self.put_u16(0);
    }

    /// Back-fill a u32 written earlier, e.g. the command size.
    pub fn update_u32(&mut self, pos: usize, v: u32) {
        self.data[pos..pos + 4].copy_from_slice(&v.to_be_bytes());
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

/// Cursor over a response; reads consume from the front.
#[derive(Debug)]
pub struct ResponseBuffer<'a> {
    rest: &'a [u8],
}

impl<'a> ResponseBuffer<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { rest: data }
    }

    pub fn remaining(&self) -> usize {
        self.rest.len()
    }

    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        if len > self.rest.len() {
            bail!(
                "truncated TPM response: {what} needs {len} bytes, {} left",
                self.rest.len()
            );
        }
        let (head, tail) = self.rest.split_at(len);
        self.rest = tail;
        Ok(head)
    }

    fn take_array<const N: usize>(&mut self, what: &str) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, what)?);
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take_array::<1>("u8")?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        self.take_array("u16").map(u16::from_be_bytes)
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        self.take_array("u32").map(u32::from_be_bytes)
    }

    pub fn get_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        self.take(len, "byte string").map(<[u8]>::to_vec)
    }

    pub fn get_tpm2b(&mut self) -> Result<Vec<u8>> {
        let len = self.get_u16()? as usize;
        self.take(len, "TPM2B body").map(<[u8]>::to_vec)
    }
}

/// A structure that can be written into a command.
pub trait Marshal {
    fn marshal(&self, buf: &mut CommandBuffer);

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = CommandBuffer::new();
        self.marshal(&mut buf);
        buf.into_vec()
    }
}

/// A structure that can be read from a response.
pub trait Unmarshal: Sized {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self>;

    fn from_bytes(data: &[u8]) -> Result<Self> {
        Self::unmarshal(&mut ResponseBuffer::new(data))
    }
}

macro_rules! impl_wire_int {
    ($($ty:ty => $put:ident, $get:ident;)*) => {
        $(
            impl Marshal for $ty {
                fn marshal(&self, buf: &mut CommandBuffer) {
                    buf.$put(*self);
                }
            }

            impl Unmarshal for $ty {
                fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
                    buf.$get()
                }
            }
        )*
    };
}

impl_wire_int! {
    u8 => put_u8, get_u8;
    u16 => put_u16, get_u16;
    u32 => put_u32, get_u32;
}
