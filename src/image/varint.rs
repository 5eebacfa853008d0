//=====================================================
// File: image/varint.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Primitive readers and writers for the image format
// Objective: LEB128 and zigzag varints, length-prefixed strings and fixed-width floats
//            over a byte buffer with offset-tagged errors
//=====================================================

use crate::error::ImageError;

#[derive(Debug, Default)]
pub struct ImageWriter {
    bytes: Vec<u8>,
}

impl ImageWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn raw(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    pub fn byte(&mut self, value: u8) {
        self.bytes.push(value);
    }

    pub fn flag(&mut self, value: bool) {
        self.bytes.push(u8::from(value));
    }

    pub fn varint(&mut self, mut value: u64) {
        loop {
            let byte = (value & 0x7F) as u8;
            value >>= 7;
            if value == 0 {
                self.bytes.push(byte);
                break;
            }
            self.bytes.push(byte | 0x80);
        }
    }

    pub fn count(&mut self, value: usize) {
        self.varint(value as u64);
    }

    pub fn zigzag(&mut self, value: i64) {
        self.varint(((value << 1) ^ (value >> 63)) as u64);
    }

    pub fn f64(&mut self, value: f64) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    pub fn string(&mut self, value: &str) {
        self.count(value.len());
        self.bytes.extend_from_slice(value.as_bytes());
    }

    pub fn strings(&mut self, values: &[String]) {
        self.count(values.len());
        for value in values {
            self.string(value);
        }
    }
}

#[derive(Debug)]
pub struct ImageReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> ImageReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }

    pub fn raw(&mut self, len: usize) -> Result<&'a [u8], ImageError> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(ImageError::UnexpectedEof {
                offset: self.bytes.len(),
            })?;
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    pub fn byte(&mut self) -> Result<u8, ImageError> {
        Ok(self.raw(1)?[0])
    }

    pub fn flag(&mut self) -> Result<bool, ImageError> {
        let offset = self.offset;
        match self.byte()? {
            0 => Ok(false),
            1 => Ok(true),
            value => Err(ImageError::UnknownDiscriminator {
                kind: "flag",
                value,
                offset,
            }),
        }
    }

    pub fn varint(&mut self) -> Result<u64, ImageError> {
        let start = self.offset;
        let mut result = 0u64;
        let mut shift = 0;
        loop {
            let byte = self.byte()?;
            result |= u64::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
            if shift >= 64 {
                return Err(ImageError::InvalidVarint { offset: start });
            }
        }
    }

    pub fn count(&mut self) -> Result<usize, ImageError> {
        let start = self.offset;
        let value = self.varint()?;
        usize::try_from(value).map_err(|_| ImageError::InvalidVarint { offset: start })
    }

    pub fn u32(&mut self) -> Result<u32, ImageError> {
        let start = self.offset;
        let value = self.varint()?;
        u32::try_from(value).map_err(|_| ImageError::InvalidVarint { offset: start })
    }

    pub fn zigzag(&mut self) -> Result<i64, ImageError> {
        let raw = self.varint()?;
        Ok(((raw >> 1) as i64) ^ -((raw & 1) as i64))
    }

    pub fn f64(&mut self) -> Result<f64, ImageError> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.raw(8)?);
        Ok(f64::from_le_bytes(buf))
    }

    pub fn string(&mut self) -> Result<String, ImageError> {
        let len = self.count()?;
        let offset = self.offset;
        let bytes = self.raw(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ImageError::InvalidUtf8 { offset })
    }

    pub fn strings(&mut self) -> Result<Vec<String>, ImageError> {
        let count = self.count()?;
        let mut values = Vec::with_capacity(count.min(self.remaining()));
        for _ in 0..count {
            values.push(self.string()?);
        }
        Ok(values)
    }
}


//=====================================================
// End of file
//=====================================================
