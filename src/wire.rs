//! Little-endian binary codec helpers shared by the vault record and action
//! wire formats.
//!
//! Writers push onto a `Vec<u8>`; the [`Reader`] walks a byte slice and
//! returns `None` on underrun, which callers treat as a malformed record.

use crate::crypto::{Hash, Token, HASH_LEN, SIGNATURE_LEN, TOKEN_LEN};

pub fn put_u16(value: u16, out: &mut Vec<u8>) {
    out.extend_from_slice(&value.to_le_bytes());
}

pub fn put_u64(value: u64, out: &mut Vec<u8>) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Length-prefixed (u16) UTF-8 string.
pub fn put_str(value: &str, out: &mut Vec<u8>) {
    put_bytes(value.as_bytes(), out);
}

/// Length-prefixed (u16) byte string. Values must fit the prefix; the
/// vault store and the node's service boundary reject longer inputs
/// before anything is encoded.
pub fn put_bytes(value: &[u8], out: &mut Vec<u8>) {
    put_u16(value.len() as u16, out);
    out.extend_from_slice(value);
}

pub fn put_token(token: &Token, out: &mut Vec<u8>) {
    out.extend_from_slice(token.as_bytes());
}

pub fn put_hash(hash: &Hash, out: &mut Vec<u8>) {
    out.extend_from_slice(hash.as_bytes());
}

/// Sequential reader over a byte slice.
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Reader { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_done(&self) -> bool {
        self.pos == self.data.len()
    }

    pub fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.remaining() < n {
            return None;
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Some(slice)
    }

    pub fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    pub fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Option<u32> {
        let bytes = self.take(4)?;
        Some(u32::from_le_bytes(bytes.try_into().ok()?))
    }

    pub fn u64(&mut self) -> Option<u64> {
        let bytes = self.take(8)?;
        Some(u64::from_le_bytes(bytes.try_into().ok()?))
    }

    /// Length-prefixed UTF-8 string; `None` on underrun or invalid UTF-8.
    pub fn str(&mut self) -> Option<String> {
        let bytes = self.bytes()?;
        String::from_utf8(bytes.to_vec()).ok()
    }

    /// Length-prefixed byte string.
    pub fn bytes(&mut self) -> Option<&'a [u8]> {
        let len = self.u16()? as usize;
        self.take(len)
    }

    pub fn token(&mut self) -> Option<Token> {
        let bytes = self.take(TOKEN_LEN)?;
        Some(Token(bytes.try_into().ok()?))
    }

    pub fn hash(&mut self) -> Option<Hash> {
        let bytes = self.take(HASH_LEN)?;
        Some(Hash(bytes.try_into().ok()?))
    }

    pub fn signature(&mut self) -> Option<[u8; SIGNATURE_LEN]> {
        let bytes = self.take(SIGNATURE_LEN)?;
        bytes.try_into().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_keypair;

    #[test]
    fn test_scalar_roundtrip() {
        let mut out = Vec::new();
        put_u16(0xBEEF, &mut out);
        put_u64(42, &mut out);
        put_str("alice", &mut out);

        let mut reader = Reader::new(&out);
        assert_eq!(reader.u16(), Some(0xBEEF));
        assert_eq!(reader.u64(), Some(42));
        assert_eq!(reader.str().as_deref(), Some("alice"));
        assert!(reader.is_done());
    }

    #[test]
    fn test_token_roundtrip() {
        let (_, token) = generate_keypair();
        let mut out = Vec::new();
        put_token(&token, &mut out);

        let mut reader = Reader::new(&out);
        assert_eq!(reader.token(), Some(token));
    }

    #[test]
    fn test_underrun_returns_none() {
        let mut out = Vec::new();
        put_str("alice", &mut out);
        out.truncate(out.len() - 1);

        let mut reader = Reader::new(&out);
        assert_eq!(reader.str(), None);
    }

    #[test]
    fn test_empty_string() {
        let mut out = Vec::new();
        put_str("", &mut out);
        let mut reader = Reader::new(&out);
        assert_eq!(reader.str().as_deref(), Some(""));
    }
}
