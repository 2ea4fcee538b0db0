// This file is part of corvid-indexer.
// Copyright (C) 2026 Corvid Project
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use std::{
    fmt::{self, Debug, Display},
    str::FromStr,
};
use thiserror::Error;

/// A fixed-length byte array, displayed and serialized as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ByteArray<const N: usize>(pub [u8; N]);

impl<const N: usize> Default for ByteArray<N> {
    fn default() -> Self {
        Self([0u8; N])
    }
}

impl<const N: usize> ByteArray<N> {
    pub fn as_bytes(&self) -> &[u8; N] {
        &self.0
    }
}

impl<const N: usize> AsRef<[u8]> for ByteArray<N> {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl<const N: usize> From<[u8; N]> for ByteArray<N> {
    fn from(bytes: [u8; N]) -> Self {
        Self(bytes)
    }
}

impl<const N: usize> TryFrom<&[u8]> for ByteArray<N> {
    type Error = ByteArrayLenError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let bytes = <[u8; N]>::try_from(bytes)
            .map_err(|_| ByteArrayLenError(N, bytes.len()))?;
        Ok(Self(bytes))
    }
}

impl<const N: usize> Display for ByteArray<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", const_hex::encode(self.0))
    }
}

impl<const N: usize> Debug for ByteArray<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

impl<const N: usize> FromStr for ByteArray<N> {
    type Err = HexDecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = const_hex::decode(s)?;
        let bytes = ByteArray::try_from(bytes.as_slice())?;
        Ok(bytes)
    }
}

impl<const N: usize> Serialize for ByteArray<N> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de, const N: usize> Deserialize<'de> for ByteArray<N> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// A variable-length byte string, displayed and serialized as lowercase hex.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct ByteVec(pub Vec<u8>);

impl ByteVec {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl AsRef<[u8]> for ByteVec {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for ByteVec {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl Display for ByteVec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", const_hex::encode(&self.0))
    }
}

impl Debug for ByteVec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

impl FromStr for ByteVec {
    type Err = HexDecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(const_hex::decode(s)?))
    }
}

impl Serialize for ByteVec {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ByteVec {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[derive(Debug, Error)]
#[error("expected {0} bytes, but got {1}")]
pub struct ByteArrayLenError(usize, usize);

#[derive(Debug, Error)]
pub enum HexDecodeError {
    #[error("cannot hex-decode")]
    Hex(#[from] const_hex::FromHexError),

    #[error(transparent)]
    Len(#[from] ByteArrayLenError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_byte_array_hex_roundtrip() {
        let bytes = ByteArray::<4>([0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(bytes.to_string(), "deadbeef");
        assert_eq!("deadbeef".parse::<ByteArray<4>>().unwrap(), bytes);
        assert_matches!("dead".parse::<ByteArray<4>>(), Err(HexDecodeError::Len(_)));
        assert_matches!("zzzz".parse::<ByteArray<2>>(), Err(HexDecodeError::Hex(_)));
    }

    #[test]
    fn test_byte_array_serde() {
        let bytes = ByteArray::<2>([0x01, 0x02]);
        let json = serde_json::to_string(&bytes).unwrap();
        assert_eq!(json, r#""0102""#);
        assert_eq!(serde_json::from_str::<ByteArray<2>>(&json).unwrap(), bytes);
    }

    #[test]
    fn test_byte_vec() {
        let bytes = ByteVec(vec![0xab, 0xcd]);
        assert_eq!(bytes.to_string(), "abcd");
        assert_eq!("abcd".parse::<ByteVec>().unwrap(), bytes);
    }
}
