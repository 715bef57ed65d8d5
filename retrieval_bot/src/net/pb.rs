//! Protobuf wire messages for the block-exchange protocol and dag-pb
//! nodes, plus the CID prefix carried alongside block payloads.

use cid::{Cid, Version};
use multihash_codetable::{Code, MultihashDigest};

#[derive(Clone, PartialEq, prost::Message)]
pub struct BitswapMessage {
    #[prost(message, optional, tag = "1")]
    pub wantlist: Option<Wantlist>,
    /// Legacy 1.0.0 block payloads without a prefix.
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub blocks: Vec<Vec<u8>>,
    #[prost(message, repeated, tag = "3")]
    pub payload: Vec<Block>,
    #[prost(message, repeated, tag = "4")]
    pub block_presences: Vec<BlockPresence>,
    #[prost(int32, tag = "5")]
    pub pending_bytes: i32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Wantlist {
    #[prost(message, repeated, tag = "1")]
    pub entries: Vec<WantlistEntry>,
    #[prost(bool, tag = "2")]
    pub full: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WantlistEntry {
    #[prost(bytes = "vec", tag = "1")]
    pub block: Vec<u8>,
    #[prost(int32, tag = "2")]
    pub priority: i32,
    #[prost(bool, tag = "3")]
    pub cancel: bool,
    #[prost(enumeration = "WantType", tag = "4")]
    pub want_type: i32,
    #[prost(bool, tag = "5")]
    pub send_dont_have: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum WantType {
    Block = 0,
    Have = 1,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Block {
    #[prost(bytes = "vec", tag = "1")]
    pub prefix: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub data: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct BlockPresence {
    #[prost(bytes = "vec", tag = "1")]
    pub cid: Vec<u8>,
    #[prost(enumeration = "BlockPresenceType", tag = "2")]
    pub presence_type: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum BlockPresenceType {
    Have = 0,
    DontHave = 1,
}

/// dag-pb node shape, links only.
#[derive(Clone, PartialEq, prost::Message)]
pub struct PbNode {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub data: Option<Vec<u8>>,
    #[prost(message, repeated, tag = "2")]
    pub links: Vec<PbLink>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PbLink {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub hash: Option<Vec<u8>>,
    #[prost(string, optional, tag = "2")]
    pub name: Option<String>,
    #[prost(uint64, optional, tag = "3")]
    pub tsize: Option<u64>,
}

/// CID prefix sent next to block payloads: version, codec, multihash
/// code and digest length, each as an unsigned varint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prefix {
    pub version: u64,
    pub codec: u64,
    pub mh_type: u64,
    pub mh_len: usize,
}

impl Prefix {
    pub fn parse(mut bytes: &[u8]) -> std::io::Result<Self> {
        let mut next = || -> std::io::Result<u64> {
            let (value, rest) = unsigned_varint::decode::u64(bytes)
                .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
            bytes = rest;
            Ok(value)
        };

        let version = next()?;
        let codec = next()?;
        let mh_type = next()?;
        let mh_len = next()? as usize;

        Ok(Self {
            version,
            codec,
            mh_type,
            mh_len,
        })
    }

    pub fn to_bytes(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16);
        let mut buf = unsigned_varint::encode::u64_buffer();
        out.extend_from_slice(unsigned_varint::encode::u64(self.version, &mut buf));
        out.extend_from_slice(unsigned_varint::encode::u64(self.codec, &mut buf));
        out.extend_from_slice(unsigned_varint::encode::u64(self.mh_type, &mut buf));
        out.extend_from_slice(unsigned_varint::encode::u64(self.mh_len as u64, &mut buf));
        out
    }

    /// Hashes the payload and rebuilds the CID the prefix describes.
    pub fn to_cid(self, data: &[u8]) -> std::io::Result<Cid> {
        let code = Code::try_from(self.mh_type)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
        let hash = code.digest(data);
        let version = Version::try_from(self.version)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
        Cid::new(version, self.codec, hash)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))
    }
}

impl From<&Cid> for Prefix {
    fn from(cid: &Cid) -> Self {
        Self {
            version: cid.version() as u64,
            codec: cid.codec(),
            mh_type: cid.hash().code(),
            mh_len: cid.hash().size() as usize,
        }
    }
}
