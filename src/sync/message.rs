//! Anti-entropy wire messages.
//!
//! Every message starts with a five-byte prefix `[type: u8][sender: u32 LE]`
//! followed by a type-specific body. Integers are little-endian. The
//! layouts are fixed — peers of different builds must agree byte-for-byte:
//!
//! ```text
//! INIT        [1][sender:4][root:8]
//! REQ_NODE    [2][sender:4][level:1][parent:4]
//! REP_NODE    [3][sender:4][level:1][pad:3][parent:4][16 x u64]
//! REQ_BUCKET  [4][sender:4][bucket:4]
//! REP_BUCKET  [5][sender:4][bucket:4][count:4]{[klen:2][key][hash:8]}*
//! GET_VAL     [6][sender:4][key...]
//! PUT_VAL     [7][sender:4][klen:2][key][mlen:2][meta][value...]
//! ```

use crate::core::error::{MeridianError, MeridianResult};
use crate::mesh::{Lane, NodeId};

/// Children per tree node; a REP_NODE always carries this many hashes.
pub const NODE_FAN_OUT: usize = 16;

/// One `(key, value_hash)` entry of a bucket listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketEntry {
    pub key: Vec<u8>,
    pub value_hash: u64,
}

/// A decoded anti-entropy message.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncMessage {
    /// Session opener carrying the initiator's root hash.
    Init { sender: NodeId, root: u64 },
    /// Request the 16 child hashes at `level` under `parent`.
    ReqNode {
        sender: NodeId,
        level: u8,
        parent: u32,
    },
    /// The 16 child hashes at `level` under `parent`.
    RepNode {
        sender: NodeId,
        level: u8,
        parent: u32,
        hashes: [u64; NODE_FAN_OUT],
    },
    /// Request the key listing of a leaf bucket.
    ReqBucket { sender: NodeId, bucket: u32 },
    /// The keys of a leaf bucket with their content hashes.
    RepBucket {
        sender: NodeId,
        bucket: u32,
        entries: Vec<BucketEntry>,
    },
    /// Request one key's meta and value.
    GetVal { sender: NodeId, key: Vec<u8> },
    /// One key's meta and value. Empty meta means the responder has no
    /// record of the key.
    PutVal {
        sender: NodeId,
        key: Vec<u8>,
        meta: Vec<u8>,
        value: Vec<u8>,
    },
}

const TYPE_INIT: u8 = 1;
const TYPE_REQ_NODE: u8 = 2;
const TYPE_REP_NODE: u8 = 3;
const TYPE_REQ_BUCKET: u8 = 4;
const TYPE_REP_BUCKET: u8 = 5;
const TYPE_GET_VAL: u8 = 6;
const TYPE_PUT_VAL: u8 = 7;

impl SyncMessage {
    /// The embedded sender id.
    pub fn sender(&self) -> NodeId {
        match self {
            Self::Init { sender, .. }
            | Self::ReqNode { sender, .. }
            | Self::RepNode { sender, .. }
            | Self::ReqBucket { sender, .. }
            | Self::RepBucket { sender, .. }
            | Self::GetVal { sender, .. }
            | Self::PutVal { sender, .. } => *sender,
        }
    }

    /// The lane this message rides: drill-down control traffic stays on
    /// the Control lane, listings and value transfers go Heavy.
    pub fn lane(&self) -> Lane {
        match self {
            Self::Init { .. }
            | Self::ReqNode { .. }
            | Self::RepNode { .. }
            | Self::ReqBucket { .. } => Lane::Control,
            Self::RepBucket { .. } | Self::GetVal { .. } | Self::PutVal { .. } => Lane::Heavy,
        }
    }

    /// Message name for logs and metrics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::ReqNode { .. } => "req_node",
            Self::RepNode { .. } => "rep_node",
            Self::ReqBucket { .. } => "req_bucket",
            Self::RepBucket { .. } => "rep_bucket",
            Self::GetVal { .. } => "get_val",
            Self::PutVal { .. } => "put_val",
        }
    }

    /// Encode to the wire layout.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Init { sender, root } => {
                let mut buf = prefix(TYPE_INIT, *sender, 8);
                buf.extend_from_slice(&root.to_le_bytes());
                buf
            }
            Self::ReqNode {
                sender,
                level,
                parent,
            } => {
                let mut buf = prefix(TYPE_REQ_NODE, *sender, 5);
                buf.push(*level);
                buf.extend_from_slice(&parent.to_le_bytes());
                buf
            }
            Self::RepNode {
                sender,
                level,
                parent,
                hashes,
            } => {
                let mut buf = prefix(TYPE_REP_NODE, *sender, 8 + NODE_FAN_OUT * 8);
                buf.push(*level);
                buf.extend_from_slice(&[0u8; 3]);
                buf.extend_from_slice(&parent.to_le_bytes());
                for hash in hashes {
                    buf.extend_from_slice(&hash.to_le_bytes());
                }
                buf
            }
            Self::ReqBucket { sender, bucket } => {
                let mut buf = prefix(TYPE_REQ_BUCKET, *sender, 4);
                buf.extend_from_slice(&bucket.to_le_bytes());
                buf
            }
            Self::RepBucket {
                sender,
                bucket,
                entries,
            } => {
                let body_len = 8 + entries
                    .iter()
                    .map(|e| 2 + e.key.len() + 8)
                    .sum::<usize>();
                let mut buf = prefix(TYPE_REP_BUCKET, *sender, body_len);
                buf.extend_from_slice(&bucket.to_le_bytes());
                buf.extend_from_slice(&(entries.len() as u32).to_le_bytes());
                for entry in entries {
                    buf.extend_from_slice(&(entry.key.len() as u16).to_le_bytes());
                    buf.extend_from_slice(&entry.key);
                    buf.extend_from_slice(&entry.value_hash.to_le_bytes());
                }
                buf
            }
            Self::GetVal { sender, key } => {
                let mut buf = prefix(TYPE_GET_VAL, *sender, key.len());
                buf.extend_from_slice(key);
                buf
            }
            Self::PutVal {
                sender,
                key,
                meta,
                value,
            } => {
                let mut buf = prefix(TYPE_PUT_VAL, *sender, 2 + key.len() + 2 + meta.len() + value.len());
                buf.extend_from_slice(&(key.len() as u16).to_le_bytes());
                buf.extend_from_slice(key);
                buf.extend_from_slice(&(meta.len() as u16).to_le_bytes());
                buf.extend_from_slice(meta);
                buf.extend_from_slice(value);
                buf
            }
        }
    }

    /// Decode from the wire layout. Short or malformed buffers are decode
    /// errors; the caller drops them.
    pub fn decode(buf: &[u8]) -> MeridianResult<Self> {
        let mut r = Reader::new(buf);
        let msg_type = r.u8().ok_or_else(|| short("type"))?;
        let sender = r.u32().ok_or_else(|| short("sender"))?;

        match msg_type {
            TYPE_INIT => Ok(Self::Init {
                sender,
                root: r.u64().ok_or_else(|| short("root"))?,
            }),
            TYPE_REQ_NODE => Ok(Self::ReqNode {
                sender,
                level: r.u8().ok_or_else(|| short("level"))?,
                parent: r.u32().ok_or_else(|| short("parent"))?,
            }),
            TYPE_REP_NODE => {
                let level = r.u8().ok_or_else(|| short("level"))?;
                r.skip(3).ok_or_else(|| short("padding"))?;
                let parent = r.u32().ok_or_else(|| short("parent"))?;
                let mut hashes = [0u64; NODE_FAN_OUT];
                for slot in &mut hashes {
                    *slot = r.u64().ok_or_else(|| short("child hash"))?;
                }
                Ok(Self::RepNode {
                    sender,
                    level,
                    parent,
                    hashes,
                })
            }
            TYPE_REQ_BUCKET => Ok(Self::ReqBucket {
                sender,
                bucket: r.u32().ok_or_else(|| short("bucket"))?,
            }),
            TYPE_REP_BUCKET => {
                let bucket = r.u32().ok_or_else(|| short("bucket"))?;
                let count = r.u32().ok_or_else(|| short("count"))?;
                let mut entries = Vec::new();
                for _ in 0..count {
                    let key_len = r.u16().ok_or_else(|| short("key length"))? as usize;
                    let key = r.bytes(key_len).ok_or_else(|| short("key"))?.to_vec();
                    let value_hash = r.u64().ok_or_else(|| short("value hash"))?;
                    entries.push(BucketEntry { key, value_hash });
                }
                Ok(Self::RepBucket {
                    sender,
                    bucket,
                    entries,
                })
            }
            TYPE_GET_VAL => Ok(Self::GetVal {
                sender,
                key: r.rest().to_vec(),
            }),
            TYPE_PUT_VAL => {
                let key_len = r.u16().ok_or_else(|| short("key length"))? as usize;
                let key = r.bytes(key_len).ok_or_else(|| short("key"))?.to_vec();
                let meta_len = r.u16().ok_or_else(|| short("meta length"))? as usize;
                let meta = r.bytes(meta_len).ok_or_else(|| short("meta"))?.to_vec();
                Ok(Self::PutVal {
                    sender,
                    key,
                    meta,
                    value: r.rest().to_vec(),
                })
            }
            other => Err(MeridianError::decode(format!(
                "unknown sync message type {}",
                other
            ))),
        }
    }
}

fn prefix(msg_type: u8, sender: NodeId, body_len: usize) -> Vec<u8> {
    let mut buf = Vec::with_capacity(5 + body_len);
    buf.push(msg_type);
    buf.extend_from_slice(&sender.to_le_bytes());
    buf
}

fn short(field: &str) -> MeridianError {
    MeridianError::decode(format!("sync message truncated at {}", field))
}

/// Little-endian cursor over a byte buffer.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        if end > self.buf.len() {
            return None;
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Some(slice)
    }

    fn skip(&mut self, len: usize) -> Option<()> {
        self.bytes(len).map(|_| ())
    }

    fn u8(&mut self) -> Option<u8> {
        self.bytes(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.bytes(2).map(|b| u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Option<u32> {
        self.bytes(4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Option<u64> {
        self.bytes(8).map(|b| {
            u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
        })
    }

    fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }
}
