//! Content-addressed encoding.
//!
//! Records are encoded as DAG-CBOR and identified by the SHA-256 of the
//! encoded bytes, so the same logical value always lands under the same key.

use crate::{
    Aggregate, Buffer, BufferMessage, BundlioError, ContentId, Inclusion, Piece, PieceReceipt,
    Result,
};
use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};

/// Compute SHA256 hash of data
pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Verify that data matches the expected hash
pub fn verify_hash(data: &[u8], expected_hash: &str) -> Result<()> {
    let actual_hash = compute_hash(data);
    if actual_hash != expected_hash {
        return Err(BundlioError::Codec(format!(
            "hash mismatch: expected={} actual={}",
            expected_hash, actual_hash
        )));
    }
    Ok(())
}

/// Key/value pair as written to a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: String,
    pub value: Bytes,
}

/// Encoded bytes together with their content identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub cid: ContentId,
    pub bytes: Bytes,
}

impl Block {
    pub fn store_record(&self) -> Record {
        Record {
            key: buffer_key(self.cid.as_str()),
            value: self.bytes.clone(),
        }
    }

    pub fn message(&self) -> BufferMessage {
        BufferMessage {
            buffer: self.cid.clone(),
        }
    }
}

pub fn to_vec<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_ipld_dagcbor::to_vec(value)
        .map_err(|error| BundlioError::Codec(format!("failed to encode DAG-CBOR: {}", error)))
}

pub fn from_slice<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_ipld_dagcbor::from_slice(bytes)
        .map_err(|error| BundlioError::Codec(format!("failed to decode DAG-CBOR: {}", error)))
}

pub fn encode<T: Serialize>(value: &T) -> Result<Block> {
    let bytes = to_vec(value)?;
    Ok(Block {
        cid: ContentId::new(compute_hash(&bytes)),
        bytes: Bytes::from(bytes),
    })
}

pub fn encode_buffer(buffer: &Buffer) -> Result<Block> {
    encode(buffer)
}

pub fn decode_buffer(bytes: &[u8]) -> Result<Buffer> {
    from_slice(bytes)
}

pub fn buffer_key(cid: &str) -> String {
    format!("{}/{}", cid, cid)
}

pub fn inclusion_key(aggregate: &str, piece: &str) -> String {
    format!("{}/{}", aggregate, piece)
}

/// Receipts share a namespace with piece records, so they carry a prefix.
pub fn receipt_key(piece: &str) -> String {
    format!("receipt/{}", piece)
}

/// A value that can be persisted through [`crate::Store`].
pub trait StoreRecord: Sized + Send + Sync {
    /// Store key of the record with the given identifier.
    fn key_for(id: &str) -> String;

    fn to_record(&self) -> Result<Record>;

    fn from_record(id: &str, bytes: &[u8]) -> Result<Self>;
}

impl StoreRecord for Buffer {
    fn key_for(id: &str) -> String {
        buffer_key(id)
    }

    fn to_record(&self) -> Result<Record> {
        Ok(encode_buffer(self)?.store_record())
    }

    fn from_record(id: &str, bytes: &[u8]) -> Result<Self> {
        verify_hash(bytes, id)?;
        decode_buffer(bytes)
    }
}

impl StoreRecord for Piece {
    fn key_for(id: &str) -> String {
        id.to_string()
    }

    fn to_record(&self) -> Result<Record> {
        Ok(Record {
            key: self.piece.commitment.clone(),
            value: Bytes::from(to_vec(self)?),
        })
    }

    fn from_record(_id: &str, bytes: &[u8]) -> Result<Self> {
        from_slice(bytes)
    }
}

impl StoreRecord for PieceReceipt {
    fn key_for(id: &str) -> String {
        receipt_key(id)
    }

    fn to_record(&self) -> Result<Record> {
        Ok(Record {
            key: receipt_key(&self.piece),
            value: Bytes::from(to_vec(self)?),
        })
    }

    fn from_record(_id: &str, bytes: &[u8]) -> Result<Self> {
        from_slice(bytes)
    }
}

impl StoreRecord for Aggregate {
    fn key_for(id: &str) -> String {
        id.to_string()
    }

    fn to_record(&self) -> Result<Record> {
        Ok(Record {
            key: self.piece.commitment.clone(),
            value: Bytes::from(to_vec(self)?),
        })
    }

    fn from_record(_id: &str, bytes: &[u8]) -> Result<Self> {
        from_slice(bytes)
    }
}

impl StoreRecord for Inclusion {
    fn key_for(id: &str) -> String {
        id.to_string()
    }

    fn to_record(&self) -> Result<Record> {
        Ok(Record {
            key: inclusion_key(&self.aggregate, &self.piece),
            value: Bytes::from(to_vec(self)?),
        })
    }

    fn from_record(_id: &str, bytes: &[u8]) -> Result<Self> {
        from_slice(bytes)
    }
}
