//-
// Copyright (c) 2024, Jason Lingle
//
// This file is part of Kvmail.
//
// Kvmail is free software: you can  redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Kvmail is distributed  in the hope that  it will be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Kvmail. If not, see <http://www.gnu.org/licenses/>.

//! Content-addressed storage of message header and body bytes.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future;
use serde::{Deserialize, Serialize};
use tiny_keccak::{Hasher, Sha3};

use super::keys::{self, KeyBuilder};
use super::rows::{decode, encode, BlobDescriptor};
use super::KvStore;
use crate::support::error::Error;

/// The address of a piece of content: the 256-bit SHA-3 of its bytes.
///
/// Displayed as unpadded URL-safe base64.
#[derive(
    Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ContentId(#[serde(with = "serde_bytes")] Vec<u8>);

impl ContentId {
    pub fn of(data: &[u8]) -> Self {
        let mut sha3 = Sha3::v256();
        sha3.update(data);
        let mut hash = [0u8; 32];
        sha3.finalize(&mut hash);
        ContentId(hash.to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            base64::encode_config(&self.0, base64::URL_SAFE_NO_PAD)
        )
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ContentId({})", self)
    }
}

impl FromStr for ContentId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let raw = base64::decode_config(s, base64::URL_SAFE_NO_PAD)
            .map_err(|_| Error::BadIdentifier)?;
        if 32 != raw.len() {
            return Err(Error::BadIdentifier);
        }

        Ok(ContentId(raw))
    }
}

/// Opaque storage of immutable byte strings.
///
/// Content is never deleted: any number of messages may share it and nothing
/// counts references.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Store `data`, returning its address.
    ///
    /// Storing the same bytes again has no effect.
    async fn put(&self, data: &[u8]) -> Result<ContentId, Error>;

    /// Load the content at `id`, failing with `Error::NxContent` if there is
    /// none.
    async fn get(&self, id: &ContentId) -> Result<Vec<u8>, Error>;
}

/// A `ContentStore` on top of the same `KvStore` as everything else.
///
/// Content is split into rows of at most `chunk_size` bytes. The descriptor
/// row is written after all chunks, so content whose descriptor exists is
/// complete.
pub struct KvContentStore {
    store: Arc<dyn KvStore>,
    chunk_size: usize,
}

impl KvContentStore {
    pub fn new(store: Arc<dyn KvStore>, chunk_size: usize) -> Self {
        KvContentStore {
            store,
            chunk_size: chunk_size.max(1),
        }
    }

    fn descriptor_key(id: &ContentId) -> Vec<u8> {
        KeyBuilder::new(keys::BLOB_DESCRIPTOR).bytes(&id.0).build()
    }

    fn chunk_prefix(id: &ContentId) -> KeyBuilder {
        KeyBuilder::new(keys::BLOB_CHUNK).bytes(&id.0)
    }
}

#[async_trait]
impl ContentStore for KvContentStore {
    async fn put(&self, data: &[u8]) -> Result<ContentId, Error> {
        let id = ContentId::of(data);
        let descriptor_key = Self::descriptor_key(&id);
        if self.store.get(&descriptor_key).await?.is_some() {
            return Ok(id);
        }

        let chunks = data.chunks(self.chunk_size).collect::<Vec<_>>();
        let descriptor = BlobDescriptor {
            size: data.len() as u64,
            chunks: chunks.len() as u32,
        };

        future::try_join_all(chunks.into_iter().enumerate().map(
            |(ix, chunk)| {
                let key = Self::chunk_prefix(&id).u32(ix as u32).build();
                async move { self.store.put(&key, chunk.to_vec()).await }
            },
        ))
        .await?;

        self.store.put(&descriptor_key, encode(&descriptor)?).await?;
        Ok(id)
    }

    async fn get(&self, id: &ContentId) -> Result<Vec<u8>, Error> {
        let descriptor: BlobDescriptor =
            match self.store.get(&Self::descriptor_key(id)).await? {
                Some(raw) => decode(&raw)?,
                None => return Err(Error::NxContent(id.to_string())),
            };

        let prefix = Self::chunk_prefix(id).build();
        let rows = self
            .store
            .scan(
                &prefix,
                &keys::prefix_end(&prefix),
                Some(descriptor.chunks as usize),
            )
            .await?;

        let mut data = Vec::with_capacity(descriptor.size as usize);
        for (_, chunk) in rows {
            data.extend_from_slice(&chunk);
        }

        if data.len() as u64 != descriptor.size {
            return Err(Error::CorruptRow("content chunks missing"));
        }

        Ok(data)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::storage::memory::MemoryStore;

    #[test]
    fn content_id_format() {
        let id = ContentId::of(b"hello world");
        let text = id.to_string();
        assert_eq!(43, text.len());
        assert!(!text.contains('='));
        assert!(!text.contains('+'));
        assert_eq!(id, text.parse::<ContentId>().unwrap());
        assert_matches!(Err(Error::BadIdentifier), "AAAA".parse::<ContentId>());
        assert_matches!(Err(Error::BadIdentifier), "!!".parse::<ContentId>());
    }

    #[tokio::test]
    async fn chunked_round_trip() {
        let kv = Arc::new(MemoryStore::new());
        let store = KvContentStore::new(kv.clone(), 7);

        let data = (0..100u8).collect::<Vec<u8>>();
        let id = store.put(&data).await.unwrap();
        assert_eq!(ContentId::of(&data), id);
        assert_eq!(data, store.get(&id).await.unwrap());
        assert_eq!(15, kv.count_with_prefix(&[keys::BLOB_CHUNK]));

        let again = store.put(&data).await.unwrap();
        assert_eq!(id, again);
        assert_eq!(1, kv.count_with_prefix(&[keys::BLOB_DESCRIPTOR]));

        let empty = store.put(b"").await.unwrap();
        assert_eq!(Vec::<u8>::new(), store.get(&empty).await.unwrap());
    }

    #[tokio::test]
    async fn missing_content() {
        let store = KvContentStore::new(Arc::new(MemoryStore::new()), 64);
        assert_matches!(
            Err(Error::NxContent(_)),
            store.get(&ContentId::of(b"nope")).await
        );
    }

    #[tokio::test]
    async fn lost_chunk_detected() {
        let kv = Arc::new(MemoryStore::new());
        let store = KvContentStore::new(kv.clone(), 4);
        let id = store.put(b"0123456789").await.unwrap();
        kv.delete(&KvContentStore::chunk_prefix(&id).u32(1).build())
            .await
            .unwrap();
        assert_matches!(Err(Error::CorruptRow(_)), store.get(&id).await);
    }
}
