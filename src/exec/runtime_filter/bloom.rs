// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Block bloom filter used by `Bloom` and overflowed `InOrBloom` runtime filters.
//!
//! Responsibilities:
//! - Sizes a split-block bloom filter from an expected build row count.
//! - Inserts and probes xxHash64 value hashes; merges same-sized filters by bitwise OR.
//!
//! Key exported interfaces:
//! - Types: `BlockBloomFilter`.

use bytes::{Buf, BufMut, BytesMut};

use super::codec::{ensure_remaining, get_i32_le, get_u32_le};
use super::error::{Result, RuntimeFilterError};
use super::value::FilterValue;

const SALT: [u32; 8] = [
    0x47b6137b, 0x44974d91, 0x8824ad5b, 0xa2b7289d, 0x705495c7, 0x2df1424b, 0x9efc4947, 0x5c6bfb31,
];
const WORDS_PER_BUCKET: usize = 8;
const MAX_LOG_NUM_BUCKETS: i32 = 31;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockBloomFilter {
    log_num_buckets: i32,
    directory_mask: u32,
    directory: Vec<u32>,
}

fn log_num_buckets_for(num_elements: u64) -> i32 {
    let nums = num_elements.max(1);
    let log_heap_space = (nums as f64).log2().ceil() as i32;
    (log_heap_space - 5).clamp(1, MAX_LOG_NUM_BUCKETS)
}

impl BlockBloomFilter {
    pub fn with_capacity(num_elements: u64) -> Self {
        let log_num_buckets = log_num_buckets_for(num_elements);
        let bucket_count = 1usize << log_num_buckets;
        Self {
            log_num_buckets,
            directory_mask: (bucket_count - 1) as u32,
            directory: vec![0u32; bucket_count * WORDS_PER_BUCKET],
        }
    }

    /// Bytes `with_capacity(num_elements)` would allocate.
    pub fn estimated_bytes(num_elements: u64) -> u64 {
        let bucket_count = 1u64 << log_num_buckets_for(num_elements);
        bucket_count * (WORDS_PER_BUCKET as u64) * 4
    }

    pub fn byte_size(&self) -> usize {
        self.directory.len() * 4
    }

    pub fn num_buckets(&self) -> usize {
        self.directory.len() / WORDS_PER_BUCKET
    }

    pub fn insert(&mut self, value: &FilterValue) {
        self.insert_hash(value.hash64());
    }

    pub fn may_contain(&self, value: &FilterValue) -> bool {
        self.test_hash(value.hash64())
    }

    pub fn insert_hash(&mut self, hash: u64) {
        let bucket_idx = (hash as u32) & self.directory_mask;
        let key = (hash >> (self.log_num_buckets as u32)) as u32;
        let masks = make_mask(key);
        let base = bucket_idx as usize * WORDS_PER_BUCKET;
        for (word, mask) in self.directory[base..base + WORDS_PER_BUCKET]
            .iter_mut()
            .zip(masks)
        {
            *word |= mask;
        }
    }

    pub fn test_hash(&self, hash: u64) -> bool {
        let bucket_idx = (hash as u32) & self.directory_mask;
        let key = (hash >> (self.log_num_buckets as u32)) as u32;
        let masks = make_mask(key);
        let base = bucket_idx as usize * WORDS_PER_BUCKET;
        self.directory[base..base + WORDS_PER_BUCKET]
            .iter()
            .zip(masks)
            .all(|(word, mask)| word & mask != 0)
    }

    pub fn merge_from(&mut self, other: &BlockBloomFilter) -> Result<()> {
        if self.log_num_buckets != other.log_num_buckets
            || self.directory.len() != other.directory.len()
        {
            return Err(RuntimeFilterError::Internal(format!(
                "bloom filter merge size mismatch: {} vs {} buckets",
                self.num_buckets(),
                other.num_buckets()
            )));
        }
        for (dst, src) in self.directory.iter_mut().zip(other.directory.iter()) {
            *dst |= *src;
        }
        Ok(())
    }

    pub(crate) fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.log_num_buckets);
        buf.put_u32_le(self.directory_mask);
        buf.put_u32_le((self.directory.len() * 4) as u32);
        for word in &self.directory {
            buf.put_u32_le(*word);
        }
    }

    pub(crate) fn decode(buf: &mut &[u8]) -> Result<Self> {
        let log_num_buckets = get_i32_le(buf)?;
        let directory_mask = get_u32_le(buf)?;
        let data_size = get_u32_le(buf)? as usize;
        if !(1..=MAX_LOG_NUM_BUCKETS).contains(&log_num_buckets) {
            return Err(RuntimeFilterError::Codec(format!(
                "bloom filter log_num_buckets out of range: {}",
                log_num_buckets
            )));
        }
        let bucket_count = 1usize << log_num_buckets;
        if data_size != bucket_count * WORDS_PER_BUCKET * 4
            || directory_mask as usize != bucket_count - 1
        {
            return Err(RuntimeFilterError::Codec(format!(
                "bloom filter directory size invalid: data_size={} buckets={}",
                data_size, bucket_count
            )));
        }
        ensure_remaining(buf, data_size, "bloom filter directory")?;
        let mut directory = Vec::with_capacity(data_size / 4);
        for _ in 0..(data_size / 4) {
            directory.push(buf.get_u32_le());
        }
        Ok(Self {
            log_num_buckets,
            directory_mask,
            directory,
        })
    }
}

fn make_mask(key: u32) -> [u32; 8] {
    let mut masks = [0u32; 8];
    for (mask, salt) in masks.iter_mut().zip(SALT) {
        *mask = 1u32 << (key.wrapping_mul(salt) >> 27);
    }
    masks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inserted_values_are_found() {
        let mut bf = BlockBloomFilter::with_capacity(1000);
        for i in 0..1000 {
            bf.insert(&FilterValue::Int(i));
        }
        for i in 0..1000 {
            assert!(bf.may_contain(&FilterValue::Int(i)));
        }
        let false_positives = (1000..11000)
            .filter(|i| bf.may_contain(&FilterValue::Int(*i)))
            .count();
        assert!(false_positives < 2000, "fpp too high: {}", false_positives);
    }

    #[test]
    fn estimated_bytes_matches_allocation() {
        for n in [0u64, 1, 31, 1000, 1 << 20] {
            let bf = BlockBloomFilter::with_capacity(n);
            assert_eq!(BlockBloomFilter::estimated_bytes(n), bf.byte_size() as u64);
        }
    }

    #[test]
    fn merge_is_union_and_rejects_size_mismatch() {
        let mut a = BlockBloomFilter::with_capacity(4096);
        let mut b = BlockBloomFilter::with_capacity(4096);
        a.insert(&FilterValue::Utf8("left".to_string()));
        b.insert(&FilterValue::Utf8("right".to_string()));
        a.merge_from(&b).unwrap();
        assert!(a.may_contain(&FilterValue::Utf8("left".to_string())));
        assert!(a.may_contain(&FilterValue::Utf8("right".to_string())));

        let small = BlockBloomFilter::with_capacity(16);
        assert!(matches!(
            a.merge_from(&small),
            Err(RuntimeFilterError::Internal(_))
        ));
    }

    #[test]
    fn decode_rejects_truncated_directory() {
        let mut bf = BlockBloomFilter::with_capacity(256);
        bf.insert(&FilterValue::Int(9));
        let mut buf = BytesMut::new();
        bf.encode_into(&mut buf);
        let mut full: &[u8] = &buf;
        assert_eq!(BlockBloomFilter::decode(&mut full).unwrap(), bf);
        let mut truncated: &[u8] = &buf[..buf.len() - 4];
        assert!(matches!(
            BlockBloomFilter::decode(&mut truncated),
            Err(RuntimeFilterError::Codec(_))
        ));
    }
}
