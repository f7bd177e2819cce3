//! The lesson grammar: the wire protocol of a sync session.
//!
//! Teacher-to-learner traffic is a stream of lessons, one per expectation slot, so
//! no extra framing is needed: the reader always knows a lesson is due. An internal
//! lesson carries the hashes of the node's children ("queries"); the learner answers
//! each with a one-byte boolean response on the opposite stream, in strict child
//! order. The session root's internal lesson additionally carries the teacher's leaf
//! boundaries.
//!
//! Every field a peer could inflate is bounded and checked on decode; a malformed
//! tag, response byte, or size field is a protocol error that fails the session.

use anyhow::{bail, ensure, Result};
use std::io::{Read, Write};
use virtmap_core::{Hash, VirtualLeafBytes, HASH_SIZE};

const TAG_UP_TO_DATE: u8 = 0;
const TAG_LEAF_DATA: u8 = 1;
const TAG_INTERNAL_DATA: u8 = 2;

/// The most child queries one internal lesson may carry.
pub const MAX_QUERIES: usize = 64;

const MAX_LEAF_LESSON_SIZE: u32 = 1 << 30;

/// One unit of the tree-diff protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lesson {
    /// The learner's node at this slot already matches; keep it.
    UpToDate,
    /// Replace the leaf at this slot with the shipped record.
    Leaf(VirtualLeafBytes),
    /// Replace the internal node at this slot; the queries are the teacher's child
    /// hashes, each owed one boolean response.
    Internal(InternalLesson),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalLesson {
    pub path: i64,
    /// The teacher's `(first_leaf_path, last_leaf_path)`, carried only by the
    /// session root's lesson.
    pub leaf_boundaries: Option<(i64, i64)>,
    pub queries: Vec<Hash>,
}

pub fn write_lesson<W: Write>(writer: &mut W, lesson: &Lesson) -> Result<()> {
    match lesson {
        Lesson::UpToDate => writer.write_all(&[TAG_UP_TO_DATE])?,
        Lesson::Leaf(leaf) => {
            writer.write_all(&[TAG_LEAF_DATA])?;
            let bytes = leaf.encode();
            writer.write_all(&(bytes.len() as u32).to_le_bytes())?;
            writer.write_all(&bytes)?;
        }
        Lesson::Internal(internal) => {
            ensure!(
                internal.queries.len() <= MAX_QUERIES,
                "internal lesson with {} queries",
                internal.queries.len()
            );
            writer.write_all(&[TAG_INTERNAL_DATA])?;
            writer.write_all(&internal.path.to_le_bytes())?;
            match internal.leaf_boundaries {
                Some((first, last)) => {
                    writer.write_all(&[1])?;
                    writer.write_all(&first.to_le_bytes())?;
                    writer.write_all(&last.to_le_bytes())?;
                }
                None => writer.write_all(&[0])?,
            }
            writer.write_all(&[internal.queries.len() as u8])?;
            for query in &internal.queries {
                writer.write_all(query)?;
            }
        }
    }
    Ok(())
}

pub fn read_lesson<R: Read>(reader: &mut R) -> Result<Lesson> {
    match read_u8(reader)? {
        TAG_UP_TO_DATE => Ok(Lesson::UpToDate),
        TAG_LEAF_DATA => {
            let len = read_u32(reader)?;
            ensure!(len <= MAX_LEAF_LESSON_SIZE, "leaf lesson claims {} bytes", len);
            let mut bytes = vec![0u8; len as usize];
            reader.read_exact(&mut bytes)?;
            Ok(Lesson::Leaf(VirtualLeafBytes::decode(&bytes)?))
        }
        TAG_INTERNAL_DATA => {
            let path = read_i64(reader)?;
            let leaf_boundaries = match read_u8(reader)? {
                0 => None,
                1 => Some((read_i64(reader)?, read_i64(reader)?)),
                flag => bail!("bad leaf-boundary flag {}", flag),
            };
            let count = read_u8(reader)? as usize;
            ensure!(count <= MAX_QUERIES, "internal lesson claims {} queries", count);
            let mut queries = Vec::with_capacity(count);
            for _ in 0..count {
                let mut hash = [0u8; HASH_SIZE];
                reader.read_exact(&mut hash)?;
                queries.push(hash);
            }
            Ok(Lesson::Internal(InternalLesson {
                path,
                leaf_boundaries,
                queries,
            }))
        }
        tag => bail!("unknown lesson tag {}", tag),
    }
}

pub fn write_response<W: Write>(writer: &mut W, known: bool) -> Result<()> {
    writer.write_all(&[known as u8])?;
    Ok(())
}

pub fn read_response<R: Read>(reader: &mut R) -> Result<bool> {
    match read_u8(reader)? {
        0 => Ok(false),
        1 => Ok(true),
        byte => bail!("bad query response byte {}", byte),
    }
}

pub fn write_root_hash<W: Write>(writer: &mut W, hash: &Hash) -> Result<()> {
    writer.write_all(hash)?;
    Ok(())
}

pub fn read_root_hash<R: Read>(reader: &mut R) -> Result<Hash> {
    let mut hash = [0u8; HASH_SIZE];
    reader.read_exact(&mut hash)?;
    Ok(hash)
}

fn read_u8<R: Read>(reader: &mut R) -> Result<u8> {
    let mut byte = [0u8; 1];
    reader.read_exact(&mut byte)?;
    Ok(byte[0])
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

fn read_i64<R: Read>(reader: &mut R) -> Result<i64> {
    let mut bytes = [0u8; 8];
    reader.read_exact(&mut bytes)?;
    Ok(i64::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;
    use std::io::Cursor;

    fn round_trip(lesson: Lesson) {
        let mut bytes = Vec::new();
        write_lesson(&mut bytes, &lesson).unwrap();
        let decoded = read_lesson(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(lesson, decoded);
    }

    #[test]
    fn lesson_round_trips() {
        round_trip(Lesson::UpToDate);
        round_trip(Lesson::Leaf(VirtualLeafBytes::new(
            9,
            b"key".to_vec(),
            b"value".to_vec(),
        )));
        round_trip(Lesson::Internal(InternalLesson {
            path: 0,
            leaf_boundaries: Some((3, 6)),
            queries: vec![
                hex!("0f1e2d3c4b5a69788796a5b4c3d2e1f00f1e2d3c4b5a69788796a5b4c3d2e1f0"),
                [2; 32],
            ],
        }));
        round_trip(Lesson::Internal(InternalLesson {
            path: 2,
            leaf_boundaries: None,
            queries: vec![[7; 32]],
        }));
    }

    #[test]
    fn unknown_tag_is_a_protocol_error() {
        assert!(read_lesson(&mut Cursor::new(vec![9u8])).is_err());
    }

    #[test]
    fn oversized_query_count_rejected() {
        let mut bytes = Vec::new();
        bytes.push(2); // internal
        bytes.extend_from_slice(&0i64.to_le_bytes());
        bytes.push(0); // no boundaries
        bytes.push(65); // over the query bound
        bytes.extend_from_slice(&[0u8; 65 * 32]);
        assert!(read_lesson(&mut Cursor::new(bytes)).is_err());
    }

    #[test]
    fn bad_response_byte_rejected() {
        assert_eq!(read_response(&mut Cursor::new(vec![0u8])).unwrap(), false);
        assert_eq!(read_response(&mut Cursor::new(vec![1u8])).unwrap(), true);
        assert!(read_response(&mut Cursor::new(vec![2u8])).is_err());
    }

    #[test]
    fn truncated_lesson_is_an_error() {
        let mut bytes = Vec::new();
        write_lesson(
            &mut bytes,
            &Lesson::Leaf(VirtualLeafBytes::new(1, b"k".to_vec(), b"v".to_vec())),
        )
        .unwrap();
        bytes.truncate(bytes.len() - 1);
        assert!(read_lesson(&mut Cursor::new(bytes)).is_err());
    }
}
