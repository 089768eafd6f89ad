//! Framed on-disk index format.
//!
//! Layout: `[magic 4][version 1][crc32 4][len 8][payload]`, little endian.
//! The payload carries the dataset, the vids and the trained structure; the
//! CRC covers the payload only. Rewrites go through a temp file and a
//! rename so a crashed dump never leaves a torn index behind.

use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;

use vectra_core::{Error, Result};

use crate::engine::{DataSet, Trained};

pub(crate) const INDEX_FILE: &str = "index.bin";

const MAGIC: &[u8; 4] = b"VXI\0";
const VERSION: u8 = 1;

pub(crate) struct PersistedIndex {
    pub dim: usize,
    pub brute_threshold: usize,
    pub index_id: u64,
    pub data: DataSet,
    pub trained: Option<Trained>,
}

pub(crate) fn write_index(
    path: &Path,
    dim: usize,
    brute_threshold: usize,
    index_id: u64,
    data: &DataSet,
    trained: Option<&Trained>,
) -> Result<()> {
    let mut payload = Vec::new();
    payload.write_u32::<LittleEndian>(dim as u32)?;
    payload.write_u64::<LittleEndian>(brute_threshold as u64)?;
    payload.write_u64::<LittleEndian>(index_id)?;

    payload.write_u64::<LittleEndian>(data.vids.len() as u64)?;
    for &vid in &data.vids {
        payload.write_u64::<LittleEndian>(vid)?;
    }
    for &v in &data.vectors {
        payload.write_f32::<LittleEndian>(v)?;
    }

    match trained {
        None => payload.write_u8(0)?,
        Some(t) => {
            payload.write_u8(1)?;
            payload.write_u64::<LittleEndian>(t.nlist as u64)?;
            payload.write_u64::<LittleEndian>(t.indexed_len as u64)?;
            for &c in &t.centroids {
                payload.write_f32::<LittleEndian>(c)?;
            }
            for list in &t.lists {
                payload.write_u64::<LittleEndian>(list.len() as u64)?;
                for &row in list {
                    payload.write_u32::<LittleEndian>(row)?;
                }
            }
        }
    }

    let mut hasher = Hasher::new();
    hasher.update(&payload);
    let crc = hasher.finalize();

    let tmp = path.with_extension("tmp");
    {
        let mut file = BufWriter::new(File::create(&tmp)?);
        file.write_all(MAGIC)?;
        file.write_u8(VERSION)?;
        file.write_u32::<LittleEndian>(crc)?;
        file.write_u64::<LittleEndian>(payload.len() as u64)?;
        file.write_all(&payload)?;
        file.flush()?;
        file.get_ref().sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

pub(crate) fn read_index(path: &Path) -> Result<PersistedIndex> {
    let mut reader = BufReader::new(File::open(path)?);

    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(Error::Corrupt("bad magic".into()));
    }
    let version = reader.read_u8()?;
    if version != VERSION {
        return Err(Error::Corrupt(format!("unsupported version {version}")));
    }
    let stored_crc = reader.read_u32::<LittleEndian>()?;
    let len = reader.read_u64::<LittleEndian>()?;
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;

    let mut hasher = Hasher::new();
    hasher.update(&payload);
    if hasher.finalize() != stored_crc {
        return Err(Error::Corrupt("crc mismatch".into()));
    }

    let mut cursor = Cursor::new(payload);
    let dim = cursor.read_u32::<LittleEndian>()? as usize;
    if dim == 0 {
        return Err(Error::Corrupt("zero dim".into()));
    }
    let brute_threshold = cursor.read_u64::<LittleEndian>()? as usize;
    let index_id = cursor.read_u64::<LittleEndian>()?;

    let rows = cursor.read_u64::<LittleEndian>()? as usize;
    let mut vids = Vec::with_capacity(rows);
    for _ in 0..rows {
        vids.push(cursor.read_u64::<LittleEndian>()?);
    }
    let mut vectors = Vec::with_capacity(rows * dim);
    for _ in 0..rows * dim {
        vectors.push(cursor.read_f32::<LittleEndian>()?);
    }

    let trained = match cursor.read_u8()? {
        0 => None,
        1 => {
            let nlist = cursor.read_u64::<LittleEndian>()? as usize;
            let indexed_len = cursor.read_u64::<LittleEndian>()? as usize;
            if indexed_len > rows {
                return Err(Error::Corrupt("indexed_len beyond dataset".into()));
            }
            let mut centroids = Vec::with_capacity(nlist * dim);
            for _ in 0..nlist * dim {
                centroids.push(cursor.read_f32::<LittleEndian>()?);
            }
            let mut lists = Vec::with_capacity(nlist);
            for _ in 0..nlist {
                let list_len = cursor.read_u64::<LittleEndian>()? as usize;
                let mut list = Vec::with_capacity(list_len);
                for _ in 0..list_len {
                    let row = cursor.read_u32::<LittleEndian>()?;
                    if row as usize >= rows {
                        return Err(Error::Corrupt("list row beyond dataset".into()));
                    }
                    list.push(row);
                }
                lists.push(list);
            }
            Some(Trained {
                nlist,
                centroids,
                lists,
                indexed_len,
            })
        }
        other => return Err(Error::Corrupt(format!("bad trained marker {other}"))),
    };

    Ok(PersistedIndex {
        dim,
        brute_threshold,
        index_id,
        data: DataSet { vectors, vids },
        trained,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_untrained() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(INDEX_FILE);
        let data = DataSet {
            vectors: vec![1.0, 2.0, 3.0, 4.0],
            vids: vec![10, 11],
        };
        write_index(&path, 2, 4096, 7, &data, None).unwrap();

        let persisted = read_index(&path).unwrap();
        assert_eq!(persisted.dim, 2);
        assert_eq!(persisted.index_id, 7);
        assert_eq!(persisted.data.vids, vec![10, 11]);
        assert_eq!(persisted.data.vectors, vec![1.0, 2.0, 3.0, 4.0]);
        assert!(persisted.trained.is_none());
    }

    #[test]
    fn round_trip_trained() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(INDEX_FILE);
        let data = DataSet {
            vectors: vec![1.0, 0.0, 0.0, 1.0],
            vids: vec![0, 1],
        };
        let trained = Trained {
            nlist: 2,
            centroids: vec![1.0, 0.0, 0.0, 1.0],
            lists: vec![vec![0], vec![1]],
            indexed_len: 2,
        };
        write_index(&path, 2, 1, 3, &data, Some(&trained)).unwrap();

        let persisted = read_index(&path).unwrap();
        let restored = persisted.trained.unwrap();
        assert_eq!(restored.nlist, 2);
        assert_eq!(restored.indexed_len, 2);
        assert_eq!(restored.lists, vec![vec![0], vec![1]]);
    }

    #[test]
    fn corruption_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(INDEX_FILE);
        let data = DataSet {
            vectors: vec![0.5; 8],
            vids: vec![1, 2, 3, 4],
        };
        write_index(&path, 2, 0, 0, &data, None).unwrap();

        let mut raw = std::fs::read(&path).unwrap();
        let flip = raw.len() - 3;
        raw[flip] = raw[flip].wrapping_add(1);
        std::fs::write(&path, &raw).unwrap();

        assert!(matches!(read_index(&path), Err(Error::Corrupt(_))));
    }
}
