//! The in-process ANN engine.
//!
//! Vectors live in a flat f32 dataset alongside their 64-bit ids. Training
//! partitions the dataset with k-means into `nlist` inverted lists; below
//! the brute threshold the "trained" index is an exhaustive scan. Scores
//! are inner products, descending; a negative score slot terminates a
//! query's result list, which is how the fixed nq×topk result buffer
//! signals short lists.

use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use rand::seq::index::sample;
use rand::thread_rng;
use rayon::prelude::*;
use serde::Serialize;
use tracing::debug;

use vectra_core::{Error, Result};

use crate::persistence;

pub const DEFAULT_BRUTE_THRESHOLD: usize = 4096;

const KMEANS_ITERATIONS: usize = 10;
const TRAIN_SAMPLE_RATE: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexStatus {
    None,
    NoInit,
    NoIndex,
    Ready,
    Add,
    Train,
    Dump,
    Unknown,
}

impl IndexStatus {
    pub fn searchable(self) -> bool {
        matches!(self, IndexStatus::Ready | IndexStatus::Add | IndexStatus::Dump)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub dataset_size: u64,
    pub vid_size: u64,
    pub index_size: u64,
    pub nlist: u32,
    pub dim: u32,
    pub brute_threshold: u64,
    pub is_brute: bool,
    pub status: IndexStatus,
}

/// Engine construction parameters. A zero `brute_threshold` selects the
/// default.
#[derive(Debug, Clone, Copy)]
pub struct IndexConfig {
    pub dim: usize,
    pub brute_threshold: usize,
}

impl IndexConfig {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            brute_threshold: 0,
        }
    }
}

/// One slot of the fixed search result buffer.
#[derive(Debug, Clone, Copy)]
pub struct SearchHit {
    pub vid: u64,
    pub score: f32,
}

pub(crate) struct DataSet {
    pub vectors: Vec<f32>,
    pub vids: Vec<u64>,
}

impl DataSet {
    fn rows(&self) -> usize {
        self.vids.len()
    }
}

pub(crate) struct Trained {
    /// 0 for the brute-force structure.
    pub nlist: usize,
    pub centroids: Vec<f32>,
    pub lists: Vec<Vec<u32>>,
    /// Dataset rows covered by this structure.
    pub indexed_len: usize,
}

pub(crate) struct Engine {
    dim: usize,
    brute_threshold: usize,
    index_id: u64,
    work_dir: PathBuf,
    data: RwLock<DataSet>,
    trained: RwLock<Option<Trained>>,
    status: RwLock<IndexStatus>,
}

impl Engine {
    /// Open the engine against `work_dir`, restoring any persisted state.
    pub fn open(work_dir: &Path, config: IndexConfig, index_id: u64) -> Result<Self> {
        if config.dim == 0 {
            return Err(Error::InvalidInput("index dim must be positive".into()));
        }
        std::fs::create_dir_all(work_dir)?;

        let brute_threshold = if config.brute_threshold == 0 {
            DEFAULT_BRUTE_THRESHOLD
        } else {
            config.brute_threshold
        };

        let index_file = work_dir.join(persistence::INDEX_FILE);
        if index_file.exists() {
            let persisted = persistence::read_index(&index_file)?;
            if persisted.dim != config.dim {
                return Err(Error::Corrupt(format!(
                    "persisted dim {} does not match configured dim {}",
                    persisted.dim, config.dim
                )));
            }
            let status = if persisted.trained.is_some() {
                IndexStatus::Ready
            } else if persisted.data.rows() > 0 {
                IndexStatus::Add
            } else {
                IndexStatus::NoIndex
            };
            debug!(
                index_id,
                rows = persisted.data.rows(),
                trained = persisted.trained.is_some(),
                "restored index"
            );
            return Ok(Self {
                dim: persisted.dim,
                brute_threshold: persisted.brute_threshold,
                index_id,
                work_dir: work_dir.to_path_buf(),
                data: RwLock::new(persisted.data),
                trained: RwLock::new(persisted.trained),
                status: RwLock::new(status),
            });
        }

        Ok(Self {
            dim: config.dim,
            brute_threshold,
            index_id,
            work_dir: work_dir.to_path_buf(),
            data: RwLock::new(DataSet {
                vectors: Vec::new(),
                vids: Vec::new(),
            }),
            trained: RwLock::new(None),
            status: RwLock::new(IndexStatus::NoIndex),
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn add(&self, vectors: &[f32], vids: &[u64]) -> Result<()> {
        if vids.is_empty() {
            return Ok(());
        }
        if vectors.len() != vids.len() * self.dim {
            return Err(Error::InvalidInput(format!(
                "vector buffer length {} does not match {} vids of dim {}",
                vectors.len(),
                vids.len(),
                self.dim
            )));
        }
        let mut data = self.data.write();
        data.vectors.extend_from_slice(vectors);
        data.vids.extend_from_slice(vids);
        drop(data);
        *self.status.write() = IndexStatus::Add;
        Ok(())
    }

    /// Search `queries` (concatenated, `len % dim == 0`) and fill a fixed
    /// `nq × topk` buffer; unfilled slots keep a negative sentinel score.
    pub fn search(
        &self,
        queries: &[f32],
        topk: usize,
        nprobe: usize,
        reorder: usize,
    ) -> Result<Vec<SearchHit>> {
        if queries.is_empty() || queries.len() % self.dim != 0 || topk == 0 {
            return Err(Error::InvalidInput("bad query buffer".into()));
        }
        let trained = self.trained.read();
        let Some(trained) = trained.as_ref() else {
            return Err(Error::IndexNotReady);
        };
        let data = self.data.read();

        let nq = queries.len() / self.dim;
        let mut buffer = vec![
            SearchHit {
                vid: 0,
                score: -1.0,
            };
            nq * topk
        ];

        for (qi, query) in queries.chunks_exact(self.dim).enumerate() {
            let mut candidates = self.gather_candidates(query, trained, &data, nprobe);
            candidates.sort_unstable_by(|a, b| b.score.total_cmp(&a.score));
            candidates.truncate(topk.max(reorder));
            for (slot, hit) in buffer[qi * topk..(qi + 1) * topk]
                .iter_mut()
                .zip(candidates.iter().take(topk))
            {
                *slot = *hit;
            }
        }
        Ok(buffer)
    }

    fn gather_candidates(
        &self,
        query: &[f32],
        trained: &Trained,
        data: &DataSet,
        nprobe: usize,
    ) -> Vec<SearchHit> {
        let row = |i: usize| &data.vectors[i * self.dim..(i + 1) * self.dim];

        if trained.nlist == 0 {
            // Brute structure: exhaustive scan of the whole dataset, so
            // rows added after training are still visible.
            return (0..data.rows())
                .map(|i| SearchHit {
                    vid: data.vids[i],
                    score: dot(query, row(i)),
                })
                .collect();
        }

        let mut by_centroid: Vec<(f32, usize)> = trained
            .centroids
            .chunks_exact(self.dim)
            .enumerate()
            .map(|(ci, c)| (l2_sq(query, c), ci))
            .collect();
        by_centroid.sort_unstable_by(|a, b| a.0.total_cmp(&b.0));

        let mut hits = Vec::new();
        for &(_, ci) in by_centroid.iter().take(nprobe.max(1)) {
            for &i in &trained.lists[ci] {
                let i = i as usize;
                hits.push(SearchHit {
                    vid: data.vids[i],
                    score: dot(query, row(i)),
                });
            }
        }
        hits
    }

    /// Build (or rebuild) the partition structure over the current dataset
    /// and persist the result. `n_threads == 0` uses all cores.
    pub fn train(&self, n_threads: usize) -> Result<()> {
        let (snapshot, rows) = {
            let data = self.data.read();
            (data.vectors.clone(), data.rows())
        };
        if rows == 0 {
            return Err(Error::DatasetEmpty);
        }
        let index_size = self.trained.read().as_ref().map_or(0, |t| t.indexed_len);
        if rows == index_size {
            return Err(Error::NothingToTrain);
        }

        *self.status.write() = IndexStatus::Train;
        let trained = if rows <= self.brute_threshold {
            Trained {
                nlist: 0,
                centroids: Vec::new(),
                lists: Vec::new(),
                indexed_len: rows,
            }
        } else {
            match self.kmeans(&snapshot, rows, n_threads) {
                Ok(t) => t,
                Err(e) => {
                    *self.status.write() = IndexStatus::Unknown;
                    return Err(e);
                }
            }
        };
        debug!(
            index_id = self.index_id,
            rows,
            nlist = trained.nlist,
            "trained index"
        );
        *self.trained.write() = Some(trained);

        // Training always ends with a dump so the child process leaves a
        // complete index behind.
        self.dump()?;
        Ok(())
    }

    fn kmeans(&self, vectors: &[f32], rows: usize, n_threads: usize) -> Result<Trained> {
        let dim = self.dim;
        let nlist = nearest_power_of_two((rows as f64).sqrt().ceil() as usize);

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(n_threads)
            .build()
            .map_err(|e| Error::Corrupt(format!("train pool: {e}")))?;

        let sample_size = (((rows as f64) * TRAIN_SAMPLE_RATE) as usize).max(nlist).min(rows);
        let mut rng = thread_rng();
        let sample_rows: Vec<usize> = sample(&mut rng, rows, sample_size).into_vec();

        let mut centroids: Vec<f32> = sample(&mut rng, rows, nlist)
            .into_iter()
            .flat_map(|i| vectors[i * dim..(i + 1) * dim].to_vec())
            .collect();

        pool.install(|| {
            for _ in 0..KMEANS_ITERATIONS {
                let assignments: Vec<usize> = sample_rows
                    .par_iter()
                    .map(|&i| nearest_centroid(&vectors[i * dim..(i + 1) * dim], &centroids, dim))
                    .collect();

                let mut sums = vec![0.0f64; nlist * dim];
                let mut counts = vec![0usize; nlist];
                for (&i, &c) in sample_rows.iter().zip(assignments.iter()) {
                    counts[c] += 1;
                    for (d, &v) in vectors[i * dim..(i + 1) * dim].iter().enumerate() {
                        sums[c * dim + d] += f64::from(v);
                    }
                }
                for c in 0..nlist {
                    if counts[c] == 0 {
                        continue;
                    }
                    for d in 0..dim {
                        centroids[c * dim + d] = (sums[c * dim + d] / counts[c] as f64) as f32;
                    }
                }
            }

            let assignments: Vec<usize> = (0..rows)
                .into_par_iter()
                .map(|i| nearest_centroid(&vectors[i * dim..(i + 1) * dim], &centroids, dim))
                .collect();
            let mut lists: Vec<Vec<u32>> = vec![Vec::new(); nlist];
            for (i, &c) in assignments.iter().enumerate() {
                lists[c].push(i as u32);
            }
            Ok(Trained {
                nlist,
                centroids,
                lists,
                indexed_len: rows,
            })
        })
    }

    /// Persist the current engine state to the work dir.
    pub fn dump(&self) -> Result<()> {
        let prev = *self.status.read();
        *self.status.write() = IndexStatus::Dump;
        let result = {
            let data = self.data.read();
            let trained = self.trained.read();
            persistence::write_index(
                &self.work_dir.join(persistence::INDEX_FILE),
                self.dim,
                self.brute_threshold,
                self.index_id,
                &data,
                trained.as_ref(),
            )
        };
        *self.status.write() = match result {
            Ok(()) if self.trained.read().is_some() => IndexStatus::Ready,
            Ok(()) => prev,
            Err(_) => IndexStatus::Unknown,
        };
        result
    }

    pub fn stats(&self) -> IndexStats {
        let data = self.data.read();
        let trained = self.trained.read();
        let index_size = trained.as_ref().map_or(0, |t| t.indexed_len);
        IndexStats {
            dataset_size: data.rows() as u64,
            vid_size: data.vids.len() as u64,
            index_size: index_size as u64,
            nlist: trained.as_ref().map_or(0, |t| t.nlist) as u32,
            dim: self.dim as u32,
            brute_threshold: self.brute_threshold as u64,
            is_brute: trained.as_ref().is_some_and(|t| t.nlist == 0),
            status: *self.status.read(),
        }
    }

    pub fn searchable(&self) -> bool {
        let stats = self.stats();
        stats.index_size > 0 && stats.status.searchable()
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn l2_sq(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

fn nearest_centroid(v: &[f32], centroids: &[f32], dim: usize) -> usize {
    let mut best = 0;
    let mut best_dist = f32::INFINITY;
    for (ci, c) in centroids.chunks_exact(dim).enumerate() {
        let d = l2_sq(v, c);
        if d < best_dist {
            best_dist = d;
            best = ci;
        }
    }
    best
}

fn nearest_power_of_two(n: usize) -> usize {
    n.max(1).next_power_of_two()
}
