//! Static partitioning of subject ids across workers
//!
//! Two topologies are supported. Independent processes each receive a [Partition::Node]
//! descriptor at launch and write to a shard named after their process id. A single process
//! given [Partition::Jobs] with several workers splits its slice into contiguous chunks, runs them
//! on a rayon pool, each chunk writing to its own shard, and merges all shards once the pool is
//! done. A lone worker on a lone node writes straight to the primary store.

use std::ops::Range;
use std::time::Instant;

use eyre::{eyre, Result, WrapErr};
use rayon::prelude::*;
use rusqlite::types::Value;

use crate::routines::optimization::FitError;
use crate::routines::store::{quote, Query, ShardId, Store, WriteMode};

/// Which part of the id space a run owns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    /// Node `node` of `total` independent processes
    Node { node: usize, total: usize },
    /// Slots `start..start + workers` of `total`, run by a pool of `workers` threads
    Jobs {
        start: usize,
        total: usize,
        workers: usize,
    },
}

impl Default for Partition {
    fn default() -> Self {
        Partition::Jobs {
            start: 0,
            total: 1,
            workers: 1,
        }
    }
}

impl Partition {
    /// `(start, total, workers)`, a node owns a single slot
    pub fn descriptor(&self) -> (usize, usize, usize) {
        match *self {
            Partition::Node { node, total } => (node, total, 1),
            Partition::Jobs {
                start,
                total,
                workers,
            } => (start, total, workers),
        }
    }

    pub fn workers(&self) -> usize {
        self.descriptor().2
    }

    pub fn validate(&self) -> Result<(), FitError> {
        let (start, total, workers) = self.descriptor();
        if total == 0 || workers == 0 {
            return Err(FitError::Config(format!(
                "partition needs at least one slot and one worker, got total={} workers={}",
                total, workers
            )));
        }
        if start >= total {
            return Err(FitError::Config(format!(
                "partition start {} is out of range for {} slots",
                start, total
            )));
        }
        Ok(())
    }

    /// Indices of the `n` sorted ids owned by this partition
    pub fn range(&self, n: usize) -> Range<usize> {
        let (start, total, workers) = self.descriptor();
        let lo = (start * n / total).min(n);
        let hi = ((start + workers) * n / total).min(n);
        lo..hi
    }

    /// Whether results can be written to the primary store directly
    pub fn is_sole(&self) -> bool {
        self.descriptor() == (0, 1, 1)
    }
}

/// Contiguous chunks of `ids`, one per worker
pub fn chunks<T>(ids: &[T], workers: usize) -> Vec<&[T]> {
    if ids.is_empty() {
        return Vec::new();
    }
    let size = ids.len().div_ceil(workers.max(1));
    ids.chunks(size).collect()
}

/// Progress reports every `checkpoint` items with an estimate of the remaining time
///
/// The estimate is only repeated when the time per item moved by 10% or more.
pub struct Progress {
    start: Instant,
    total: usize,
    checkpoint: usize,
    per_item: f64,
}

impl Progress {
    pub fn new(total: usize, checkpoint: usize) -> Self {
        Self {
            start: Instant::now(),
            total,
            checkpoint: checkpoint.max(1),
            per_item: -1.0,
        }
    }

    pub fn tick(&mut self, done: usize) {
        if done == 0 || done % self.checkpoint != 0 {
            return;
        }
        let per_item = self.start.elapsed().as_secs_f64() / done as f64;
        if done == self.checkpoint || ((per_item - self.per_item) / self.per_item).abs() >= 0.1
        {
            self.per_item = per_item;
            let remaining = per_item * (self.total - done) as f64 / 60.0;
            tracing::info!("Should be finished in {:.3} mins", remaining);
        }
        tracing::info!("Completed {}/{}", done, self.total);
    }
}

/// Work applied to a slice of subject ids
pub trait Job: Sync {
    fn name(&self) -> &str;
    fn source_table(&self) -> &str;
    /// Id column of the source table, also carried by every output row
    fn id_column(&self) -> &str;
    fn output_table(&self) -> &str;
    /// Process the rows of `ids`, reading from `source` and writing to `sink`
    ///
    /// Returns the number of rows written.
    fn run(&self, source: &Store, sink: &Store, ids: &[Value]) -> Result<usize>;
}

/// Runs a [Job] over one partition of a store
pub struct Coordinator {
    store: Store,
    partition: Partition,
}

impl Coordinator {
    pub fn new(store: Store, partition: Partition) -> Self {
        Self { store, partition }
    }

    /// Sorted distinct ids of the job's source table
    pub fn ids(&self, job: &dyn Job) -> Result<Vec<Value>> {
        let rows = self.store.execute(&[Query::new(format!(
            "SELECT DISTINCT {id} FROM {table} ORDER BY {id}",
            id = quote(job.id_column()),
            table = quote(job.source_table())
        ))])?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.into_iter().next())
            .filter(|id| *id != Value::Null)
            .collect())
    }

    pub fn run(&self, job: &dyn Job, mode: WriteMode) -> Result<usize> {
        self.partition.validate()?;
        if !self.store.table_exists(job.source_table())? {
            return Err(FitError::Config(format!(
                "{} has no table {}",
                self.store.path().display(),
                job.source_table()
            ))
            .into());
        }
        let columns = self.store.columns(job.source_table())?;
        if !columns.iter().any(|c| c == job.id_column()) {
            return Err(FitError::Config(format!(
                "table {} has no id column {}",
                job.source_table(),
                job.id_column()
            ))
            .into());
        }

        let (start, total, workers) = self.partition.descriptor();
        tracing::info!(
            "Starting {} job {} out of {} with {} workers",
            job.name(),
            start,
            total,
            workers
        );

        let ids = self.ids(job)?;
        let range = self.partition.range(ids.len());
        tracing::debug!(
            "{} distinct ids in {}, this partition owns [{}, {})",
            ids.len(),
            job.source_table(),
            range.start,
            range.end
        );
        let ids = &ids[range];
        tracing::info!(
            "Reading from {} and writing to {}, {} ids to process",
            job.source_table(),
            job.output_table(),
            ids.len()
        );

        if mode == WriteMode::Replace {
            self.clear(job, ids)?;
        }

        let written = if self.partition.is_sole() {
            job.run(&self.store, &self.store, ids)?
        } else if workers == 1 {
            let shard = self.store.shard(ShardId::Process);
            shard.discard()?;
            let written = job.run(&self.store, &shard, ids)?;
            self.merge(&shard, job)?;
            written
        } else {
            self.run_pool(job, ids, workers)?
        };

        tracing::info!(
            "Completed {} job, {} rows written to {}",
            job.name(),
            written,
            job.output_table()
        );
        Ok(written)
    }

    /// Removes earlier outputs of this partition before it is rerun
    ///
    /// A sole partition owns the whole output table. Any other partition only owns the rows of
    /// its id range, the rest may already hold results merged by its peers.
    fn clear(&self, job: &dyn Job, ids: &[Value]) -> Result<()> {
        let table = quote(job.output_table());
        if self.partition.is_sole() {
            self.store
                .execute(&[Query::new(format!("DROP TABLE IF EXISTS {}", table))])?;
            return Ok(());
        }
        let (Some(first), Some(last)) = (ids.first(), ids.last()) else {
            return Ok(());
        };
        if !self.store.table_exists(job.output_table())? {
            return Ok(());
        }
        tracing::debug!(
            "Deleting earlier rows of ids {:?}..={:?} from {}",
            first,
            last,
            job.output_table()
        );
        self.store.execute(&[Query::new(format!(
            "DELETE FROM {} WHERE {} BETWEEN ?1 AND ?2",
            table,
            quote(job.id_column())
        ))
        .bind(first.clone())
        .bind(last.clone())])?;
        Ok(())
    }

    fn run_pool(&self, job: &dyn Job, ids: &[Value], workers: usize) -> Result<usize> {
        let chunks = chunks(ids, workers);
        if let Some(first) = chunks.first() {
            tracing::info!("{} ids per worker", first.len());
        }
        let shards: Vec<Store> = (0..chunks.len())
            .map(|i| self.store.shard(ShardId::Worker(i)))
            .collect();
        for shard in &shards {
            shard.discard()?;
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()
            .map_err(|e| eyre!("Unable to start {} workers: {}", workers, e))?;
        let results: Vec<Result<usize>> = pool.install(|| {
            chunks
                .par_iter()
                .zip(shards.par_iter())
                .enumerate()
                .map(|(i, (chunk, shard))| {
                    let span = tracing::info_span!("", worker = i);
                    let _enter = span.enter();
                    job.run(&self.store, shard, chunk)
                        .wrap_err_with(|| format!("Worker {} failed", i))
                })
                .collect()
        });

        // Shards of a failed pool are left behind and discarded by the next run
        let mut written = 0;
        for result in results {
            written += result?;
        }
        for shard in &shards {
            self.merge(shard, job)?;
        }
        Ok(written)
    }

    fn merge(&self, shard: &Store, job: &dyn Job) -> Result<()> {
        if !shard.path().exists() {
            tracing::debug!("Worker wrote nothing to {}", shard.path().display());
            return Ok(());
        }
        tracing::debug!(
            "Adding database {} to {}",
            shard.path().display(),
            self.store.path().display()
        );
        self.store
            .merge(shard, job.output_table())
            .wrap_err_with(|| format!("Unable to merge {} into {}", job.output_table(), self.store.path().display()))?;
        Ok(())
    }
}
