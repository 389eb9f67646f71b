use crate::runner::ExecutionOutcome;
use crate::scorer::CoverageSnapshot;
use crate::seed::{SeedEntry, SeedParseError};
use crate::sequence::CallSequence;
use bincode::{
    self,
    config::{Configuration, Fixint, LittleEndian, NoLimit},
    error::{DecodeError, EncodeError},
    Decode, Encode,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CorpusError {
    #[error("Entry {0} not found in corpus or index")]
    EntryNotFound(usize),

    #[error("Corpus I/O error: {0}")]
    Io(String),

    #[error("Corpus serialization error: {0}")]
    Serialization(String),

    #[error("Corpus deserialization error: {0}")]
    Deserialization(String),

    #[error("Corrupt seed file: {0}")]
    Seed(#[from] SeedParseError),
}

impl From<std::io::Error> for CorpusError {
    fn from(err: std::io::Error) -> Self {
        CorpusError::Io(err.to_string())
    }
}
impl From<serde_json::Error> for CorpusError {
    fn from(err: serde_json::Error) -> Self {
        CorpusError::Deserialization(format!("JSON operation error: {err}"))
    }
}
impl From<EncodeError> for CorpusError {
    fn from(err: EncodeError) -> Self {
        CorpusError::Serialization(format!("Bincode encoding error: {err}"))
    }
}
impl From<DecodeError> for CorpusError {
    fn from(err: DecodeError) -> Self {
        CorpusError::Deserialization(format!("Bincode decoding error: {err}"))
    }
}

/// One accepted corpus member: the rendered seed, the structured sequence
/// it was emitted from, and how its execution ended.
#[derive(Debug, Clone, PartialEq)]
pub struct CorpusEntry {
    pub seed: SeedEntry,
    pub sequence: CallSequence,
    pub outcome: ExecutionOutcome,
}

/// Per-entry metadata persisted in the on-disk JSON index.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CorpusEntryMetadata {
    pub library: String,
    pub content_hash: String,
    pub score: f64,
}

/// Append-only store of accepted sequences.
///
/// Entries are never mutated or removed once appended; ids are stable dense
/// indices in append order. `snapshot` is the union of every entry's
/// observed branches and is what synthesis and scoring read.
pub trait Corpus: Send + Sync {
    fn append(&mut self, entry: CorpusEntry) -> Result<usize, CorpusError>;

    fn get(&mut self, id: usize) -> Result<&CorpusEntry, CorpusError>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current corpus-wide coverage. Callers clone this per batch; the
    /// corpus never hands out a live reference.
    fn snapshot(&self) -> CoverageSnapshot;

    /// True if a sequence with this content hash was already appended.
    fn contains_hash(&self, hash: &str) -> bool;
}

/// Volatile corpus for tests and short campaigns.
#[derive(Debug, Default)]
pub struct InMemoryCorpus {
    entries: Vec<CorpusEntry>,
    hashes: BTreeSet<String>,
    snapshot: CoverageSnapshot,
}

impl InMemoryCorpus {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Corpus for InMemoryCorpus {
    fn append(&mut self, entry: CorpusEntry) -> Result<usize, CorpusError> {
        let id = self.entries.len();
        self.hashes.insert(entry.sequence.content_hash());
        self.snapshot
            .merge(entry.seed.quality.unique_branches.keys().cloned());
        self.entries.push(entry);
        Ok(id)
    }

    fn get(&mut self, id: usize) -> Result<&CorpusEntry, CorpusError> {
        self.entries.get(id).ok_or(CorpusError::EntryNotFound(id))
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn snapshot(&self) -> CoverageSnapshot {
        self.snapshot.clone()
    }

    fn contains_hash(&self, hash: &str) -> bool {
        self.hashes.contains(hash)
    }
}

/// Sidecar payload stored next to each seed text file.
#[derive(Encode, Decode)]
struct SidecarRecord {
    sequence: CallSequence,
    outcome: ExecutionOutcome,
}

/// Persistent corpus: one human-readable `.c` seed per entry, a bincode
/// `.seq` sidecar with the structured sequence, and a JSON index.
///
/// Reopening the directory restores ids, hashes and the coverage snapshot
/// from the persisted seeds.
pub struct OnDiskCorpus {
    corpus_dir_path: PathBuf,
    index_file_path: PathBuf,
    stem_to_metadata: HashMap<String, CorpusEntryMetadata>,
    id_to_stem: Vec<String>,
    hashes: BTreeSet<String>,
    snapshot: CoverageSnapshot,
    // One-entry read cache, same scheme as get() callers touching the most
    // recent entry repeatedly.
    last_accessed_cache: Option<(usize, CorpusEntry)>,
    bincode_config: Configuration<LittleEndian, Fixint, NoLimit>,
}

impl OnDiskCorpus {
    const INDEX_FILENAME: &'static str = "corpus_index.json";
    const SIDECAR_EXTENSION: &'static str = "seq";

    fn bincode_config() -> Configuration<LittleEndian, Fixint, NoLimit> {
        bincode::config::standard()
            .with_little_endian()
            .with_fixed_int_encoding()
    }

    /// Opens or creates a corpus directory, restoring any persisted state.
    pub fn new(corpus_dir_path: PathBuf) -> Result<Self, CorpusError> {
        if !corpus_dir_path.exists() {
            fs::create_dir_all(&corpus_dir_path).map_err(|e| {
                CorpusError::Io(format!(
                    "Failed to create corpus directory at {corpus_dir_path:?}: {e}"
                ))
            })?;
        } else if !corpus_dir_path.is_dir() {
            return Err(CorpusError::Io(format!(
                "Corpus path {corpus_dir_path:?} exists but is not a directory"
            )));
        }

        let index_file_path = corpus_dir_path.join(Self::INDEX_FILENAME);
        let mut corpus = Self {
            corpus_dir_path,
            index_file_path,
            stem_to_metadata: HashMap::new(),
            id_to_stem: Vec::new(),
            hashes: BTreeSet::new(),
            snapshot: CoverageSnapshot::new(),
            last_accessed_cache: None,
            bincode_config: Self::bincode_config(),
        };

        corpus.load_index_from_disk()?;
        corpus.rebuild_derived_state()?;
        if !corpus.index_file_path.exists() {
            corpus.save_index_to_disk()?;
        }
        Ok(corpus)
    }

    fn seed_file_path(&self, stem: &str) -> PathBuf {
        self.corpus_dir_path.join(stem).with_extension("c")
    }

    fn sidecar_file_path(&self, stem: &str) -> PathBuf {
        self.corpus_dir_path
            .join(stem)
            .with_extension(Self::SIDECAR_EXTENSION)
    }

    fn save_index_to_disk(&self) -> Result<(), CorpusError> {
        let file = File::create(&self.index_file_path).map_err(|e| {
            CorpusError::Io(format!(
                "Failed to create index file {:?}: {e}",
                self.index_file_path
            ))
        })?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, &(&self.id_to_stem, &self.stem_to_metadata))?;
        Ok(())
    }

    fn load_index_from_disk(&mut self) -> Result<(), CorpusError> {
        if !self.index_file_path.is_file() {
            return Ok(());
        }
        let file = File::open(&self.index_file_path)?;
        if file.metadata()?.len() == 0 {
            return Ok(());
        }
        let reader = BufReader::new(file);
        let (id_to_stem, stem_to_metadata) = serde_json::from_reader(reader).map_err(|e| {
            CorpusError::Deserialization(format!(
                "Failed to parse corpus index {:?}: {e}",
                self.index_file_path
            ))
        })?;
        self.id_to_stem = id_to_stem;
        self.stem_to_metadata = stem_to_metadata;
        Ok(())
    }

    /// Reconstructs the hash set and coverage snapshot from persisted
    /// seeds after the index has been loaded.
    fn rebuild_derived_state(&mut self) -> Result<(), CorpusError> {
        for stem in &self.id_to_stem {
            let seed_text = fs::read_to_string(self.seed_file_path(stem))?;
            let seed = SeedEntry::parse(&seed_text)?;
            self.snapshot.merge(seed.quality.unique_branches.keys().cloned());
            if let Some(meta) = self.stem_to_metadata.get(stem) {
                self.hashes.insert(meta.content_hash.clone());
            }
        }
        Ok(())
    }

    fn load_entry(&self, stem: &str) -> Result<CorpusEntry, CorpusError> {
        let seed_text = fs::read_to_string(self.seed_file_path(stem))?;
        let seed = SeedEntry::parse(&seed_text)?;

        let sidecar_bytes = fs::read(self.sidecar_file_path(stem))?;
        let (record, _length): (SidecarRecord, usize) =
            bincode::decode_from_slice(&sidecar_bytes, self.bincode_config)?;

        Ok(CorpusEntry {
            seed,
            sequence: record.sequence,
            outcome: record.outcome,
        })
    }
}

impl Corpus for OnDiskCorpus {
    fn append(&mut self, entry: CorpusEntry) -> Result<usize, CorpusError> {
        let new_id = self.id_to_stem.len();
        // Zero-padded stems keep directory listings in append order.
        let stem = format!("seed_{new_id:08}");

        fs::write(self.seed_file_path(&stem), entry.seed.render())?;
        let record = SidecarRecord {
            sequence: entry.sequence.clone(),
            outcome: entry.outcome,
        };
        fs::write(
            self.sidecar_file_path(&stem),
            bincode::encode_to_vec(&record, self.bincode_config)?,
        )?;

        let content_hash = entry.sequence.content_hash();
        self.stem_to_metadata.insert(
            stem.clone(),
            CorpusEntryMetadata {
                library: entry.sequence.library.clone(),
                content_hash: content_hash.clone(),
                score: entry.seed.quality.score,
            },
        );
        self.id_to_stem.push(stem);
        self.hashes.insert(content_hash);
        self.snapshot
            .merge(entry.seed.quality.unique_branches.keys().cloned());

        self.save_index_to_disk()?;
        self.last_accessed_cache = Some((new_id, entry));
        Ok(new_id)
    }

    fn get(&mut self, id: usize) -> Result<&CorpusEntry, CorpusError> {
        let cache_hit = matches!(&self.last_accessed_cache, Some((cached_id, _)) if *cached_id == id);
        if !cache_hit {
            let stem = self
                .id_to_stem
                .get(id)
                .ok_or(CorpusError::EntryNotFound(id))?
                .clone();
            let entry = self.load_entry(&stem)?;
            self.last_accessed_cache = Some((id, entry));
        }
        match &self.last_accessed_cache {
            Some((_, entry)) => Ok(entry),
            None => Err(CorpusError::EntryNotFound(id)),
        }
    }

    fn len(&self) -> usize {
        self.id_to_stem.len()
    }

    fn snapshot(&self) -> CoverageSnapshot {
        self.snapshot.clone()
    }

    fn contains_hash(&self, hash: &str) -> bool {
        self.hashes.contains(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scorer::{score, CoverageRecord, ScoreWeights};
    use crate::surface::{builtin_surfaces, ApiSurface};
    use crate::synthesizer::{SynthesisSettings, Synthesizer};
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;
    use tempfile::tempdir;

    fn sample_entry(seed_byte: u8, id: u64) -> CorpusEntry {
        let surface: ApiSurface = builtin_surfaces()
            .into_iter()
            .find(|s| s.library == "cjson")
            .unwrap();
        let synth = Synthesizer::new(&surface, SynthesisSettings::default());
        let mut rng = ChaCha8Rng::from_seed([seed_byte; 32]);
        let sequence = synth.synthesize(&mut rng, &CoverageSnapshot::new()).unwrap();
        let branches: Vec<String> = sequence
            .distinct_descriptors()
            .iter()
            .flat_map(|&i| surface.descriptor(i).branch_ids().take(1))
            .collect();
        let record = CoverageRecord::from_trace(branches, &sequence, &surface);
        let quality = score(
            &sequence,
            &record,
            &CoverageSnapshot::new(),
            &ScoreWeights::default(),
            &surface,
        );
        let seed =
            SeedEntry::from_sequence(id, "corpus test", &sequence, quality, &surface).unwrap();
        CorpusEntry {
            seed,
            sequence,
            outcome: ExecutionOutcome::Completed,
        }
    }

    #[test]
    fn in_memory_append_get_and_snapshot() {
        let mut corpus = InMemoryCorpus::new();
        assert!(corpus.is_empty());

        let entry = sample_entry(1, 0);
        let hash = entry.sequence.content_hash();
        let branch_count = entry.seed.quality.unique_branches.len();
        let id = corpus.append(entry.clone()).unwrap();
        assert_eq!(id, 0);
        assert_eq!(corpus.len(), 1);
        assert_eq!(*corpus.get(0).unwrap(), entry);
        assert!(corpus.contains_hash(&hash));
        assert_eq!(corpus.snapshot().len(), branch_count);

        assert!(matches!(
            corpus.get(7),
            Err(CorpusError::EntryNotFound(7))
        ));
    }

    #[test]
    fn ids_are_dense_and_in_append_order() {
        let mut corpus = InMemoryCorpus::new();
        for (i, seed_byte) in [3u8, 5, 9].into_iter().enumerate() {
            let id = corpus.append(sample_entry(seed_byte, i as u64)).unwrap();
            assert_eq!(id, i);
        }
        assert_eq!(corpus.len(), 3);
    }

    #[test]
    fn on_disk_writes_seed_text_and_sidecar() {
        let dir = tempdir().unwrap();
        let mut corpus = OnDiskCorpus::new(dir.path().to_path_buf()).unwrap();

        let entry = sample_entry(2, 0);
        corpus.append(entry.clone()).unwrap();

        let seed_path = dir.path().join("seed_00000000.c");
        assert!(seed_path.exists());
        assert!(dir.path().join("seed_00000000.seq").exists());
        assert!(dir.path().join("corpus_index.json").exists());

        // The seed file is the exact rendered form.
        let text = fs::read_to_string(&seed_path).unwrap();
        assert_eq!(text, entry.seed.render());
    }

    #[test]
    fn on_disk_reload_restores_entries_hashes_and_snapshot() {
        let dir = tempdir().unwrap();
        let path = dir.path().to_path_buf();

        let first = sample_entry(4, 0);
        let second = sample_entry(8, 1);
        let hash = first.sequence.content_hash();
        let expected_snapshot_len;
        {
            let mut corpus = OnDiskCorpus::new(path.clone()).unwrap();
            corpus.append(first.clone()).unwrap();
            corpus.append(second.clone()).unwrap();
            expected_snapshot_len = corpus.snapshot().len();
        }

        let mut reloaded = OnDiskCorpus::new(path).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert!(reloaded.contains_hash(&hash));
        assert_eq!(reloaded.snapshot().len(), expected_snapshot_len);
        assert_eq!(*reloaded.get(0).unwrap(), first);
        assert_eq!(*reloaded.get(1).unwrap(), second);
    }

    #[test]
    fn on_disk_get_uses_and_refreshes_the_cache() {
        let dir = tempdir().unwrap();
        let mut corpus = OnDiskCorpus::new(dir.path().to_path_buf()).unwrap();
        let first = sample_entry(6, 0);
        let second = sample_entry(7, 1);
        corpus.append(first.clone()).unwrap();
        corpus.append(second.clone()).unwrap();

        assert_eq!(*corpus.get(0).unwrap(), first);
        assert_eq!(corpus.last_accessed_cache.as_ref().unwrap().0, 0);
        assert_eq!(*corpus.get(0).unwrap(), first);
        assert_eq!(*corpus.get(1).unwrap(), second);
        assert_eq!(corpus.last_accessed_cache.as_ref().unwrap().0, 1);
    }

    #[test]
    fn on_disk_rejects_file_path() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("plain_file");
        fs::write(&file_path, b"x").unwrap();
        let result = OnDiskCorpus::new(file_path);
        assert!(matches!(result, Err(CorpusError::Io(msg)) if msg.contains("not a directory")));
    }
}
