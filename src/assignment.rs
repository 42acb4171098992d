// src/assignment.rs

use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;

use ahash::AHashMap;
use flate2::read::MultiGzDecoder;
use indexmap::map::Entry;
use indexmap::IndexMap;

use crate::errors::KrakenMergeError;
use crate::taxonomy::ParentMap;

/// Classification flag of one read, rendered as `C`/`U` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassificationStatus {
    Classified,
    Unclassified,
}

impl ClassificationStatus {
    pub fn as_char(&self) -> char {
        match self {
            ClassificationStatus::Classified => 'C',
            ClassificationStatus::Unclassified => 'U',
        }
    }

    fn from_field(field: &str) -> Option<Self> {
        match field {
            "C" => Some(ClassificationStatus::Classified),
            "U" => Some(ClassificationStatus::Unclassified),
            _ => None,
        }
    }
}

impl fmt::Display for ClassificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// Strips the paired-end suffix `/1` or `/2` from a read identifier.
/// Longer suffixes (`/12`) and other separators (`.1`) are kept verbatim.
pub fn trim_read_id(read_id: &str) -> &str {
    match read_id.strip_suffix("/1").or_else(|| read_id.strip_suffix("/2")) {
        Some(stripped) => stripped,
        None => read_id,
    }
}

/// One row of a kraken per-read assignment file:
/// `C|U \t read_id \t taxon_id \t length \t kmer_string`.
///
/// The k-mer string is positional evidence and stays opaque to the merge
/// logic. Equality is structural over all five fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KrakenAssignmentEntry {
    pub classified: ClassificationStatus,
    pub read_id: String,
    pub taxon_id: String,
    pub length: usize,
    pub kmer_string: String,
}

impl Default for KrakenAssignmentEntry {
    fn default() -> Self {
        Self {
            classified: ClassificationStatus::Unclassified,
            read_id: String::new(),
            taxon_id: "0".to_string(),
            length: 0,
            kmer_string: String::new(),
        }
    }
}

impl KrakenAssignmentEntry {
    /// Parses one tab-separated assignment line.
    ///
    /// Read ids lose their `/1`/`/2` pair suffix. A non-numeric taxon field
    /// (artificial reads carry a label there) falls back to the taxon of the
    /// k-mer string's first token, e.g. `81077:619` yields `81077`.
    pub fn from_line(line: &str) -> Result<Self, KrakenMergeError> {
        let line = line.trim();
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != 5 {
            return Err(KrakenMergeError::AssignmentFormat {
                line: line.to_string(),
                reason: "must have 5 fields".to_string(),
            });
        }

        let classified = ClassificationStatus::from_field(fields[0]).ok_or_else(|| {
            KrakenMergeError::AssignmentFormat {
                line: line.to_string(),
                reason: format!("classification flag {:?} is not C or U", fields[0]),
            }
        })?;
        let read_id = trim_read_id(fields[1]).to_string();
        let kmer_string = fields[4].to_string();

        let mut taxon_id = fields[2].to_string();
        if !is_numeric_id(&taxon_id) {
            taxon_id = kmer_string
                .split(' ')
                .next()
                .and_then(|token| token.split(':').next())
                .unwrap_or("")
                .to_string();
            if !is_numeric_id(&taxon_id) {
                return Err(KrakenMergeError::AssignmentFormat {
                    line: line.to_string(),
                    reason: format!("taxon id field {:?} is not numeric", fields[2]),
                });
            }
        }

        let length = fields[3]
            .parse::<usize>()
            .map_err(|_| KrakenMergeError::AssignmentFormat {
                line: line.to_string(),
                reason: format!("length field {:?} is not numeric", fields[3]),
            })?;

        Ok(Self {
            classified,
            read_id,
            taxon_id,
            length,
            kmer_string,
        })
    }

    /// Marks the read unclassified while keeping its length and evidence.
    pub fn declassify(&mut self) {
        self.classified = ClassificationStatus::Unclassified;
        self.taxon_id = "0".to_string();
    }

    /// Renders the entry back into its tab-separated row format.
    pub fn get_line(&self) -> String {
        format!(
            "{}\t{}\t{}\t{}\t{}",
            self.classified, self.read_id, self.taxon_id, self.length, self.kmer_string
        )
    }
}

impl fmt::Display for KrakenAssignmentEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.get_line())
    }
}

fn is_numeric_id(id: &str) -> bool {
    !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit())
}

/// One `(old taxon, new taxon, delta)` record produced by a ledger merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaxonChange {
    pub old_taxon_id: String,
    pub new_taxon_id: String,
    pub count: u64,
}

/// Tally of per-read reassignments from one or more ledger merges, keyed by
/// `(old taxon, new taxon)` in first-seen order so replaying the deltas onto
/// a report is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeTally {
    records: IndexMap<(String, String), u64>,
}

impl ChangeTally {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one read moving from `old` to `new`.
    pub fn record(&mut self, old_taxon_id: &str, new_taxon_id: &str) {
        *self
            .records
            .entry((old_taxon_id.to_string(), new_taxon_id.to_string()))
            .or_insert(0) += 1;
    }

    /// Folds another tally into this one, summing overlapping records.
    pub fn absorb(&mut self, other: ChangeTally) {
        for ((old, new), count) in other.records {
            *self.records.entry((old, new)).or_insert(0) += count;
        }
    }

    /// Delta for one `(old, new)` pair, 0 when unrecorded.
    pub fn get(&self, old_taxon_id: &str, new_taxon_id: &str) -> u64 {
        self.records
            .get(&(old_taxon_id.to_string(), new_taxon_id.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = TaxonChange> + '_ {
        self.records.iter().map(|((old, new), count)| TaxonChange {
            old_taxon_id: old.clone(),
            new_taxon_id: new.clone(),
            count: *count,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

/// The per-read assignment ledger of one classifier run: read id → entry,
/// in file order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KrakenAssignments {
    pub entries: IndexMap<String, KrakenAssignmentEntry>,
    pub file_name: PathBuf,
}

impl KrakenAssignments {
    /// An unloaded ledger that knows only its target file name.
    pub fn new<P: Into<PathBuf>>(file_name: P) -> Self {
        Self {
            entries: IndexMap::new(),
            file_name: file_name.into(),
        }
    }

    /// Loads a ledger eagerly from its file.
    pub fn load<P: Into<PathBuf>>(file_name: P) -> Result<Self, KrakenMergeError> {
        let mut assignments = Self::new(file_name);
        assignments.load_entries()?;
        Ok(assignments)
    }

    /// Reads every line of `file_name` into `entries`. A trailing `.gz`
    /// switches to gzip decompression.
    pub fn load_entries(&mut self) -> Result<(), KrakenMergeError> {
        let file = File::open(&self.file_name)?;
        let is_gz = self
            .file_name
            .extension()
            .map(|ext| ext == "gz")
            .unwrap_or(false);
        let reader: Box<dyn BufRead> = if is_gz {
            Box::new(BufReader::new(MultiGzDecoder::new(file)))
        } else {
            Box::new(BufReader::new(file))
        };

        for line in reader.lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let entry = KrakenAssignmentEntry::from_line(&line)?;
            self.entries.insert(entry.read_id.clone(), entry);
        }
        log::debug!(
            "Loaded {} assignments from {}",
            self.entries.len(),
            self.file_name.display()
        );
        Ok(())
    }

    /// Writes the ledger to `file_name`, one row per entry, in the order the
    /// entry map yields (load order for an unmodified ledger).
    pub fn save(&self) -> Result<(), KrakenMergeError> {
        let file = File::create(&self.file_name)?;
        let mut writer = BufWriter::new(file);
        for entry in self.entries.values() {
            writeln!(writer, "{}", entry.get_line())?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Folds `other` into this ledger with positional precedence: a read
    /// absent from `self` is inserted (recorded as moving from taxon `0`);
    /// a read present with a different entry is replaced unconditionally,
    /// unclassified incomers included. Identical entries are left alone, so
    /// merging a ledger with itself yields an empty tally.
    pub fn update(&mut self, other: &KrakenAssignments) -> ChangeTally {
        let mut changes = ChangeTally::new();
        for (read_id, entry) in &other.entries {
            match self.entries.entry(read_id.clone()) {
                Entry::Vacant(vacant) => {
                    changes.record("0", &entry.taxon_id);
                    vacant.insert(entry.clone());
                }
                Entry::Occupied(mut occupied) => {
                    if occupied.get() != entry {
                        changes.record(&occupied.get().taxon_id, &entry.taxon_id);
                        *occupied.get_mut() = entry.clone();
                    }
                }
            }
        }
        changes
    }

    /// Maps each classified read to the most specific of the `taxon_ids`
    /// that is an ancestor of (or equal to) its assigned taxon. Without a
    /// `parents` map only exact matches qualify.
    pub fn get_read_map(
        &self,
        taxon_ids: &[String],
        parents: Option<&ParentMap>,
    ) -> AHashMap<String, String> {
        let mut read_map = AHashMap::new();
        for (read_id, entry) in &self.entries {
            let mut current = entry.taxon_id.as_str();
            loop {
                if taxon_ids.iter().any(|t| t == current) {
                    read_map.insert(read_id.clone(), current.to_string());
                    break;
                }
                match parents.and_then(|p| p.get(current)) {
                    Some(parent) if parent != current => current = parent,
                    _ => break,
                }
            }
        }
        read_map
    }
}
