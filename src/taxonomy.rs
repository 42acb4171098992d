// src/taxonomy.rs

use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use ahash::{AHashMap, AHashSet};

use crate::errors::KrakenMergeError;

pub type ParentMap = AHashMap<String, String>;
pub type ChildrenMap = AHashMap<String, AHashSet<String>>;
pub type RankMap = AHashMap<String, String>;

/// One taxon of the reference taxonomy. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaxonEntry {
    pub taxon_id: String,
    pub name: String,
    pub rank: String,
}

impl Default for TaxonEntry {
    fn default() -> Self {
        Self {
            taxon_id: "0".to_string(),
            name: "unclassified".to_string(),
            rank: "U".to_string(),
        }
    }
}

impl TaxonEntry {
    pub fn new(taxon_id: &str, name: &str, rank: &str) -> Self {
        Self {
            taxon_id: taxon_id.to_string(),
            name: name.to_string(),
            rank: rank.to_string(),
        }
    }
}

impl fmt::Display for TaxonEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{},{},{}", self.taxon_id, self.name, self.rank)
    }
}

/// Lookup structure over an NCBI-style taxonomy dump directory
/// (`nodes.dmp` and `names.dmp`).
///
/// `parents` covers the entire reference tree and `children` every internal
/// node; `entries` carries names and ranks only for a requested subset of
/// ids plus the ancestors needed to root them. Read-only after loading.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Taxonomy {
    pub entries: AHashMap<String, TaxonEntry>,
    pub parents: ParentMap,
    pub children: ChildrenMap,
}

impl Taxonomy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the full parent/child structure, and entry metadata for
    /// `taxon_ids` when any are requested.
    pub fn load<P: AsRef<Path>>(
        taxonomy_dir: P,
        taxon_ids: &[String],
    ) -> Result<Self, KrakenMergeError> {
        let dir = taxonomy_dir.as_ref();
        let mut taxonomy = Self::new();
        taxonomy.load_parents_and_children(dir)?;
        taxonomy.load_entries_from_nodes(dir, taxon_ids)?;
        taxonomy.load_entries_from_names(dir, taxon_ids)?;
        Ok(taxonomy)
    }

    /// Parses `nodes.dmp` into the global `parents` map and a `children`
    /// map holding every node that has at least one child.
    pub fn load_parents_and_children(&mut self, taxonomy_dir: &Path) -> Result<(), KrakenMergeError> {
        let path = taxonomy_dir.join("nodes.dmp");
        let reader = open_taxonomy_file(&path)?;
        for line in reader.lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let fields = split_dmp_line(&line);
            if fields.len() < 3 || fields[0].is_empty() {
                return Err(KrakenMergeError::TaxonomyCorruptFile {
                    file: path,
                    reason: format!("unparsable nodes row {line:?}"),
                });
            }
            let taxon_id = fields[0].to_string();
            let parent_id = fields[1].to_string();
            if parent_id != taxon_id {
                self.children
                    .entry(parent_id.clone())
                    .or_default()
                    .insert(taxon_id.clone());
            }
            self.parents.insert(taxon_id, parent_id);
        }
        log::debug!(
            "Loaded {} taxa ({} internal) from {}",
            self.parents.len(),
            self.children.len(),
            path.display()
        );
        Ok(())
    }

    /// Creates entries (with ranks) for `taxon_ids` and every ancestor
    /// between them and the root. A no-op when no ids are requested.
    pub fn load_entries_from_nodes(
        &mut self,
        taxonomy_dir: &Path,
        taxon_ids: &[String],
    ) -> Result<(), KrakenMergeError> {
        if taxon_ids.is_empty() {
            return Ok(());
        }
        let path = taxonomy_dir.join("nodes.dmp");
        let reader = open_taxonomy_file(&path)?;

        let mut parents: ParentMap = ParentMap::default();
        let mut ranks: RankMap = RankMap::default();
        for line in reader.lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let fields = split_dmp_line(&line);
            if fields.len() < 3 || fields[0].is_empty() {
                return Err(KrakenMergeError::TaxonomyCorruptFile {
                    file: path,
                    reason: format!("unparsable nodes row {line:?}"),
                });
            }
            parents.insert(fields[0].to_string(), fields[1].to_string());
            ranks.insert(fields[0].to_string(), fields[2].to_string());
        }

        for taxon_id in taxon_ids {
            let mut current = taxon_id.clone();
            loop {
                if !self.entries.contains_key(&current) {
                    let rank = ranks.get(&current).cloned().unwrap_or_default();
                    self.entries
                        .insert(current.clone(), TaxonEntry::new(&current, "", &rank));
                }
                match parents.get(&current) {
                    Some(parent) if *parent != current => current = parent.clone(),
                    _ => break,
                }
            }
        }
        Ok(())
    }

    /// Fills in scientific names for the loaded entries from `names.dmp`.
    /// A no-op when no ids are requested.
    pub fn load_entries_from_names(
        &mut self,
        taxonomy_dir: &Path,
        taxon_ids: &[String],
    ) -> Result<(), KrakenMergeError> {
        if taxon_ids.is_empty() {
            return Ok(());
        }
        let path = taxonomy_dir.join("names.dmp");
        let reader = open_taxonomy_file(&path)?;
        for line in reader.lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let fields = split_dmp_line(&line);
            if fields.len() < 4 {
                return Err(KrakenMergeError::TaxonomyCorruptFile {
                    file: path,
                    reason: format!("unparsable names row {line:?}"),
                });
            }
            if fields[3] != "scientific name" {
                continue;
            }
            if let Some(entry) = self.entries.get_mut(fields[0]) {
                entry.name = fields[1].to_string();
            }
        }
        Ok(())
    }

    /// For every taxon reachable as a descendant of any landmark, the set of
    /// landmark ids that are its ancestors (itself included when it is a
    /// landmark; landmarks may be nested). With `include_unclassified`, the
    /// unclassified id `0` maps to all landmarks, since an unclassified read
    /// cannot disambiguate between them.
    pub fn get_taxon_id_map(
        &self,
        landmarks: &[String],
        include_unclassified: bool,
    ) -> AHashMap<String, AHashSet<String>> {
        let mut map: AHashMap<String, AHashSet<String>> = AHashMap::new();
        for landmark in landmarks {
            let mut stack = vec![landmark.clone()];
            let mut seen: AHashSet<String> = AHashSet::new();
            while let Some(taxon_id) = stack.pop() {
                if !seen.insert(taxon_id.clone()) {
                    continue;
                }
                if let Some(kids) = self.children.get(&taxon_id) {
                    stack.extend(kids.iter().cloned());
                }
                map.entry(taxon_id).or_default().insert(landmark.clone());
            }
        }
        if include_unclassified {
            map.entry("0".to_string())
                .or_default()
                .extend(landmarks.iter().cloned());
        }
        map
    }
}

fn open_taxonomy_file(path: &Path) -> Result<BufReader<File>, KrakenMergeError> {
    match File::open(path) {
        Ok(file) => Ok(BufReader::new(file)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            Err(KrakenMergeError::TaxonomyMissingFile {
                file: path.to_path_buf(),
            })
        }
        Err(err) => Err(KrakenMergeError::Io(err)),
    }
}

/// Splits one `.dmp` row on its `\t|\t` separators, dropping the trailing
/// `\t|` terminator.
fn split_dmp_line(line: &str) -> Vec<&str> {
    let line = line.strip_suffix("\t|").unwrap_or(line);
    line.split("\t|\t").collect()
}
