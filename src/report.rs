// src/report.rs

use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use ahash::{AHashMap, AHashSet};
use indexmap::map::Entry;
use indexmap::{IndexMap, IndexSet};

use crate::assignment::ChangeTally;
use crate::errors::KrakenMergeError;

/// Rank codes that appear as standalone levels in flattened exports. Other
/// codes (`R1`, `C1`, ...) are intermediate scaffolding and collapse onto
/// their nearest canonical ancestor.
const CANONICAL_RANKS: [&str; 12] = [
    "K", "D", "D1", "D2", "P", "C", "O", "F", "G", "S", "S1", "S2",
];

/// Taxa that attach directly below the tree scaffolding (root, cellular
/// organisms) or the unclassified bucket are excluded from sibling ranking.
const ATTACHMENT_POINTS: [&str; 2] = ["1", "131567"];

/// One taxon of a kraken report tree.
///
/// `count` is the inclusive clade count (this taxon plus all descendants),
/// `ucount` the reads assigned exactly here. `hierarchy` lists the ancestor
/// taxon ids from the root down to, but excluding, this entry, so
/// `hierarchy.len() == depth`.
#[derive(Debug, Clone, PartialEq)]
pub struct KrakenEntry {
    pub taxon_id: String,
    pub name: String,
    pub rank: String,
    pub depth: usize,
    pub count: u64,
    pub ucount: u64,
    pub domain: Option<String>,
    pub parent: Option<String>,
    pub children: IndexSet<String>,
    pub sibling_rank: u64,
    pub hierarchy: Vec<String>,
}

impl Default for KrakenEntry {
    fn default() -> Self {
        Self {
            taxon_id: "0".to_string(),
            name: "unclassified".to_string(),
            rank: "U".to_string(),
            depth: 0,
            count: 0,
            ucount: 0,
            domain: None,
            parent: None,
            children: IndexSet::new(),
            sibling_rank: 0,
            hierarchy: Vec::new(),
        }
    }
}

impl KrakenEntry {
    /// Builds an entry from a parsed report row, the running domain and the
    /// parser's ancestor stack. The stack is truncated to the entry's depth,
    /// and inverted count/ucount fields are swapped so that
    /// `count >= ucount` holds from the start.
    fn from_row(row: &ReportRow, domain: Option<&str>, hierarchy: &[String]) -> Self {
        let depth = parse_depth(&row.raw_name);
        let (mut count, mut ucount) = (row.clades, row.taxonomies);
        if count < ucount {
            std::mem::swap(&mut count, &mut ucount);
        }
        Self {
            taxon_id: row.taxon_id.clone(),
            name: row.raw_name.trim().to_string(),
            rank: row.rank.clone(),
            depth,
            count,
            ucount,
            domain: domain.map(|d| d.to_string()),
            parent: None,
            children: IndexSet::new(),
            sibling_rank: 0,
            hierarchy: hierarchy[..depth.min(hierarchy.len())].to_vec(),
        }
    }

    pub fn add_parent(&mut self, parent: &str) {
        self.parent = Some(parent.to_string());
    }

    pub fn add_child(&mut self, child: &str) {
        self.children.insert(child.to_string());
    }

    pub fn set_sibling_rank(&mut self, rank: u64) {
        self.sibling_rank = rank;
    }

    /// Refreshes this entry's name and rank from `other` and unions its
    /// children. Any structural disagreement (taxon, domain, parent, depth,
    /// hierarchy) means the two reports do not describe the same taxonomy
    /// and is a consistency error.
    pub fn update(&mut self, other: &KrakenEntry) -> Result<(), KrakenMergeError> {
        if self.taxon_id != other.taxon_id {
            return Err(KrakenMergeError::Consistency(format!(
                "cannot update taxon {} from entry for taxon {}",
                self.taxon_id, other.taxon_id
            )));
        }
        if self.domain != other.domain {
            return Err(KrakenMergeError::Consistency(format!(
                "taxon {} has domain {:?} in one report and {:?} in another",
                self.taxon_id, self.domain, other.domain
            )));
        }
        if self.parent != other.parent {
            return Err(KrakenMergeError::Consistency(format!(
                "taxon {} has parent {:?} in one report and {:?} in another",
                self.taxon_id, self.parent, other.parent
            )));
        }
        if self.depth != other.depth || self.hierarchy != other.hierarchy {
            return Err(KrakenMergeError::Consistency(format!(
                "taxon {} has conflicting hierarchies across reports",
                self.taxon_id
            )));
        }
        self.name = other.name.clone();
        self.rank = other.rank.clone();
        for child in &other.children {
            self.children.insert(child.clone());
        }
        Ok(())
    }
}

impl fmt::Display for KrakenEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{},{},{},{},{},{},{:?},{:?},{}",
            self.taxon_id,
            self.name,
            self.rank,
            self.depth,
            self.count,
            self.ucount,
            self.domain,
            self.parent,
            self.sibling_rank
        )
    }
}

/// Derives the nesting depth from the leading-space run of the name field
/// (two spaces per level).
fn parse_depth(raw_name: &str) -> usize {
    raw_name.bytes().take_while(|b| *b == b' ').count() / 2
}

/// Raw fields of one report row, before tree linkage.
struct ReportRow {
    clades: u64,
    taxonomies: u64,
    rank: String,
    taxon_id: String,
    raw_name: String,
}

impl ReportRow {
    /// Splits a report line into its fields. 6-column reports carry
    /// `%, clades, taxonomies, rank, taxon id, name`; 8-column reports add
    /// the two minimizer columns before the rank.
    fn from_line(line: &str, num_fields: usize, file: &Path) -> Result<Self, KrakenMergeError> {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != num_fields {
            return Err(KrakenMergeError::ReportFormat {
                file: file.to_path_buf(),
                reason: format!(
                    "row has {} columns where {} were expected",
                    fields.len(),
                    num_fields
                ),
            });
        }
        let (rank_idx, taxon_idx, name_idx) = if num_fields == 6 { (3, 4, 5) } else { (5, 6, 7) };
        let parse_count = |idx: usize| -> Result<u64, KrakenMergeError> {
            fields[idx]
                .trim()
                .parse::<u64>()
                .map_err(|_| KrakenMergeError::ReportFormat {
                    file: file.to_path_buf(),
                    reason: format!("count field {:?} is not numeric", fields[idx]),
                })
        };
        Ok(Self {
            clades: parse_count(1)?,
            taxonomies: parse_count(2)?,
            rank: fields[rank_idx].trim().to_string(),
            taxon_id: fields[taxon_idx].trim().to_string(),
            raw_name: fields[name_idx].trim_end().to_string(),
        })
    }
}

/// Flattened source→target edge for visualization exports.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceTargetRecord {
    pub source: String,
    pub target: String,
    pub value: u64,
    pub percentage: f64,
}

/// A kraken report for one sample: the taxon entries in file order, the
/// classified/unclassified totals and the domain roots.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KrakenReport {
    pub entries: IndexMap<String, KrakenEntry>,
    pub total: u64,
    pub classified: u64,
    pub unclassified: u64,
    pub domains: IndexMap<String, String>,
    pub file_name: Option<PathBuf>,
}

impl KrakenReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sniffs the first line of a report file: the column count must be 6 or
    /// 8, and a leading `%` marks a header row.
    fn check_report(file: &Path) -> Result<(bool, usize), KrakenMergeError> {
        let mut reader = BufReader::new(File::open(file)?);
        let mut line = String::new();
        reader.read_line(&mut line)?;
        let num_fields = line.trim_end_matches(['\n', '\r']).split('\t').count();
        if num_fields != 6 && num_fields != 8 {
            return Err(KrakenMergeError::ReportFormat {
                file: file.to_path_buf(),
                reason: "must have 6 or 8 columns".to_string(),
            });
        }
        Ok((line.starts_with('%'), num_fields))
    }

    /// Loads a report file.
    ///
    /// Rows arrive in pre-order, so the parser carries an explicit stack of
    /// ancestor ids: each row's depth says how far to unwind the stack before
    /// the new entry attaches below `stack.last()`. A row that fails to parse
    /// aborts the load with a format error.
    pub fn load<P: Into<PathBuf>>(file_name: P) -> Result<Self, KrakenMergeError> {
        let file_name = file_name.into();
        let (has_header, num_fields) = Self::check_report(&file_name)?;

        let mut report = Self::new();
        let reader = BufReader::new(File::open(&file_name)?);
        let mut hierarchy: Vec<String> = Vec::new();
        let mut domain: Option<String> = None;

        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if (idx == 0 && has_header) || line.is_empty() {
                continue;
            }
            let row = ReportRow::from_line(&line, num_fields, &file_name)?;
            if row.rank == "D" {
                let domain_name = row.raw_name.trim().to_string();
                report
                    .domains
                    .insert(domain_name.clone(), row.taxon_id.clone());
                domain = Some(domain_name);
            }
            let entry = KrakenEntry::from_row(&row, domain.as_deref(), &hierarchy);
            hierarchy = entry.hierarchy.clone();
            let taxon_id = entry.taxon_id.clone();
            report.entries.insert(taxon_id.clone(), entry);
            if let Some(parent_id) = hierarchy.last().cloned() {
                report.add_parent_child(&parent_id, &taxon_id);
            }
            if taxon_id != "0" {
                hierarchy.push(taxon_id);
            }
        }

        report.unclassified = report.entries.get("0").map(|e| e.count).unwrap_or(0);
        report.classified = report.entries.get("1").map(|e| e.count).unwrap_or(0);
        report.total = report.classified + report.unclassified;
        report.set_sibling_ranks();
        report.file_name = Some(file_name);
        log::debug!(
            "Report has {} taxon entries corresponding to {} classified and {} unclassified reads",
            report.entries.len(),
            report.classified,
            report.unclassified
        );
        Ok(report)
    }

    /// Links `child_id` below `parent_id`. Both entries must already exist;
    /// unknown ids are ignored rather than silently materialized.
    pub fn add_parent_child(&mut self, parent_id: &str, child_id: &str) {
        if let Some(child) = self.entries.get_mut(child_id) {
            child.add_parent(parent_id);
        }
        if let Some(parent) = self.entries.get_mut(parent_id) {
            parent.add_child(child_id);
        }
    }

    /// Ranks every entry among its full siblings by descending clade count.
    ///
    /// Entries attached to the scaffolding (no parent, root, cellular
    /// organisms) keep rank 0. Domain-level ranks and only children rank 1.
    /// The rank of everything else is the position of its count in the
    /// descending-sorted sibling count list, so tied counts share a rank and
    /// the next distinct count skips ahead by the number of ties.
    pub fn set_sibling_ranks(&mut self) {
        let ids: Vec<String> = self.entries.keys().cloned().collect();
        for id in ids {
            let (rank_code, parent_id) = {
                let entry = &self.entries[&id];
                if entry.sibling_rank > 0 {
                    continue;
                }
                match &entry.parent {
                    None => continue,
                    Some(p) if ATTACHMENT_POINTS.contains(&p.as_str()) => continue,
                    Some(p) => (entry.rank.clone(), p.clone()),
                }
            };

            if matches!(rank_code.as_str(), "D" | "R" | "R1") {
                self.entries[&id].set_sibling_rank(1);
                continue;
            }

            let siblings: Vec<String> = match self.entries.get(&parent_id) {
                Some(parent) => parent.children.iter().cloned().collect(),
                None => continue,
            };
            if siblings.len() == 1 {
                self.entries[&id].set_sibling_rank(1);
                continue;
            }

            let mut sorted_counts: Vec<u64> = siblings
                .iter()
                .filter_map(|s| self.entries.get(s).map(|e| e.count))
                .collect();
            sorted_counts.sort_unstable_by(|a, b| b.cmp(a));
            for sibling in siblings {
                let Some(entry) = self.entries.get_mut(&sibling) else {
                    continue;
                };
                let count = entry.count;
                let rank = sorted_counts.iter().position(|c| *c == count).unwrap_or(0) as u64 + 1;
                entry.set_sibling_rank(rank);
            }
        }
    }

    // -----------------------------------------------------------------------
    //  Export views
    // -----------------------------------------------------------------------

    /// Entries carrying the domain rank code.
    pub fn get_domains(&self) -> Vec<&KrakenEntry> {
        self.entries.values().filter(|e| e.rank == "D").collect()
    }

    /// Entries with no children.
    pub fn get_tips(&self) -> Vec<&KrakenEntry> {
        self.entries
            .values()
            .filter(|e| e.children.is_empty())
            .collect()
    }

    /// Entries at one rank code.
    pub fn get_rank_entries(&self, rank: &str) -> Vec<&KrakenEntry> {
        self.entries.values().filter(|e| e.rank == rank).collect()
    }

    /// Clade-count fraction of the classified total, or of the domain root's
    /// clade count when a domain is given. Unknown taxa and domain
    /// mismatches yield 0.0 without materializing entries.
    pub fn get_percentage(&self, taxon_id: &str, domain: Option<&str>) -> f64 {
        let Some(entry) = self.entries.get(taxon_id) else {
            return 0.0;
        };
        if let Some(d) = domain {
            if entry.domain.as_deref() != Some(d) {
                return 0.0;
            }
        }
        let denominator = match domain {
            Some(d) => self
                .domains
                .get(d)
                .and_then(|id| self.entries.get(id))
                .map(|e| e.count)
                .unwrap_or(0),
            None => self.classified,
        };
        if denominator == 0 {
            return 0.0;
        }
        entry.count as f64 / denominator as f64
    }

    /// Flattens the tree into source→target edges for visualization.
    ///
    /// Scaffolding entries (sibling rank 0) contribute no edges. With
    /// `max_rank`, entries ranked beyond it are dropped along with all their
    /// descendants. Entries at a non-canonical rank are skipped as edge
    /// targets; an edge's source is the nearest hierarchy ancestor that was
    /// not itself skipped.
    pub fn to_source_target(
        &self,
        max_rank: Option<u64>,
        domain: Option<&str>,
    ) -> Vec<SourceTargetRecord> {
        let mut records = Vec::new();
        let mut ignore: AHashSet<&str> = AHashSet::new();
        let mut skip: AHashSet<&str> = AHashSet::new();

        for (entry_id, entry) in &self.entries {
            if entry.sibling_rank == 0 {
                continue;
            }
            if let Some(d) = domain {
                if entry.domain.as_deref() != Some(d) {
                    continue;
                }
            }
            if let Some(max_rank) = max_rank {
                if entry.sibling_rank > max_rank {
                    ignore.insert(entry_id.as_str());
                    continue;
                }
                if let Some(parent) = &entry.parent {
                    if ignore.contains(parent.as_str()) {
                        ignore.insert(entry_id.as_str());
                        continue;
                    }
                }
            }
            if !CANONICAL_RANKS.contains(&entry.rank.as_str()) {
                skip.insert(entry_id.as_str());
                continue;
            }
            if entry.hierarchy.is_empty() {
                continue;
            }

            let mut index = 1;
            while index < entry.hierarchy.len()
                && skip.contains(entry.hierarchy[entry.hierarchy.len() - index].as_str())
            {
                index += 1;
            }
            let source_id = &entry.hierarchy[entry.hierarchy.len() - index];
            let source_name = self
                .entries
                .get(source_id)
                .map(|e| e.name.clone())
                .unwrap_or_else(|| source_id.clone());
            records.push(SourceTargetRecord {
                source: source_name,
                target: entry.name.clone(),
                value: entry.count,
                percentage: self.get_percentage(entry_id, domain),
            });
        }
        log::debug!(
            "Flattened {} edges ({} ignored, {} skipped)",
            records.len(),
            ignore.len(),
            skip.len()
        );
        records
    }

    /// Writes source→target edges as CSV with a header row.
    pub fn save_source_target<P: AsRef<Path>>(
        records: &[SourceTargetRecord],
        file_name: P,
    ) -> Result<(), KrakenMergeError> {
        let mut writer = BufWriter::new(File::create(file_name)?);
        writeln!(writer, "source,target,value,percentage")?;
        for record in records {
            writeln!(
                writer,
                "{},{},{},{}",
                csv_field(&record.source),
                csv_field(&record.target),
                record.value,
                record.percentage
            )?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Appends `taxon_id` and its whole subtree to `out` in pre-order,
    /// visiting children in ascending sibling-rank order; unranked children
    /// come last, ordered by id.
    pub fn add_sorted_descendants(&self, taxon_id: &str, out: &mut Vec<String>) {
        out.push(taxon_id.to_string());
        let Some(entry) = self.entries.get(taxon_id) else {
            return;
        };
        let mut kids: Vec<String> = entry.children.iter().cloned().collect();
        kids.sort_by_key(|id| {
            let rank = self.entries.get(id).map(|e| e.sibling_rank).unwrap_or(0);
            (rank == 0, rank, numeric_id_key(id), id.clone())
        });
        for kid in kids {
            self.add_sorted_descendants(&kid, out);
        }
    }

    // -----------------------------------------------------------------------
    //  Mutation
    // -----------------------------------------------------------------------

    /// Removes every zero-count entry and detaches it from its parent.
    /// A zero-count taxon that still has unique reads is inconsistent and
    /// cannot be cleaned. Calling this again is a no-op.
    pub fn clean(&mut self) -> Result<(), KrakenMergeError> {
        let zero_ids: Vec<String> = self
            .entries
            .values()
            .filter(|e| e.count == 0)
            .map(|e| e.taxon_id.clone())
            .collect();
        for id in &zero_ids {
            let entry = &self.entries[id];
            if entry.ucount != 0 {
                return Err(KrakenMergeError::Consistency(format!(
                    "taxon {} has clade count 0 but {} uniquely assigned reads",
                    id, entry.ucount
                )));
            }
            let parent = entry.parent.clone();
            self.entries.shift_remove(id);
            if let Some(parent) = parent {
                if let Some(parent_entry) = self.entries.get_mut(&parent) {
                    parent_entry.children.shift_remove(id);
                }
            }
        }
        let entries = &self.entries;
        self.domains.retain(|_, id| entries.contains_key(id));
        Ok(())
    }

    /// Fails when any host taxon's clade count exceeds its allowance.
    pub fn check_host(&self, host_counts: &AHashMap<String, u64>) -> Result<(), KrakenMergeError> {
        for (host_id, max_count) in host_counts {
            if let Some(entry) = self.entries.get(host_id) {
                if entry.count > *max_count {
                    return Err(KrakenMergeError::HostLimitExceeded {
                        taxon_id: host_id.clone(),
                        name: entry.name.clone(),
                        count: entry.count,
                        max_count: *max_count,
                    });
                }
            }
        }
        Ok(())
    }

    /// Folds another report into this one by replaying a ledger change
    /// tally, instead of recounting from scratch.
    ///
    /// An empty accumulator adopts `other` wholesale (the first pair's tally
    /// only describes reads never seen before). Otherwise taxa new to the
    /// accumulator are inserted with zeroed counts, existing taxa have their
    /// metadata refreshed, and each `(old, new, n)` record moves `n` reads:
    /// `ucount` and `count` shift at the endpoints and the inclusive `count`
    /// of every hierarchy ancestor follows.
    pub fn update(
        &mut self,
        other: &KrakenReport,
        changes: &ChangeTally,
    ) -> Result<(), KrakenMergeError> {
        if self.entries.is_empty() {
            self.entries = other.entries.clone();
            self.domains = other.domains.clone();
            self.classified = other.classified;
            self.unclassified = other.unclassified;
            self.total = other.total;
            return Ok(());
        }

        for (taxon_id, entry) in &other.entries {
            match self.entries.entry(taxon_id.clone()) {
                Entry::Occupied(mut occupied) => occupied.get_mut().update(entry)?,
                Entry::Vacant(vacant) => {
                    let mut fresh = entry.clone();
                    fresh.count = 0;
                    fresh.ucount = 0;
                    vacant.insert(fresh);
                }
            }
        }
        for (name, taxon_id) in &other.domains {
            self.domains
                .entry(name.clone())
                .or_insert_with(|| taxon_id.clone());
        }

        for change in changes.iter() {
            if change.old_taxon_id == change.new_taxon_id {
                continue;
            }
            self.shift_counts(&change.old_taxon_id, change.count, false)?;
            self.shift_counts(&change.new_taxon_id, change.count, true)?;
        }

        self.unclassified = self.entries.get("0").map(|e| e.count).unwrap_or(0);
        self.classified = self.entries.get("1").map(|e| e.count).unwrap_or(0);
        self.total = self.classified + self.unclassified;
        Ok(())
    }

    /// Moves `delta` reads onto (or off) `taxon_id`, propagating the
    /// inclusive count through every hierarchy ancestor.
    fn shift_counts(
        &mut self,
        taxon_id: &str,
        delta: u64,
        increment: bool,
    ) -> Result<(), KrakenMergeError> {
        let missing = |id: &str| {
            KrakenMergeError::Consistency(format!(
                "change tally references taxon {id} which is in no merged report"
            ))
        };
        let underflow = |id: &str| {
            KrakenMergeError::Consistency(format!(
                "removing {delta} reads from taxon {id} would make its count negative"
            ))
        };

        let hierarchy = {
            let entry = self
                .entries
                .get_mut(taxon_id)
                .ok_or_else(|| missing(taxon_id))?;
            if increment {
                entry.ucount += delta;
                entry.count += delta;
            } else {
                entry.ucount = entry
                    .ucount
                    .checked_sub(delta)
                    .ok_or_else(|| underflow(taxon_id))?;
                entry.count = entry
                    .count
                    .checked_sub(delta)
                    .ok_or_else(|| underflow(taxon_id))?;
            }
            entry.hierarchy.clone()
        };

        for ancestor in &hierarchy {
            let entry = self
                .entries
                .get_mut(ancestor)
                .ok_or_else(|| missing(ancestor))?;
            if increment {
                entry.count += delta;
            } else {
                entry.count = entry
                    .count
                    .checked_sub(delta)
                    .ok_or_else(|| underflow(ancestor))?;
            }
        }
        Ok(())
    }

    /// Writes the report as 6-column rows in entry order, so an unmodified
    /// report reproduces its input file.
    pub fn save<P: AsRef<Path>>(&self, file_name: P) -> Result<(), KrakenMergeError> {
        let mut writer = BufWriter::new(File::create(file_name)?);
        for entry in self.entries.values() {
            let pct = if self.total > 0 {
                entry.count as f64 / self.total as f64 * 100.0
            } else {
                0.0
            };
            writeln!(
                writer,
                "{:>6.2}\t{}\t{}\t{}\t{}\t{}{}",
                pct,
                entry.count,
                entry.ucount,
                entry.rank,
                entry.taxon_id,
                "  ".repeat(entry.depth),
                entry.name
            )?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Sort key treating taxon ids numerically where possible.
fn numeric_id_key(id: &str) -> u64 {
    id.parse().unwrap_or(u64::MAX)
}

fn csv_field(field: &str) -> String {
    if field.contains(',') || field.contains('"') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
