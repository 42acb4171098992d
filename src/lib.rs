// src/lib.rs

//! Reconciles the outputs of several taxonomic-classifier runs over the same
//! sample into one consistent result.
//!
//! Each run leaves two linked artifacts behind: a per-read assignment ledger
//! (`C|U`, read id, taxon id, length, k-mer evidence) and a hierarchical
//! report (clade/unique counts over the NCBI taxonomy tree, depth encoded by
//! name indentation). [`merge::merge`] folds N such pairs in input order,
//! later pairs taking per-read precedence, keeping the ledger and the report
//! mutually consistent by replaying the ledger's change tally onto the
//! report tree instead of recounting it.
//!
//! [`taxonomy::Taxonomy`] answers ancestor queries against a reference
//! taxonomy dump and is independent of the merge itself.

pub mod assignment;
pub mod errors;
pub mod merge;
pub mod report;
pub mod taxonomy;

pub use crate::assignment::{
    ChangeTally, ClassificationStatus, KrakenAssignmentEntry, KrakenAssignments, TaxonChange,
};
pub use crate::errors::KrakenMergeError;
pub use crate::merge::{check_pair, check_pair_files, merge, merge_all_assignments};
pub use crate::report::{KrakenEntry, KrakenReport, SourceTargetRecord};
pub use crate::taxonomy::{TaxonEntry, Taxonomy};
