// src/merge.rs

use std::path::{Path, PathBuf};

use indexmap::IndexMap;

use crate::assignment::{ChangeTally, KrakenAssignments};
use crate::errors::KrakenMergeError;
use crate::report::KrakenReport;

/// Text of a file's basename before the literal substring `kraken`. The two
/// files of one run share this stem (`SampleA.kraken_report.txt` and
/// `SampleA.kraken_assignments.tsv` both give `SampleA.`).
pub fn file_stem_before_kraken(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    match name.find("kraken") {
        Some(idx) => name[..idx].to_string(),
        None => name,
    }
}

/// Validates that a ledger and a report describe the same classifier run.
///
/// A stem mismatch between the two file names is always fatal. The per-taxon
/// unique counts implied by the ledger are then compared against the
/// report's `ucount`s in both directions; mismatches are logged as warnings
/// and, when `strict` is set, turned into a consistency error.
pub fn check_pair(
    assignments: &KrakenAssignments,
    report: &KrakenReport,
    strict: bool,
) -> Result<(), KrakenMergeError> {
    let assignment_stem = file_stem_before_kraken(&assignments.file_name);
    let report_stem = report
        .file_name
        .as_deref()
        .map(file_stem_before_kraken)
        .unwrap_or_default();
    if assignment_stem != report_stem {
        return Err(KrakenMergeError::Consistency(format!(
            "found report stem {report_stem:?} and assignment stem {assignment_stem:?} from files {:?} and {:?}",
            report.file_name, assignments.file_name
        )));
    }

    let mut counts: IndexMap<String, u64> = IndexMap::new();
    for entry in assignments.entries.values() {
        *counts.entry(entry.taxon_id.clone()).or_insert(0) += 1;
    }

    let mut mismatches = 0usize;
    for (taxon_id, entry) in &report.entries {
        let ledger_count = counts.shift_remove(taxon_id).unwrap_or(0);
        if ledger_count != entry.ucount {
            mismatches += 1;
            log::warn!(
                "Taxon id {} has {} counts in report and {} counts in assignment file",
                taxon_id,
                entry.ucount,
                ledger_count
            );
        }
    }
    for (taxon_id, ledger_count) in &counts {
        mismatches += 1;
        log::warn!(
            "Taxon id {} has 0 counts in report and {} counts in assignment file",
            taxon_id,
            ledger_count
        );
    }

    if strict && mismatches > 0 {
        return Err(KrakenMergeError::Consistency(format!(
            "assignment file {:?} and report {:?} disagree on {} taxon counts",
            assignments.file_name, report.file_name, mismatches
        )));
    }
    Ok(())
}

/// Loads one (ledger, report) pair and reports count mismatches as warnings
/// without failing on them. The standalone diagnostic counterpart of the
/// strict check the merge performs.
pub fn check_pair_files(
    assignment_file: &Path,
    report_file: &Path,
) -> Result<(), KrakenMergeError> {
    let assignments = KrakenAssignments::load(assignment_file)?;
    let report = KrakenReport::load(report_file)?;
    check_pair(&assignments, &report, false)
}

/// Merges N (ledger, report) pairs into one consistent pair of artifacts.
///
/// Files pair up by position and input order defines precedence, later pairs
/// overriding earlier ones per read. Each pair is validated strictly, its
/// ledger folded into the accumulator, and the resulting change tally
/// replayed onto the accumulated report, which is mutated rather than
/// recounted. Both artifacts are persisted after every pair so an aborted
/// run leaves the last consistent state behind.
pub fn merge(
    assignment_files: &[PathBuf],
    report_files: &[PathBuf],
    out_prefix: &str,
) -> Result<(), KrakenMergeError> {
    if assignment_files.len() != report_files.len() {
        return Err(KrakenMergeError::Consistency(format!(
            "{} assignment files cannot pair with {} report files",
            assignment_files.len(),
            report_files.len()
        )));
    }

    let out_assignments = PathBuf::from(format!("{out_prefix}.kraken_assignments.tsv"));
    let out_report = PathBuf::from(format!("{out_prefix}.kraken_report.txt"));
    log::info!("Initialize merged assignments and merged report");
    let mut merged_assignments = KrakenAssignments::new(&out_assignments);
    let mut merged_report = KrakenReport::new();

    for (assignment_file, report_file) in assignment_files.iter().zip(report_files.iter()) {
        log::info!(
            "Update with pair {} and {}",
            assignment_file.display(),
            report_file.display()
        );
        let assignments = KrakenAssignments::load(assignment_file)?;
        let report = KrakenReport::load(report_file)?;
        check_pair(&assignments, &report, true)?;

        let changes = merged_assignments.update(&assignments);
        merged_report.update(&report, &changes)?;
        merged_assignments.save()?;
        merged_report.save(&out_report)?;
    }

    log::info!(
        "Save results to {} and {}",
        out_assignments.display(),
        out_report.display()
    );
    merged_assignments.save()?;
    merged_report.save(&out_report)?;
    Ok(())
}

/// Folds every ledger in order with the same later-wins rule, without any
/// report bookkeeping, and returns the cumulative change tally.
pub fn merge_all_assignments(
    assignment_files: &[PathBuf],
    output_file: &Path,
) -> Result<ChangeTally, KrakenMergeError> {
    let mut merged = KrakenAssignments::new(output_file);
    let mut changes = ChangeTally::new();
    for assignment_file in assignment_files {
        let assignments = KrakenAssignments::load(assignment_file)?;
        changes.absorb(merged.update(&assignments));
    }
    merged.save()?;
    Ok(changes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const SAMPLE_A_ASSIGN: &str = "\
U\tread_0\t0\t100\t0:66
C\tread_1\t81077\t100\t81077:66
C\tread_2\t129875\t100\t129875:66
C\tread_3\t1\t100\t1:66
C\tread_4\t1\t100\t1:66
U\tread_5\t0\t100\t0:66
U\tread_6\t0\t100\t0:66
";

    const SAMPLE_A_REPORT: &str = " 42.86\t3\t3\tU\t0\tunclassified
 57.14\t4\t2\tR\t1\troot
 14.29\t1\t0\tR1\t28384\t  other sequences
 14.29\t1\t1\tS\t81077\t    artificial sequences
 14.29\t1\t0\tD\t10239\t  Viruses
 14.29\t1\t0\tF\t10508\t    Adenoviridae
 14.29\t1\t1\tS\t129875\t      Human mastadenovirus A
";

    const SAMPLE_B_ASSIGN: &str = "\
C\tread_0\t129875\t100\t129875:66
U\tread_1\t0\t100\t0:66
C\tread_2\t129875\t100\t129875:66
C\tread_3\t1\t100\t1:66
C\tread_4\t1\t100\t1:66
C\tread_5\t10508\t100\t10508:66
U\tread_6\t0\t100\t0:66
";

    const SAMPLE_B_REPORT: &str = " 28.57\t2\t2\tU\t0\tunclassified
 71.43\t5\t2\tR\t1\troot
 42.86\t3\t0\tD\t10239\t  Viruses
 42.86\t3\t1\tF\t10508\t    Adenoviridae
 28.57\t2\t2\tS\t129875\t      Human mastadenovirus A
";

    const MERGED_AB_REPORT: &str = " 28.57\t2\t2\tU\t0\tunclassified
 71.43\t5\t2\tR\t1\troot
  0.00\t0\t0\tR1\t28384\t  other sequences
  0.00\t0\t0\tS\t81077\t    artificial sequences
 42.86\t3\t0\tD\t10239\t  Viruses
 42.86\t3\t1\tF\t10508\t    Adenoviridae
 28.57\t2\t2\tS\t129875\t      Human mastadenovirus A
";

    const MERGED_BA_REPORT: &str = " 42.86\t3\t3\tU\t0\tunclassified
 57.14\t4\t2\tR\t1\troot
 14.29\t1\t0\tD\t10239\t  Viruses
 14.29\t1\t0\tF\t10508\t    Adenoviridae
 14.29\t1\t1\tS\t129875\t      Human mastadenovirus A
 14.29\t1\t0\tR1\t28384\t  other sequences
 14.29\t1\t1\tS\t81077\t    artificial sequences
";

    struct Fixture {
        dir: tempfile::TempDir,
        assign_a: PathBuf,
        report_a: PathBuf,
        assign_b: PathBuf,
        report_b: PathBuf,
    }

    fn write_fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let assign_a = dir.path().join("SampleA.kraken_assignments.tsv");
        let report_a = dir.path().join("SampleA.kraken_report.txt");
        let assign_b = dir.path().join("SampleB.kraken_assignments.tsv");
        let report_b = dir.path().join("SampleB.kraken_report.txt");
        fs::write(&assign_a, SAMPLE_A_ASSIGN).unwrap();
        fs::write(&report_a, SAMPLE_A_REPORT).unwrap();
        fs::write(&assign_b, SAMPLE_B_ASSIGN).unwrap();
        fs::write(&report_b, SAMPLE_B_REPORT).unwrap();
        Fixture {
            dir,
            assign_a,
            report_a,
            assign_b,
            report_b,
        }
    }

    #[test]
    fn stem_before_kraken() {
        assert_eq!(
            file_stem_before_kraken(Path::new("data/SampleA.kraken_report.txt")),
            "SampleA."
        );
        assert_eq!(
            file_stem_before_kraken(Path::new("SampleA.kraken_assignments.tsv")),
            "SampleA."
        );
        assert_eq!(file_stem_before_kraken(Path::new("data/notes.txt")), "notes.txt");
    }

    #[test]
    fn check_pair_accepts_consistent_pair() {
        let fx = write_fixture();
        let assignments = KrakenAssignments::load(&fx.assign_a).unwrap();
        let report = KrakenReport::load(&fx.report_a).unwrap();
        check_pair(&assignments, &report, true).unwrap();
        check_pair_files(&fx.assign_a, &fx.report_a).unwrap();
    }

    #[test]
    fn check_pair_rejects_stem_mismatch() {
        let fx = write_fixture();
        let assignments = KrakenAssignments::load(&fx.assign_a).unwrap();
        let report = KrakenReport::load(&fx.report_b).unwrap();
        let err = check_pair(&assignments, &report, false).unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn check_pair_count_mismatch_is_fatal_only_when_strict() {
        let fx = write_fixture();
        // Same stem, but the report no longer accounts for the artificial
        // sequence read.
        let broken = SAMPLE_A_REPORT.replace(
            " 14.29\t1\t1\tS\t81077",
            " 14.29\t1\t0\tS\t81077",
        );
        let report_path = fx.dir.path().join("sub").join("SampleA.kraken_report.txt");
        fs::create_dir(report_path.parent().unwrap()).unwrap();
        fs::write(&report_path, broken).unwrap();

        let assignments = KrakenAssignments::load(&fx.assign_a).unwrap();
        let report = KrakenReport::load(&report_path).unwrap();
        check_pair(&assignments, &report, false).unwrap();
        let err = check_pair(&assignments, &report, true).unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn merge_later_pair_takes_precedence() {
        let fx = write_fixture();
        let out_prefix = fx.dir.path().join("merged");
        merge(
            &[fx.assign_a.clone(), fx.assign_b.clone()],
            &[fx.report_a.clone(), fx.report_b.clone()],
            out_prefix.to_str().unwrap(),
        )
        .unwrap();

        let merged_assign =
            fs::read_to_string(fx.dir.path().join("merged.kraken_assignments.tsv")).unwrap();
        let merged_report =
            fs::read_to_string(fx.dir.path().join("merged.kraken_report.txt")).unwrap();
        // Every read agrees with the later pair; taxa only the first run
        // used remain as zero-count husks.
        assert_eq!(merged_assign, SAMPLE_B_ASSIGN);
        assert_eq!(merged_report, MERGED_AB_REPORT);

        let merged = KrakenReport::load(fx.dir.path().join("merged.kraken_report.txt")).unwrap();
        assert_eq!(merged.total, 7);
        assert_eq!(merged.classified, 5);
        assert_eq!(merged.unclassified, 2);
    }

    #[test]
    fn merge_inverted_precedence_restores_first_run() {
        let fx = write_fixture();
        let out_prefix = fx.dir.path().join("merged_inverted");
        merge(
            &[fx.assign_b.clone(), fx.assign_a.clone()],
            &[fx.report_b.clone(), fx.report_a.clone()],
            out_prefix.to_str().unwrap(),
        )
        .unwrap();

        let merged_assign =
            fs::read_to_string(fx.dir.path().join("merged_inverted.kraken_assignments.tsv"))
                .unwrap();
        let merged_report =
            fs::read_to_string(fx.dir.path().join("merged_inverted.kraken_report.txt")).unwrap();
        assert_eq!(merged_assign, SAMPLE_A_ASSIGN);
        assert_eq!(merged_report, MERGED_BA_REPORT);
    }

    #[test]
    fn merge_with_identical_pairs_is_stable() {
        let fx = write_fixture();
        let out_prefix = fx.dir.path().join("twice");
        merge(
            &[fx.assign_a.clone(), fx.assign_a.clone()],
            &[fx.report_a.clone(), fx.report_a.clone()],
            out_prefix.to_str().unwrap(),
        )
        .unwrap();

        let merged_assign =
            fs::read_to_string(fx.dir.path().join("twice.kraken_assignments.tsv")).unwrap();
        let merged_report =
            fs::read_to_string(fx.dir.path().join("twice.kraken_report.txt")).unwrap();
        assert_eq!(merged_assign, SAMPLE_A_ASSIGN);
        assert_eq!(merged_report, SAMPLE_A_REPORT);
    }

    #[test]
    fn merge_rejects_unpaired_inputs() {
        let fx = write_fixture();
        let err = merge(
            &[fx.assign_a.clone(), fx.assign_b.clone()],
            &[fx.report_a.clone()],
            "nope",
        )
        .unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn merge_all_assignments_accumulates_changes() {
        let fx = write_fixture();
        let output = fx.dir.path().join("combined.kraken_assignments.tsv");
        let changes =
            merge_all_assignments(&[fx.assign_a.clone(), fx.assign_b.clone()], &output).unwrap();

        // First file inserts all seven reads, second reassigns three.
        assert_eq!(changes.get("0", "0"), 3);
        assert_eq!(changes.get("0", "81077"), 1);
        assert_eq!(changes.get("0", "129875"), 2);
        assert_eq!(changes.get("0", "1"), 2);
        assert_eq!(changes.get("81077", "0"), 1);
        assert_eq!(changes.get("0", "10508"), 1);

        assert_eq!(fs::read_to_string(&output).unwrap(), SAMPLE_B_ASSIGN);
    }
}
