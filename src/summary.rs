//! End-of-run reporting: one entry per attempted partition plus
//! per-group totals.

use std::collections::BTreeMap;

use cdnarchive_config::MergeStrategy;
use cdnarchive_core::{DateKey, Partition};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::commit::CommitOutcome;
use crate::error::PipelineError;
use crate::merge::MergeOutcome;
use crate::probe::ProbeStats;
use crate::runner::RunnerReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionStatus {
    Committed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct PartitionReport {
    pub source: String,
    pub date_key: DateKey,
    pub status: PartitionStatus,
    pub objects: usize,
    pub files_ok: usize,
    pub files_failed: usize,
    pub files_incomplete: usize,
    pub malformed_lines: u64,
    /// Unique lines in the archive.
    pub records: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge_strategy: Option<MergeStrategy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PartitionReport {
    /// Starts out failed; only [`PartitionReport::committed`] flips it.
    pub fn new(partition: &Partition) -> Self {
        Self {
            source: partition.source.clone(),
            date_key: partition.date_key,
            status: PartitionStatus::Failed,
            objects: 0,
            files_ok: 0,
            files_failed: 0,
            files_incomplete: 0,
            malformed_lines: 0,
            records: 0,
            merge_strategy: None,
            archive_path: None,
            failed_stage: None,
            error: None,
        }
    }

    pub fn fetched(&mut self, objects: usize) {
        self.objects = objects;
    }

    pub fn classified(&mut self, runner: &RunnerReport) {
        self.files_ok = runner.succeeded();
        self.files_failed = runner.failed();
        self.files_incomplete = runner.incomplete();
        self.malformed_lines = runner.totals().malformed;
    }

    pub fn merged(&mut self, merge: &MergeOutcome) {
        self.records = merge.lines_out;
        self.merge_strategy = Some(merge.strategy);
    }

    pub fn committed(&mut self, commit: CommitOutcome) {
        self.status = PartitionStatus::Committed;
        self.archive_path = Some(commit.archive_path);
    }

    pub fn fail(&mut self, error: &PipelineError) {
        self.status = PartitionStatus::Failed;
        self.failed_stage = Some(error.stage());
        self.error = Some(error.to_string());
    }

    /// Committed, but some files did not make it into the archive.
    pub fn is_partial(&self) -> bool {
        self.status == PartitionStatus::Committed
            && (self.files_failed > 0 || self.files_incomplete > 0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GroupSummary {
    pub source: String,
    pub committed: usize,
    pub partial: usize,
    pub failed: usize,
    pub records: u64,
    pub malformed_lines: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub partitions: Vec<PartitionReport>,
    /// Set when a failure stopped the run before every pending partition
    /// was attempted.
    pub halted: bool,
    pub probe: ProbeStats,
}

impl RunSummary {
    pub fn push(&mut self, report: PartitionReport) {
        self.partitions.push(report);
    }

    pub fn committed(&self) -> usize {
        self.count(PartitionStatus::Committed)
    }

    pub fn failed(&self) -> usize {
        self.count(PartitionStatus::Failed)
    }

    fn count(&self, status: PartitionStatus) -> usize {
        self.partitions.iter().filter(|p| p.status == status).count()
    }

    pub fn is_success(&self) -> bool {
        !self.halted && self.failed() == 0
    }

    /// Totals per source group, ordered by group name.
    pub fn groups(&self) -> Vec<GroupSummary> {
        let mut groups: BTreeMap<&str, GroupSummary> = BTreeMap::new();
        for report in &self.partitions {
            let group = groups
                .entry(report.source.as_str())
                .or_insert_with(|| GroupSummary {
                    source: report.source.clone(),
                    ..GroupSummary::default()
                });
            match report.status {
                PartitionStatus::Committed => {
                    group.committed += 1;
                    group.records += report.records;
                    if report.is_partial() {
                        group.partial += 1;
                    }
                }
                PartitionStatus::Failed => group.failed += 1,
            }
            group.malformed_lines += report.malformed_lines;
        }
        groups.into_values().collect()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        #[derive(Serialize)]
        struct Document<'a> {
            #[serde(flatten)]
            summary: &'a RunSummary,
            groups: Vec<GroupSummary>,
        }
        serde_json::to_string_pretty(&Document {
            summary: self,
            groups: self.groups(),
        })
    }

    pub fn log(&self) {
        for group in self.groups() {
            info!(
                source = %group.source,
                committed = group.committed,
                partial = group.partial,
                failed = group.failed,
                records = group.records,
                malformed_lines = group.malformed_lines,
                "Source group summary"
            );
        }
        for report in self.partitions.iter().filter(|p| p.status == PartitionStatus::Failed) {
            warn!(
                source = %report.source,
                date_key = %report.date_key,
                stage = report.failed_stage.unwrap_or("unknown"),
                error = report.error.as_deref().unwrap_or(""),
                "Partition not archived"
            );
        }

        if self.halted {
            error!(
                committed = self.committed(),
                failed = self.failed(),
                "Run halted before all pending partitions were attempted"
            );
        } else {
            info!(
                committed = self.committed(),
                failed = self.failed(),
                probe_invocations = self.probe.invocations,
                remote_existing = self.probe.existing,
                "Run finished"
            );
        }
    }
}
