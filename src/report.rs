//! # Reporting
//!
//! The persisted JSON report (§6) and the per-run records the scheduler
//! (C7) and driver/worker contexts (C9) build up as tests execute.

use crate::test::{Status, TestDescriptor};
use crate::tracker::ResourceSnapshot;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use std::time::Duration;

/// A single worker's contribution to a distributed test's record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerReport {
    pub worker_id: u32,
    pub status: Status,
    pub resources: ResourceSnapshot,
    pub errors: Vec<String>,
    pub worker_body_ns: u64,
}

/// Durations for each phase a test may run through. Any phase the test
/// kind doesn't use stays at zero.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct PhaseDurations {
    pub init_ns: u64,
    pub body_ns: u64,
    pub complete_ns: u64,
    pub baseline_ns: u64,
    pub worker_body_ns: u64,
}

/// One test's full run record, as it is both kept in memory and streamed
/// into the JSON report.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestReport {
    pub module: String,
    pub name: String,
    pub index: usize,
    pub dependencies: Vec<String>,
    pub status: Status,
    pub success: bool,
    pub resources: ResourceSnapshot,
    pub errors: Vec<String>,
    pub durations: PhaseDurations,
    pub stdout: String,
    pub stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<Vec<WorkerReport>>,
}

impl TestReport {
    pub fn skipped(test: &TestDescriptor) -> Self {
        TestReport {
            module: test.module.clone(),
            name: test.name.clone(),
            index: 0,
            dependencies: test.dependencies.iter().cloned().collect(),
            status: Status::Skip,
            success: true,
            resources: ResourceSnapshot::default(),
            errors: Vec::new(),
            durations: PhaseDurations::default(),
            stdout: String::new(),
            stderr: String::new(),
            workers: None,
        }
    }

    pub fn new(test: &TestDescriptor, status: Status, resources: ResourceSnapshot, errors: Vec<String>, durations: PhaseDurations, stdout: Vec<u8>, stderr: Vec<u8>) -> Self {
        let success = status == test.expected;
        TestReport {
            module: test.module.clone(),
            name: test.name.clone(),
            index: 0,
            dependencies: test.dependencies.iter().cloned().collect(),
            status,
            success,
            resources,
            errors,
            durations,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            workers: None,
        }
    }

    pub fn with_workers(mut self, workers: Vec<WorkerReport>) -> Self {
        self.workers = Some(workers);
        self
    }
}

/// Top-level summary counts for the persisted report.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Summary {
    pub total: usize,
    pub nominal: usize,
    pub unexpected: usize,
}

#[derive(Serialize)]
struct PersistedReport<'a> {
    config: serde_json::Value,
    tests: &'a [TestReport],
    summary: Summary,
}

/// Accumulates per-test records as the scheduler runs and writes the final
/// JSON report. Streaming is intentionally simple: the whole in-memory
/// vector is (re)serialized on `finalize`, since the engine runs tests
/// sequentially and reports are expected to be of modest size (hundreds,
/// not millions, of tests).
pub struct ResultsManager {
    output_path: std::path::PathBuf,
    config: serde_json::Value,
    records: Vec<TestReport>,
}

impl ResultsManager {
    pub fn new(output_path: impl AsRef<Path>, config: serde_json::Value) -> Self {
        ResultsManager { output_path: output_path.as_ref().to_path_buf(), config, records: Vec::new() }
    }

    pub fn add_record(&mut self, mut record: TestReport) {
        record.index = self.records.len();
        record.errors.iter().for_each(|e| tracing::debug!(error = %e, "test error recorded"));
        self.records.push(record);
    }

    pub fn summary(&self) -> Summary {
        let total = self.records.len();
        let unexpected = self.records.iter().filter(|r| !r.success).count();
        Summary { total, nominal: total - unexpected, unexpected }
    }

    pub fn finalize(&self) -> anyhow::Result<()> {
        let report = PersistedReport { config: self.config.clone(), tests: &self.records, summary: self.summary() };
        let json = serde_json::to_string_pretty(&report)?;
        let mut file = std::fs::File::create(&self.output_path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }

    /// A colorized one-line-per-test summary for stdout, in the spirit of
    /// the teacher's `ColorizedFormatter`-driven console output.
    pub fn print_summary(&self) {
        use colored::Colorize;
        for r in &self.records {
            let line = format!("[{}] {}::{} ({})", r.status.as_report_str(), r.module, r.name, crate::utils::format_duration_ns(r.durations.body_ns));
            if r.success {
                println!("{}", line.green());
            } else {
                println!("{}", line.red());
            }
        }
        let summary = self.summary();
        println!("{} total, {} nominal, {} unexpected", summary.total, summary.nominal, summary.unexpected);
    }
}

pub fn duration_to_ns(d: Duration) -> u64 {
    d.as_nanos().min(u64::MAX as u128) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::TestBuilder;

    #[test]
    fn skipped_report_is_always_a_success() {
        let descriptor = TestBuilder::unit("mod_a", "t1", || Ok(())).build();
        let report = TestReport::skipped(&descriptor);
        assert_eq!(report.status, Status::Skip);
        assert!(report.success);
    }

    #[test]
    fn summary_counts_unexpected_statuses() {
        let mut manager = ResultsManager::new(std::env::temp_dir().join("dtest-rs-test-report.json"), serde_json::json!({}));
        let descriptor = TestBuilder::unit("mod_a", "t1", || Ok(())).build();
        let pass = TestReport::new(&descriptor, Status::Pass, ResourceSnapshot::default(), vec![], PhaseDurations::default(), vec![], vec![]);
        let fail = TestReport::new(&descriptor, Status::Fail, ResourceSnapshot::default(), vec![], PhaseDurations::default(), vec![], vec![]);
        manager.add_record(pass);
        manager.add_record(fail);
        let summary = manager.summary();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.unexpected, 1);
    }
}
