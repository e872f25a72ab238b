//! Purpose: Provide a stable, serializable validation report model for datasets.
//! Exports: `ValidationReport`, `ValidationStatus`, `ValidationIssue`, `validate_dataset`.
//! Role: Full integrity walk behind `colpage verify` and API users.
//! Invariants: Reports are additive-only; every issue names its column and, when known, cluster/page.
//! Invariants: Validation never mutates the store; it only populates and releases pages.

use std::collections::HashMap;

use serde::Serialize;

use crate::core::descriptor::ColumnType;
use crate::core::element::{ClusterSize, Element};
use crate::core::error::Error;
use crate::core::sink::ColumnHandle;
use crate::core::source::{PageLocator, PageSource};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationStatus {
    Ok,
    Corrupt,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ValidationIssue {
    pub code: String,
    pub message: String,
    pub column: Option<u32>,
    pub cluster: Option<u64>,
    pub page: Option<u64>,
}

impl ValidationIssue {
    fn at(code: &str, message: impl Into<String>, column: u32, locator: &PageLocator) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            column: Some(column),
            cluster: Some(locator.cluster_id),
            page: Some(locator.page_in_cluster),
        }
    }

    pub fn from_error(err: &Error) -> Self {
        Self {
            code: format!("{:?}", err.kind()).to_lowercase(),
            message: err.message().unwrap_or("validation failed").to_string(),
            column: err.column(),
            cluster: err.cluster(),
            page: err.page(),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ValidationReport {
    pub dataset: String,
    pub status: ValidationStatus,
    pub columns_checked: usize,
    pub pages_checked: usize,
    pub issues: Vec<ValidationIssue>,
    pub issue_count: usize,
    pub remediation_hints: Vec<String>,
}

impl ValidationReport {
    pub fn ok(dataset: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            status: ValidationStatus::Ok,
            columns_checked: 0,
            pages_checked: 0,
            issues: Vec::new(),
            issue_count: 0,
            remediation_hints: Vec::new(),
        }
    }

    pub fn corrupt(dataset: impl Into<String>, issue: ValidationIssue) -> Self {
        Self::ok(dataset).set_issues(vec![issue])
    }

    pub fn set_issues(mut self, issues: Vec<ValidationIssue>) -> Self {
        self.issue_count = issues.len();
        self.issues = issues;
        if self.issue_count == 0 {
            self.status = ValidationStatus::Ok;
            self.remediation_hints.clear();
        } else {
            self.status = ValidationStatus::Corrupt;
            self.remediation_hints = vec![
                "Dataset appears corrupt. Rewrite it from the source data.".to_string(),
            ];
        }
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == ValidationStatus::Ok
    }
}

/// Populates every page of every column and checks page tiling and offset arithmetic.
pub fn validate_dataset(source: &PageSource) -> ValidationReport {
    let mut issues = Vec::new();
    let mut pages_checked = 0usize;
    let handles: Vec<ColumnHandle> = source
        .columns()
        .filter_map(|model| source.column_handle(model.name()).ok())
        .collect();

    for handle in &handles {
        pages_checked += check_column(source, *handle, &mut issues);
    }
    for issue in &issues {
        tracing::warn!(
            dataset = source.dataset(),
            code = %issue.code,
            column = ?issue.column,
            cluster = ?issue.cluster,
            page = ?issue.page,
            "{}",
            issue.message
        );
    }

    let mut report = ValidationReport::ok(source.dataset()).set_issues(issues);
    report.columns_checked = handles.len();
    report.pages_checked = pages_checked;
    report
}

fn check_column(
    source: &PageSource,
    handle: ColumnHandle,
    issues: &mut Vec<ValidationIssue>,
) -> usize {
    let column = handle.id();
    let (Ok(locators), Ok(n_elements)) = (source.page_locators(handle), source.n_elements(handle))
    else {
        return 0;
    };
    let pointee_totals = match source.pointee(handle) {
        Ok(Some(pointee)) => Some(cluster_totals(source, pointee)),
        _ => None,
    };

    let mut expected_start = 0u64;
    let mut previous_cluster = None;
    let mut offsets = OffsetWalk::default();
    let mut checked = 0usize;
    for locator in locators {
        if locator.range_start != expected_start {
            issues.push(ValidationIssue::at(
                "page_gap",
                format!(
                    "page starts at {} but previous page ended at {expected_start}",
                    locator.range_start
                ),
                column,
                locator,
            ));
        }
        expected_start = locator.range_end();
        if previous_cluster.is_some_and(|previous| locator.cluster_id < previous) {
            issues.push(ValidationIssue::at(
                "cluster_order",
                "pages are not ordered by cluster",
                column,
                locator,
            ));
        }
        if previous_cluster != Some(locator.cluster_id) {
            if let (Some(totals), Some(cluster)) = (&pointee_totals, previous_cluster) {
                offsets.finish_cluster(cluster, totals, column, issues);
            }
            offsets = OffsetWalk::default();
        }
        previous_cluster = Some(locator.cluster_id);

        let page = match source.populate_page(handle, locator.range_start) {
            Ok(page) => page,
            Err(err) => {
                issues.push(ValidationIssue::from_error(&err));
                continue;
            }
        };
        checked += 1;
        if page.n_elements() as u64 != locator.n_elements {
            issues.push(ValidationIssue::at(
                "page_size",
                format!(
                    "page holds {} elements, index expects {}",
                    page.n_elements(),
                    locator.n_elements
                ),
                column,
                locator,
            ));
        }
        if handle.column_type() == ColumnType::Index && pointee_totals.is_some() {
            for bytes in page.bytes().chunks_exact(ClusterSize::SIZE) {
                let value = u64::from(ClusterSize::deserialize(bytes));
                let previous = offsets.last;
                if !offsets.push(value) {
                    issues.push(ValidationIssue::at(
                        "offset_order",
                        format!("offset {value} is below its predecessor {previous}"),
                        column,
                        locator,
                    ));
                }
            }
            offsets.locator = Some(*locator);
        }
        source.release_page(page);
    }
    if let (Some(totals), Some(cluster)) = (&pointee_totals, previous_cluster) {
        offsets.finish_cluster(cluster, totals, column, issues);
    }
    if expected_start != n_elements {
        issues.push(ValidationIssue {
            code: "page_gap".to_string(),
            message: format!("pages cover {expected_start} of {n_elements} elements"),
            column: Some(column),
            cluster: None,
            page: None,
        });
    }
    checked
}

#[derive(Debug, Default)]
struct OffsetWalk {
    last: u64,
    seen: bool,
    locator: Option<PageLocator>,
}

impl OffsetWalk {
    fn push(&mut self, value: u64) -> bool {
        let ordered = !self.seen || value >= self.last;
        self.seen = true;
        self.last = value;
        ordered
    }

    /// Last offset of a cluster must count every pointee element in that cluster.
    fn finish_cluster(
        &self,
        cluster: u64,
        totals: &HashMap<u64, u64>,
        column: u32,
        issues: &mut Vec<ValidationIssue>,
    ) {
        let (true, Some(locator)) = (self.seen, self.locator.as_ref()) else {
            return;
        };
        let expected = totals.get(&cluster).copied().unwrap_or(0);
        if self.last != expected {
            issues.push(ValidationIssue::at(
                "offset_total",
                format!(
                    "last offset {} but the pointee holds {expected} elements in cluster {cluster}",
                    self.last
                ),
                column,
                locator,
            ));
        }
    }
}

fn cluster_totals(source: &PageSource, pointee: u32) -> HashMap<u64, u64> {
    let mut totals = HashMap::new();
    let handle = source
        .columns()
        .nth(pointee as usize)
        .and_then(|model| source.column_handle(model.name()).ok());
    let Some(locators) = handle.and_then(|handle| source.page_locators(handle).ok()) else {
        return totals;
    };
    for locator in locators {
        *totals.entry(locator.cluster_id).or_insert(0) += locator.n_elements;
    }
    totals
}
