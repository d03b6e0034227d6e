use crate::{
    config::TrainError,
    data::{Sample, IGNORE_INDEX},
    logging::Logger,
};

/// Rows inspected before the ratio check stops sampling.
pub const SCAN_ROW_LIMIT: usize = 101;

const DEGENERATE_WARN_RATIO: f64 = 0.9;

/// Outcome of the pre-flight label scan. Training proceeds regardless; the
/// scan only warns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScanReport {
    pub degenerate: usize,
    pub usable: usize,
    /// Rows whose inspection failed; excluded from both counters.
    pub skipped: usize,
    pub warned: bool,
}

/// Checks a sample of the dataset for labels masked down to nothing but the
/// ignore sentinel, which would silently train against a zero loss.
///
/// Inspects up to the first [`SCAN_ROW_LIMIT`] rows. A row whose labels are
/// entirely the sentinel counts as degenerate; a row that fails to load is
/// skipped. Emits a warning when at least nine in ten inspected rows are
/// degenerate. A dataset that is empty, or whose first readable row carries no
/// labels, is left alone.
pub fn scan_labels<I>(rows: I, logger: &Logger) -> ScanReport
where
    I: IntoIterator<Item = Result<Sample, TrainError>>,
{
    let mut report = ScanReport::default();
    let mut saw_labeled_row = false;

    for row in rows.into_iter().take(SCAN_ROW_LIMIT) {
        let sample = match row {
            Ok(sample) => sample,
            Err(_) => {
                report.skipped += 1;
                continue;
            }
        };

        let Some(labels) = sample.labels.as_ref() else {
            if !saw_labeled_row {
                // Dataset rows carry no label field; nothing to diagnose.
                return ScanReport::default();
            }
            report.usable += 1;
            continue;
        };
        saw_labeled_row = true;

        if !labels.is_empty() && labels.iter().all(|&label| label == IGNORE_INDEX) {
            report.degenerate += 1;
        } else {
            report.usable += 1;
        }
    }

    let inspected = report.degenerate + report.usable;
    if inspected > 0 && report.degenerate as f64 / inspected as f64 >= DEGENERATE_WARN_RATIO {
        report.warned = true;
        logger.warn(
            "most sampled rows have fully masked labels; training losses will be zero. \
             Check the label masking in your dataset pipeline.",
        );
    }

    report
}
