//! Running averages and the progress lines printed during training.

use std::fmt;

/// What a meter reports in the end-of-epoch summary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Summary {
    None,
    Average,
    Sum,
    Count,
}

#[derive(Clone, Debug)]
pub struct AverageMeter {
    name: String,
    /// Minimum field width of the formatted values.
    width: usize,
    precision: usize,
    summary: Summary,
    val: f64,
    sum: f64,
    count: usize,
}

impl AverageMeter {
    pub fn new(name: impl Into<String>, width: usize, precision: usize, summary: Summary) -> Self {
        Self {
            name: name.into(),
            width,
            precision,
            summary,
            val: 0.0,
            sum: 0.0,
            count: 0,
        }
    }

    pub fn reset(&mut self) {
        self.val = 0.0;
        self.sum = 0.0;
        self.count = 0;
    }

    /// Record `val` observed over `n` samples.
    pub fn update(&mut self, val: f64, n: usize) {
        self.val = val;
        self.sum += val * n as f64;
        self.count += n;
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn val(&self) -> f64 {
        self.val
    }

    #[must_use]
    pub fn sum(&self) -> f64 {
        self.sum
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.count
    }

    #[must_use]
    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    /// Summary text, or `None` for [`Summary::None`].
    #[must_use]
    pub fn summary(&self) -> Option<String> {
        let p = self.precision;
        match self.summary {
            Summary::None => None,
            Summary::Average => Some(format!("{} {:.p$}", self.name, self.avg())),
            Summary::Sum => Some(format!("{} {:.p$}", self.name, self.sum)),
            Summary::Count => Some(format!("{} {}", self.name, self.count)),
        }
    }
}

impl fmt::Display for AverageMeter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (w, p) = (self.width, self.precision);
        write!(f, "{} {:w$.p$} ({:w$.p$})", self.name, self.val, self.avg())
    }
}

/// Prefix plus a batch counter padded to the width of the total.
#[derive(Clone, Debug)]
pub struct ProgressMeter {
    num_batches: usize,
    prefix: String,
}

impl ProgressMeter {
    pub fn new(num_batches: usize, prefix: impl Into<String>) -> Self {
        Self {
            num_batches,
            prefix: prefix.into(),
        }
    }

    /// `"{prefix}[ batch/total]\tmeter\tmeter..."`
    #[must_use]
    pub fn display(&self, batch: usize, meters: &[&AverageMeter]) -> String {
        let digits = self.num_batches.to_string().len();
        let mut entries = vec![format!(
            "{}[{batch:>digits$}/{}]",
            self.prefix, self.num_batches
        )];
        entries.extend(meters.iter().map(ToString::to_string));
        entries.join("\t")
    }

    /// `" * meter summary meter summary..."`, skipping meters without a summary.
    #[must_use]
    pub fn display_summary(&self, meters: &[&AverageMeter]) -> String {
        let mut entries = vec![" *".to_string()];
        entries.extend(meters.iter().filter_map(|m| m.summary()));
        entries.join(" ")
    }
}
