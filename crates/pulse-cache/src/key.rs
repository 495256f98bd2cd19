use std::fmt;

/// What an entry holds for its `(run, metric)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKind {
    Latest,
    Stats,
    /// The most recent window of points.
    Series,
}

impl CacheKind {
    pub const ALL: [CacheKind; 3] = [CacheKind::Latest, CacheKind::Stats, CacheKind::Series];

    pub fn as_str(self) -> &'static str {
        match self {
            CacheKind::Latest => "latest",
            CacheKind::Stats => "stats",
            CacheKind::Series => "series",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub run_id: String,
    pub metric_name: String,
    pub kind: CacheKind,
}

impl CacheKey {
    pub fn new(run_id: impl Into<String>, metric_name: impl Into<String>, kind: CacheKind) -> Self {
        Self {
            run_id: run_id.into(),
            metric_name: metric_name.into(),
            kind,
        }
    }

    pub fn latest(run_id: &str, metric_name: &str) -> Self {
        Self::new(run_id, metric_name, CacheKind::Latest)
    }

    pub fn stats(run_id: &str, metric_name: &str) -> Self {
        Self::new(run_id, metric_name, CacheKind::Stats)
    }

    pub fn series(run_id: &str, metric_name: &str) -> Self {
        Self::new(run_id, metric_name, CacheKind::Series)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.kind.as_str(), self.run_id, self.metric_name)
    }
}
