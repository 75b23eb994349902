//! Rate-limit report across credentials

use crate::state::RateLimitTable;
use std::collections::BTreeMap;

/// Name used for the summed row of an endpoint
pub const AGGREGATE_ROW: &str = "global";

/// Quota of one endpoint for one credential (or summed over all of them)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LimitUsage {
    pub limit: i64,
    pub remaining: i64,
}

impl LimitUsage {
    pub fn consumed(&self) -> i64 {
        self.limit - self.remaining
    }
}

/// Per-endpoint quota rows, keyed by endpoint then by credential name
#[derive(Debug, Clone, Default)]
pub struct LimitReport {
    rows: BTreeMap<String, BTreeMap<String, LimitUsage>>,
}

impl LimitReport {
    /// Builds a report from each credential's rate-limit table
    ///
    /// Every endpoint also gets an [`AGGREGATE_ROW`] summing all credentials.
    pub fn from_tables<'a, I>(tables: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a RateLimitTable)>,
    {
        let mut rows: BTreeMap<String, BTreeMap<String, LimitUsage>> = BTreeMap::new();
        for (worker, table) in tables {
            for (endpoint, entry) in table.entries() {
                let row = rows.entry(endpoint.to_string()).or_default();
                row.insert(
                    worker.to_string(),
                    LimitUsage {
                        limit: entry.limit,
                        remaining: entry.remaining,
                    },
                );
                let total = row.entry(AGGREGATE_ROW.to_string()).or_default();
                total.limit += entry.limit;
                total.remaining += entry.remaining;
            }
        }
        Self { rows }
    }

    /// Rows to print for every endpoint
    ///
    /// With `aggregate` only the summed row is kept; without `all` endpoints
    /// whose quota is untouched are left out.
    pub fn lines(&self, aggregate: bool, all: bool) -> Vec<(&str, &str, LimitUsage)> {
        let mut lines = Vec::new();
        for (endpoint, row) in &self.rows {
            for (worker, usage) in row {
                let is_total = worker == AGGREGATE_ROW;
                if aggregate != is_total {
                    continue;
                }
                if !all && usage.consumed() == 0 {
                    continue;
                }
                lines.push((endpoint.as_str(), worker.as_str(), *usage));
            }
        }
        lines
    }

    pub fn print(&self, aggregate: bool, all: bool) {
        let mut current = "";
        for (endpoint, worker, usage) in self.lines(aggregate, all) {
            if endpoint != current {
                println!("{}", endpoint);
                current = endpoint;
            }
            println!(
                "\t{}: {}/{} remaining",
                worker, usage.remaining, usage.limit
            );
        }
    }
}
