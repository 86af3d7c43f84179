//! Query filter for stored results.

use chrono::{DateTime, Utc};
use rusqlite::types::Value;

use crate::storage::encode_ts;

pub const DEFAULT_LIMIT: u32 = 20;
pub const MAX_LIMIT: u32 = 1000;

/// Conditions combined with AND; each list matches any of its entries.
#[derive(Debug, Clone)]
pub struct ResultFilter {
    /// Inclusive lower bound.
    pub start: Option<DateTime<Utc>>,
    /// Inclusive upper bound.
    pub end: Option<DateTime<Utc>>,
    pub servers: Vec<String>,
    /// Provider names or provider ids.
    pub providers: Vec<String>,
    pub schedule_ids: Vec<String>,
    pub limit: u32,
    pub offset: u32,
}

impl Default for ResultFilter {
    fn default() -> Self {
        Self {
            start: None,
            end: None,
            servers: Vec::new(),
            providers: Vec::new(),
            schedule_ids: Vec::new(),
            limit: DEFAULT_LIMIT,
            offset: 0,
        }
    }
}

impl ResultFilter {
    /// Render the WHERE clause and its positional parameters.
    pub(crate) fn where_clause(&self) -> (String, Vec<Value>) {
        let mut clauses = Vec::new();
        let mut params = Vec::new();

        if let Some(start) = &self.start {
            clauses.push("timestamp >= ?".to_string());
            params.push(Value::Text(encode_ts(start)));
        }
        if let Some(end) = &self.end {
            clauses.push("timestamp <= ?".to_string());
            params.push(Value::Text(encode_ts(end)));
        }
        if !self.servers.is_empty() {
            clauses.push(format!("server_name IN ({})", placeholders(self.servers.len())));
            params.extend(self.servers.iter().cloned().map(Value::Text));
        }
        if !self.providers.is_empty() {
            let marks = placeholders(self.providers.len());
            clauses.push(format!("(provider_name IN ({marks}) OR provider_id IN ({marks}))"));
            params.extend(self.providers.iter().cloned().map(Value::Text));
            params.extend(self.providers.iter().cloned().map(Value::Text));
        }
        if !self.schedule_ids.is_empty() {
            clauses.push(format!("schedule_id IN ({})", placeholders(self.schedule_ids.len())));
            params.extend(self.schedule_ids.iter().cloned().map(Value::Text));
        }

        if clauses.is_empty() {
            (String::new(), params)
        } else {
            (format!(" WHERE {}", clauses.join(" AND ")), params)
        }
    }

    pub(crate) fn effective_limit(&self) -> u32 {
        match self.limit {
            0 => DEFAULT_LIMIT,
            n => n.min(MAX_LIMIT),
        }
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_filter_has_no_where() {
        let (sql, params) = ResultFilter::default().where_clause();
        assert!(sql.is_empty());
        assert!(params.is_empty());
    }

    #[test]
    fn test_clauses_and_params_line_up() {
        let filter = ResultFilter {
            servers: vec!["a".into(), "b".into()],
            providers: vec!["iperf3".into()],
            ..Default::default()
        };
        let (sql, params) = filter.where_clause();
        assert_eq!(
            sql,
            " WHERE server_name IN (?, ?) AND (provider_name IN (?) OR provider_id IN (?))"
        );
        assert_eq!(params.len(), sql.matches('?').count());
    }

    #[test]
    fn test_limit_defaults_and_caps() {
        let mut f = ResultFilter {
            limit: 0,
            ..Default::default()
        };
        assert_eq!(f.effective_limit(), DEFAULT_LIMIT);
        f.limit = 50_000;
        assert_eq!(f.effective_limit(), MAX_LIMIT);
    }
}
