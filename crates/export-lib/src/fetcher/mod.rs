//! Allocation API queries
//!
//! This module provides:
//! - Validated allocation query parameters
//! - The `AllocationSource` seam the runner fetches through
//! - An HTTP client for the OpenCost allocation endpoint

mod client;
mod response;

pub use client::{AllocationClient, ClientConfig, DEFAULT_FETCH_TIMEOUT};
pub use response::AllocationResponse;

use crate::error::ExportError;
use async_trait::async_trait;

/// Parameters of a single allocation query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationQuery {
    /// Window specifier understood by the API ("7d", "yesterday", "month", ...)
    pub window: String,
    /// Ordered aggregation dimensions ("namespace", "pod", "label:team", ...)
    pub aggregate: Vec<String>,
    pub accumulate: bool,
    pub include_idle: bool,
    pub share_idle: Option<bool>,
    pub idle_by_node: Option<bool>,
}

impl AllocationQuery {
    pub fn new(window: impl Into<String>, aggregate: Vec<String>) -> Self {
        Self {
            window: window.into(),
            aggregate,
            accumulate: true,
            include_idle: false,
            share_idle: None,
            idle_by_node: None,
        }
    }

    /// Parse a comma-separated dimension list, dropping blanks
    pub fn parse_aggregate(dims: &str) -> Vec<String> {
        dims.split(',')
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn with_accumulate(mut self, accumulate: bool) -> Self {
        self.accumulate = accumulate;
        self
    }

    pub fn with_include_idle(mut self, include_idle: bool) -> Self {
        self.include_idle = include_idle;
        self
    }

    pub fn with_share_idle(mut self, share_idle: bool) -> Self {
        self.share_idle = Some(share_idle);
        self
    }

    pub fn with_idle_by_node(mut self, idle_by_node: bool) -> Self {
        self.idle_by_node = Some(idle_by_node);
        self
    }

    /// Reject parameters the API cannot answer
    pub fn validate(&self) -> Result<(), ExportError> {
        if self.window.trim().is_empty() {
            return Err(ExportError::InvalidQuery(
                "window specifier must not be empty".to_string(),
            ));
        }
        if self.aggregate.is_empty() {
            return Err(ExportError::InvalidQuery(
                "at least one aggregation dimension is required".to_string(),
            ));
        }
        if let Some(pos) = self.aggregate.iter().position(|d| d.trim().is_empty()) {
            return Err(ExportError::InvalidQuery(format!(
                "aggregation dimension {} is blank",
                pos + 1
            )));
        }
        Ok(())
    }

    /// Query string pairs in the order they are sent
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("window", self.window.trim().to_string()),
            (
                "aggregate",
                self.aggregate
                    .iter()
                    .map(|d| d.trim())
                    .collect::<Vec<_>>()
                    .join(","),
            ),
            ("accumulate", self.accumulate.to_string()),
            ("includeIdle", self.include_idle.to_string()),
        ];
        if let Some(share_idle) = self.share_idle {
            pairs.push(("shareIdle", share_idle.to_string()));
        }
        if let Some(idle_by_node) = self.idle_by_node {
            pairs.push(("idleByNode", idle_by_node.to_string()));
        }
        pairs
    }
}

/// Anything that can answer an allocation query
#[async_trait]
pub trait AllocationSource: Send + Sync {
    /// Issue one query; no retries happen here
    async fn fetch(&self, query: &AllocationQuery) -> Result<AllocationResponse, ExportError>;

    /// Human-readable endpoint for logs
    fn endpoint(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_aggregate_keeps_order() {
        assert_eq!(
            AllocationQuery::parse_aggregate("namespace, pod ,,label:team"),
            vec!["namespace", "pod", "label:team"]
        );
        assert!(AllocationQuery::parse_aggregate(" , ").is_empty());
    }

    #[test]
    fn test_validate_rejects_empty_inputs() {
        let query = AllocationQuery::new("", vec!["namespace".into()]);
        assert!(matches!(query.validate(), Err(ExportError::InvalidQuery(_))));

        let query = AllocationQuery::new("7d", vec![]);
        assert!(matches!(query.validate(), Err(ExportError::InvalidQuery(_))));

        let query = AllocationQuery::new("7d", vec!["namespace".into()]);
        assert!(query.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_blank_dimension() {
        let query = AllocationQuery::new("7d", vec!["".into(), "namespace".into()]);
        match query.validate() {
            Err(ExportError::InvalidQuery(msg)) => assert!(msg.contains("dimension 1")),
            other => panic!("expected InvalidQuery, got {:?}", other),
        }

        let query = AllocationQuery::new("7d", vec!["namespace".into(), "  ".into()]);
        assert!(matches!(query.validate(), Err(ExportError::InvalidQuery(_))));
    }

    #[test]
    fn test_query_pairs_trim_dimensions() {
        let query = AllocationQuery::new(" 7d ", vec![" namespace".into(), "pod ".into()]);
        let pairs = query.query_pairs();
        assert_eq!(pairs[0], ("window", "7d".to_string()));
        assert_eq!(pairs[1], ("aggregate", "namespace,pod".to_string()));
    }

    #[test]
    fn test_query_pairs_omit_unset_idle_options() {
        let query = AllocationQuery::new("yesterday", vec!["namespace".into(), "pod".into()])
            .with_include_idle(true);
        let pairs = query.query_pairs();
        assert_eq!(
            pairs,
            vec![
                ("window", "yesterday".to_string()),
                ("aggregate", "namespace,pod".to_string()),
                ("accumulate", "true".to_string()),
                ("includeIdle", "true".to_string()),
            ]
        );

        let pairs = query.with_share_idle(false).query_pairs();
        assert_eq!(pairs.last(), Some(&("shareIdle", "false".to_string())));
    }
}
