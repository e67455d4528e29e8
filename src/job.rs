//! Job specification loading and validation.
//!
//! A job spec is a JSON file naming a crawl campaign, its seed URLs, and the
//! crawl configuration shared by the seeds. Problems are collected into a
//! field → problem map and returned as one `InvalidJobSpec` error rather
//! than failing on the first issue.

use std::path::Path;

use serde::Deserialize;
use tracing::info;

use crate::error::{CrawlError, Result, ValidationErrors};
use crate::frontier::Frontier;
use crate::model::{Job, JobConf};
use crate::surt;

/// On-disk shape of a job specification file.
#[derive(Debug, Clone, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub seeds: Vec<String>,
    #[serde(flatten)]
    pub conf: JobConf,
}

impl JobSpec {
    /// Parse a spec from JSON text. Structural errors (bad JSON, wrong
    /// types) surface as a single "spec" problem.
    pub fn parse(raw: &str) -> Result<Self> {
        let spec: JobSpec = serde_json::from_str(raw).map_err(|e| {
            let mut errors = ValidationErrors::new();
            errors.insert("spec".to_string(), e.to_string());
            CrawlError::InvalidJobSpec(errors)
        })?;
        spec.validate()?;
        Ok(spec)
    }

    /// Semantic validation: every problem found, keyed by field.
    fn validate(&self) -> Result<()> {
        let mut errors = ValidationErrors::new();

        if self.name.trim().is_empty() {
            errors.insert("name".to_string(), "must not be empty".to_string());
        }

        if self.seeds.is_empty() {
            errors.insert("seeds".to_string(), "at least one seed required".to_string());
        }
        for (i, seed) in self.seeds.iter().enumerate() {
            if let Err(e) = surt::canonical_surt(seed) {
                errors.insert(format!("seeds[{i}]"), e.to_string());
            }
        }

        if self.conf.username.is_some() != self.conf.password.is_some() {
            errors.insert(
                "username/password".to_string(),
                "username and password must be provided together".to_string(),
            );
        }

        if let Some(proxy) = &self.conf.proxy {
            if !proxy.contains(':') {
                errors.insert(
                    "proxy".to_string(),
                    "expected host:port".to_string(),
                );
            }
        }

        if let Some(params) = &self.conf.behavior_parameters {
            if !params.is_object() {
                errors.insert(
                    "behavior_parameters".to_string(),
                    "must be a json object".to_string(),
                );
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(CrawlError::InvalidJobSpec(errors))
        }
    }
}

/// Load a spec file and create the job with its seed sites and pages.
pub async fn new_job_file(frontier: &Frontier, path: &Path) -> Result<Job> {
    let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
        let mut errors = ValidationErrors::new();
        errors.insert("file".to_string(), format!("{}: {e}", path.display()));
        CrawlError::InvalidJobSpec(errors)
    })?;

    let spec = JobSpec::parse(&raw)?;
    let job = frontier.new_job(&spec.name, &spec.conf, &spec.seeds).await?;
    info!(job = %spec.name, seeds = spec.seeds.len(), "job created from spec file");
    Ok(job)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_valid_spec() {
        let spec = JobSpec::parse(
            r#"{"name": "test-campaign", "seeds": ["http://example.com/"]}"#,
        )
        .unwrap();
        assert_eq!(spec.name, "test-campaign");
        assert_eq!(spec.conf.max_hops, 3);
    }

    #[test]
    fn full_spec_with_conf() {
        let spec = JobSpec::parse(
            r#"{
                "name": "campaign",
                "seeds": ["http://example.com/", "https://other.org/"],
                "time_limit": 3600,
                "max_pages": 100,
                "max_hops": 2,
                "ignore_robots": true,
                "proxy": "localhost:8000",
                "behavior_parameters": {"parameter_username": "x"},
                "username": "u",
                "password": "p"
            }"#,
        )
        .unwrap();
        assert_eq!(spec.conf.time_limit, Some(3600));
        assert_eq!(spec.conf.max_hops, 2);
        assert!(spec.conf.ignore_robots);
    }

    #[test]
    fn problems_collected_per_field() {
        let err = JobSpec::parse(
            r#"{"name": "", "seeds": ["not a url"], "username": "u"}"#,
        )
        .unwrap_err();
        let CrawlError::InvalidJobSpec(errors) = err else {
            panic!("expected InvalidJobSpec");
        };
        assert!(errors.contains_key("name"));
        assert!(errors.contains_key("seeds[0]"));
        assert!(errors.contains_key("username/password"));
    }

    #[test]
    fn empty_seeds_rejected() {
        let err = JobSpec::parse(r#"{"name": "x", "seeds": []}"#).unwrap_err();
        let CrawlError::InvalidJobSpec(errors) = err else {
            panic!("expected InvalidJobSpec");
        };
        assert!(errors.contains_key("seeds"));
    }

    #[test]
    fn malformed_json_is_a_spec_problem() {
        let err = JobSpec::parse("{not json").unwrap_err();
        assert!(matches!(err, CrawlError::InvalidJobSpec(_)));
    }
}
