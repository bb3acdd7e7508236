//! Test harness for isolated service runs.
//!
//! Each harness owns a temporary directory with a `docs/` folder for input
//! documents and a `data/` folder for checkpoint logs and the job database.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;

use fieldmill::config::schema::Config;
use fieldmill::{CheckpointStore, ExtractionService, FieldSpec, JobId};

use super::ScriptedProvider;

pub struct TestHarness {
    temp_dir: TempDir,
    pub docs_dir: PathBuf,
    pub data_dir: PathBuf,
    /// Keep jobs in a database file inside the temp directory.
    with_database: bool,
}

impl TestHarness {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let docs_dir = temp_dir.path().join("docs");
        let data_dir = temp_dir.path().join("data");
        std::fs::create_dir_all(&docs_dir).expect("Failed to create docs directory");

        Self {
            temp_dir,
            docs_dir,
            data_dir,
            with_database: false,
        }
    }

    pub fn with_database() -> Self {
        Self {
            with_database: true,
            ..Self::new()
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.temp_dir.path().join("jobs.db")
    }

    pub fn config(&self) -> Config {
        Config {
            data_directory: self.data_dir.to_string_lossy().into_owned(),
            database: self
                .with_database
                .then(|| self.database_path().to_string_lossy().into_owned()),
            max_concurrent_jobs: 2,
            ..Config::default()
        }
    }

    /// Writes placeholder documents and returns their paths.
    pub fn documents(&self, names: &[&str]) -> Vec<PathBuf> {
        names
            .iter()
            .map(|name| {
                let path = self.docs_dir.join(name);
                std::fs::write(&path, b"%PDF-1.4\n%test\n").expect("Failed to write document");
                path
            })
            .collect()
    }

    pub fn service(&self, provider: Arc<ScriptedProvider>) -> ExtractionService {
        ExtractionService::new(&self.config(), provider).expect("Failed to build service")
    }

    pub fn checkpoints(&self) -> CheckpointStore {
        CheckpointStore::new(&self.data_dir)
    }

    pub fn log_path(&self, id: &JobId) -> PathBuf {
        self.checkpoints().log_path(id)
    }
}

/// Fields used by most tests.
pub fn policy_fields() -> Vec<FieldSpec> {
    vec![
        FieldSpec::new("country", "Country the document covers").unwrap(),
        FieldSpec::new("country_alpha_3_code", "ISO alpha-3 code").unwrap(),
        FieldSpec::new("has_policy", "Does the country have the policy?").unwrap(),
    ]
}
