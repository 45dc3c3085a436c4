//! Rill CLI library - testable functions behind the `rill` binary

pub mod config;

use anyhow::{Context, Result};
use rill_core::ast::Statement;
use rill_core::validate::validate;
use rill_parser::parse;
use rill_runtime::{
    ConsoleSink, FileSink, FileSource, FileStore, MemoryStore, StateStore, TopologyBuilder,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::RuleFile;

/// Parse and validate one statement. Returns the diagnostics text, empty
/// when the statement is clean.
pub fn check_sql(sql: &str) -> Result<String> {
    let stmt = parse(sql).map_err(|e| anyhow::anyhow!("Parse error: {}", e))?;
    match stmt {
        Statement::Select(select) => {
            let result = validate(&select);
            if let Some(err) = result.first_error() {
                anyhow::bail!("Validation error: {}", err.message);
            }
            Ok(result.format())
        }
        Statement::CreateStream(_) => Ok(String::new()),
    }
}

/// Parse one statement and return its AST in debug form.
pub fn parse_sql(sql: &str) -> Result<String> {
    let stmt = parse(sql).map_err(|e| anyhow::anyhow!("Parse error: {}", e))?;
    Ok(format!("{:#?}", stmt))
}

/// Knobs of [`run_rule`] that are not part of the rule file
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// How long to keep the topology alive after every input is consumed,
    /// so that pending windows fire.
    pub linger: Duration,
    /// Overrides the rule file's output
    pub output: Option<PathBuf>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            linger: Duration::from_millis(1000),
            output: None,
        }
    }
}

/// Run a rule file to completion and return the final metric counters.
pub async fn run_rule(file: &RuleFile, opts: &RunOptions) -> Result<BTreeMap<String, i64>> {
    let mut builder = TopologyBuilder::new(file.rule.clone());
    for stream in file.stream_defs()? {
        let path = file
            .input(&stream.name)
            .with_context(|| format!("no input file for stream {}", stream.name))?
            .to_path_buf();
        builder = builder
            .source(stream.name.clone(), FileSource::new(stream.name.clone(), path))
            .stream(stream);
    }

    builder = match opts.output.as_ref().or(file.output.as_ref()) {
        Some(path) => builder.sink(FileSink::new(path.clone())),
        None => builder.sink(ConsoleSink::new()),
    };

    let store: Arc<dyn StateStore> = match &file.state_dir {
        Some(dir) => Arc::new(
            FileStore::open(dir)
                .with_context(|| format!("failed to open state dir {}", dir.display()))?,
        ),
        None => Arc::new(MemoryStore::new()),
    };

    let mut topo = builder.store(store).build()?;
    info!(rule = %file.rule.id, ops = ?topo.op_ids(), "starting rule");
    topo.open().await?;

    topo.sources_done().await;
    tokio::time::sleep(opts.linger).await;

    topo.cancel().await?;
    topo.wait_close().await;
    Ok(topo.metrics().snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_sql_valid() {
        let out = check_sql(
            "SELECT color, count(*) FROM demo GROUP BY color, TUMBLINGWINDOW(ss, 10)",
        )
        .unwrap();
        assert!(!out.contains("error:"));
    }

    #[test]
    fn test_check_sql_stream() {
        assert!(check_sql("CREATE STREAM demo (color STRING) WITH (FORMAT=\"json\")").is_ok());
    }

    #[test]
    fn test_check_sql_parse_error() {
        let err = check_sql("SELECT * FROM").unwrap_err();
        assert!(err.to_string().starts_with("Parse error"));
    }

    #[test]
    fn test_check_sql_validation_error() {
        let err = check_sql("SELECT abs(a, b) FROM demo").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Validation error: The arguments for abs should be 1."
        );
    }

    #[test]
    fn test_parse_sql() {
        let ast = parse_sql("SELECT a FROM demo WHERE a > 3").unwrap();
        assert!(ast.contains("Select"));
        assert!(ast.contains("demo"));
    }
}
