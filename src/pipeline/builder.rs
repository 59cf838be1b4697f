//! Build a [`Pipeline`] from a [`PipelineConfig`].

use crate::commitlog::{CommitLog, CommitLogOptions};
use crate::config::{PipelineConfig, StageConfig};
use crate::error::{Result, ResultExt, TransitError};
use crate::events::{log_emit, EmitFn};
use crate::offset::LogManager;
use crate::pipeline::executor::{Pipeline, PipelineOptions};
use crate::pipeline::id::StageId;
use crate::pipeline::stage::{NamespaceFilter, StageSpec, Transform};
use crate::pipeline::tree::StageTree;
use crate::registry::Registry;
use crate::state::{FileStore, Store};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Name of the source commit log directory under `data_dir`.
pub const COMMIT_LOG_DIR: &str = "commitlog";

/// Resolves adaptor and function names against a [`Registry`] and lays out
/// the on-disk state under the configured data directory:
///
/// ```text
/// data_dir/
///   commitlog/                    source records
///   __consumer_offsets-<stage>/   one offset log per non-root stage
///   transit_state.json            when state_interval_ms is set
/// ```
pub struct PipelineBuilder<'a> {
    config: PipelineConfig,
    registry: &'a Registry,
    emit: EmitFn,
}

impl<'a> PipelineBuilder<'a> {
    pub fn new(config: PipelineConfig, registry: &'a Registry) -> Self {
        Self {
            config,
            registry,
            emit: log_emit(),
        }
    }

    /// Where events go. Defaults to the log.
    pub fn emit(mut self, emit: EmitFn) -> Self {
        self.emit = emit;
        self
    }

    /// Build the stage tree only.
    pub fn build_tree(&self) -> Result<StageTree> {
        check_names(&self.config.source)?;
        let data_dir = self.data_dir()?;
        let source = &self.config.source;
        if !source.transforms.is_empty() {
            return Err(TransitError::Config(format!(
                "source '{}' cannot have transforms, attach them to a child",
                source.name
            )));
        }

        let adaptor = self.registry.adaptor(&source.kind, &source.config)?;
        let mut options = CommitLogOptions::new(data_dir.join(COMMIT_LOG_DIR));
        if let Some(max) = self.config.max_segment_bytes {
            options = options.max_segment_bytes(max);
        }
        let log = CommitLog::open(options)?;
        tracing::info!(
            path = %log.path().display(),
            newest_offset = log.newest_offset(),
            "Source commit log ready"
        );

        let root = StageSpec::new(&source.name, &source.kind)
            .namespace(source.namespace.as_deref().unwrap_or_default())?
            .client(adaptor.client()?)
            .reader(adaptor.reader()?)
            .commit_log(Arc::new(log));
        let mut tree = StageTree::new(root);
        for child in &source.children {
            self.add_stage(&mut tree, StageId::ROOT, child, &data_dir)?;
        }
        tree.validate()?;
        Ok(tree)
    }

    /// Build the tree and wrap it in a ready-to-run pipeline.
    pub fn build(self) -> Result<Pipeline> {
        let tree = self.build_tree()?;
        let state_interval = self.config.state_interval();
        let state_store = match state_interval {
            Some(_) => Some(Arc::new(FileStore::open(self.data_dir()?)?) as Arc<dyn Store>),
            None => None,
        };
        let defaults = PipelineOptions::default();
        let options = PipelineOptions {
            version: self.config.version.clone(),
            metrics_interval: self.config.metrics_interval(),
            state_store,
            state_interval: state_interval.unwrap_or(defaults.state_interval),
            compaction_interval: self
                .config
                .compaction_interval()
                .unwrap_or(defaults.compaction_interval),
        };
        Pipeline::new(tree, self.emit, options)
    }

    fn data_dir(&self) -> Result<PathBuf> {
        let dir = self.config.data_dir()?;
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create data directory {}", dir.display()))?;
        Ok(dir)
    }

    fn add_stage(
        &self,
        tree: &mut StageTree,
        parent: StageId,
        config: &StageConfig,
        data_dir: &Path,
    ) -> Result<()> {
        let adaptor = self.registry.adaptor(&config.kind, &config.config)?;
        let mut spec = StageSpec::new(&config.name, &config.kind)
            .namespace(config.namespace.as_deref().unwrap_or_default())?
            .client(adaptor.client()?)
            .writer(adaptor.writer()?)
            .offsets(Arc::new(LogManager::open(data_dir, &config.name)?));

        for transform in &config.transforms {
            let function = self.registry.function(&transform.name, &transform.config)?;
            let filter = NamespaceFilter::new(transform.namespace.as_deref().unwrap_or_default())?;
            spec = spec.transform(Transform::new(&transform.name, function).with_filter(filter));
        }

        let id = tree.add_child(parent, spec)?;
        tracing::debug!(path = %tree[id].path(), kind = %config.kind, "Stage added");
        for child in &config.children {
            self.add_stage(tree, id, child, data_dir)?;
        }
        Ok(())
    }
}

/// Stage names key offset logs and endpoints, so they must be unique.
fn check_names(source: &StageConfig) -> Result<()> {
    fn walk<'c>(stage: &'c StageConfig, seen: &mut BTreeSet<&'c str>) -> Result<()> {
        if stage.name.is_empty() {
            return Err(TransitError::Config("stage name may not be empty".into()));
        }
        if !seen.insert(&stage.name) {
            return Err(TransitError::Config(format!(
                "duplicate stage name '{}'",
                stage.name
            )));
        }
        stage.children.iter().try_for_each(|child| walk(child, seen))
    }
    walk(source, &mut BTreeSet::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransformConfig;
    use crate::events::noop_emit;
    use serde_json::json;

    fn memory(name: &str) -> StageConfig {
        StageConfig::new(name, "memory")
    }

    fn config(dir: &Path, source: StageConfig) -> PipelineConfig {
        PipelineConfig {
            version: "test".into(),
            data_dir: Some(dir.to_path_buf()),
            metrics_interval_ms: 100,
            state_interval_ms: None,
            max_segment_bytes: None,
            compaction_interval_ms: None,
            source,
        }
    }

    #[test]
    fn test_build_tree_layout() {
        let dir = tempfile::tempdir().unwrap();
        let mut out = memory("out");
        out.transforms.push(TransformConfig {
            name: "omit".into(),
            namespace: Some("/^db/".into()),
            config: serde_json::from_value(json!({"fields": ["secret"]})).unwrap(),
        });
        let source = memory("in").with_child(out.with_child(memory("audit")));
        let registry = Registry::with_builtins();

        let tree = PipelineBuilder::new(config(dir.path(), source), &registry)
            .build_tree()
            .unwrap();

        assert_eq!(tree.len(), 3);
        assert!(tree.root().commit_log().is_some());
        assert_eq!(tree[StageId(2)].path(), "in/out/audit");
        assert!(dir.path().join(COMMIT_LOG_DIR).is_dir());
        assert!(dir.path().join("__consumer_offsets-out").is_dir());
        assert!(dir.path().join("__consumer_offsets-audit").is_dir());
    }

    #[test]
    fn test_build_rejects_bad_trees() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::with_builtins();
        let build = |source: StageConfig| {
            PipelineBuilder::new(config(dir.path(), source), &registry)
                .emit(noop_emit())
                .build()
        };

        assert!(build(memory("in")).is_err());
        assert!(build(memory("in").with_child(memory("in"))).is_err());
        assert!(matches!(
            build(memory("in").with_child(StageConfig::new("out", "mongodb"))),
            Err(TransitError::AdaptorNotFound(_))
        ));

        let mut source = memory("in").with_child(memory("out"));
        source.transforms.push(TransformConfig {
            name: "pick".into(),
            namespace: None,
            config: Default::default(),
        });
        assert!(build(source).is_err());
    }

    #[test]
    fn test_state_store_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::with_builtins();
        let mut config = config(dir.path(), memory("in").with_child(memory("out")));
        config.state_interval_ms = Some(50);
        let pipeline = PipelineBuilder::new(config, &registry)
            .emit(noop_emit())
            .build()
            .unwrap();
        assert_eq!(pipeline.version(), "test");
        pipeline.stop();
        assert!(pipeline.is_stopped());
    }
}
