//! Test data builders for creating test objects

use serde_json::{json, Value};
use std::path::Path;
use transit::adaptor::memory::MemoryAdaptor;
use transit::adaptor::Adaptor;
use transit::config::{PipelineConfig, StageConfig, TransformConfig};
use transit::{Op, Record, Registry};

/// Builder for creating test Records
pub struct RecordBuilder {
    op: Op,
    namespace: String,
    document: serde_json::Map<String, Value>,
}

impl RecordBuilder {
    pub fn new(id: i64) -> Self {
        let mut document = serde_json::Map::new();
        document.insert("_id".into(), json!(id));
        Self {
            op: Op::Insert,
            namespace: "test.items".to_string(),
            document,
        }
    }

    pub fn namespace(mut self, namespace: &str) -> Self {
        self.namespace = namespace.to_string();
        self
    }

    pub fn op(mut self, op: Op) -> Self {
        self.op = op;
        self
    }

    pub fn field(mut self, key: &str, value: Value) -> Self {
        self.document.insert(key.to_string(), value);
        self
    }

    pub fn build(self) -> Record {
        Record::new(self.op, self.namespace, self.document)
    }
}

/// `count` insert records in `test.items` with `_id` 0.. and a `name`.
pub fn records(count: i64) -> Vec<Record> {
    (0..count)
        .map(|i| RecordBuilder::new(i).field("name", json!(format!("item-{}", i))).build())
        .collect()
}

/// Builder for a pipeline whose stages are memory adaptors registered under
/// their stage names.
pub struct PipelineFixture {
    registry: Registry,
    source: StageConfig,
    state_interval_ms: Option<u64>,
    max_segment_bytes: Option<u64>,
    compaction_interval_ms: Option<u64>,
}

impl PipelineFixture {
    pub fn new(source: MemoryAdaptor) -> Self {
        let mut registry = Registry::with_builtins();
        register(&mut registry, "in", source);
        Self {
            registry,
            source: StageConfig::new("in", "in"),
            state_interval_ms: None,
            max_segment_bytes: None,
            compaction_interval_ms: None,
        }
    }

    /// Attach a sink directly below the source.
    pub fn sink(mut self, name: &str, sink: &MemoryAdaptor) -> Self {
        register(&mut self.registry, name, sink.clone());
        self.source.children.push(StageConfig::new(name, name));
        self
    }

    /// Attach a sink whose transform chain is `transforms`.
    pub fn sink_with(
        mut self,
        name: &str,
        sink: &MemoryAdaptor,
        transforms: Vec<TransformConfig>,
    ) -> Self {
        register(&mut self.registry, name, sink.clone());
        let mut stage = StageConfig::new(name, name);
        stage.transforms = transforms;
        self.source.children.push(stage);
        self
    }

    pub fn state_interval_ms(mut self, ms: u64) -> Self {
        self.state_interval_ms = Some(ms);
        self
    }

    pub fn max_segment_bytes(mut self, bytes: u64) -> Self {
        self.max_segment_bytes = Some(bytes);
        self
    }

    pub fn compaction_interval_ms(mut self, ms: u64) -> Self {
        self.compaction_interval_ms = Some(ms);
        self
    }

    pub fn config(&self, data_dir: &Path) -> PipelineConfig {
        PipelineConfig {
            version: "test".to_string(),
            data_dir: Some(data_dir.to_path_buf()),
            metrics_interval_ms: 50,
            state_interval_ms: self.state_interval_ms,
            max_segment_bytes: self.max_segment_bytes,
            compaction_interval_ms: self.compaction_interval_ms,
            source: self.source.clone(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

fn register(registry: &mut Registry, name: &str, adaptor: MemoryAdaptor) {
    registry.register_adaptor(name, move |_| Ok(Box::new(adaptor.clone()) as Box<dyn Adaptor>));
}

/// A transform config for `name` with a JSON `config` table.
pub fn transform(name: &str, config: Value) -> TransformConfig {
    TransformConfig {
        name: name.to_string(),
        namespace: None,
        config: serde_json::from_value(config).unwrap(),
    }
}
